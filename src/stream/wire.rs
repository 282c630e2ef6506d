//! Framing for the exchange stream connection.
//!
//! The stream speaks newline-delimited JSON over TLS. Individual frames may
//! arrive gzip-compressed; those are detected by the two-byte magic and
//! inflated before they reach the parser. The connection is generic over the
//! underlying byte stream so handshake logic can be exercised against an
//! in-memory duplex pipe.

use std::io::Read;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

/// Errors produced by the stream connection and handshake.
///
/// The recorder's retry classifier matches on these variants structurally,
/// so conditions like a mid-handshake session refresh are dedicated variants
/// rather than substrings of an error message.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for stream message")]
    Timeout,
    #[error("encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("session refreshed, retry connection")]
    SessionRefreshed,
    #[error("operation cancelled")]
    Cancelled,
}

/// A framed connection to the exchange stream.
pub struct StreamConn<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> StreamConn<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Serialize `v` as a single JSON line and flush it to the peer.
    pub async fn write_json<T: Serialize>(&mut self, v: &T) -> Result<(), StreamError> {
        let mut data = serde_json::to_vec(v)?;
        data.push(b'\n');
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next non-empty frame, inflating it if gzip-compressed.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, StreamError> {
        loop {
            let mut line = Vec::new();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(StreamError::ConnectionClosed);
            }
            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            if is_gzip(trimmed) {
                let inflated = ungzip(trimmed)?;
                return Ok(inflated.trim_ascii().to_vec());
            }
            return Ok(trimmed.to_vec());
        }
    }

    /// Like [`read_message`](Self::read_message) but bounded by a deadline.
    /// Handshake phases use this; the steady-state loop reads without one.
    pub async fn read_message_timeout(&mut self, deadline: Duration) -> Result<Vec<u8>, StreamError> {
        tokio::time::timeout(deadline, self.read_message())
            .await
            .map_err(|_| StreamError::Timeout)?
    }

    /// Half-close the write side. Errors are ignored; the connection is
    /// being abandoned either way.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn is_gzip(data: &[u8]) -> bool {
    data.len() > 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn ungzip(data: &[u8]) -> Result<Vec<u8>, StreamError> {
    let mut decoder = GzDecoder::new(data);
    let mut inflated = Vec::new();
    decoder.read_to_end(&mut inflated)?;
    Ok(inflated)
}
