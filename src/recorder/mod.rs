//! Stream recorder orchestration.
//!
//! A single task owns the connection, the per-market state records, and the
//! catalogue cache. Inbound `mcm` frames are demultiplexed into one
//! append-only log per market; a market's transition to `CLOSED` triggers the
//! terminal compress → upload → cleanup sequence for its log.

pub mod enrich;
pub mod extract;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::files::FileManager;
use crate::rest::{MarketCatalogue, MarketFilter, MarketProjection, MarketSort, RestClient};
use crate::storage::S3Storage;
use crate::stream::{StreamClient, StreamConn, StreamError};

use extract::{
    extract_change_type, extract_clocks, extract_event_info, extract_op, is_market_settled,
    market_change_id, market_change_status, strip_request_id,
};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Everything the recorder tracks for one market id. The writer slot is
/// cleared at settlement; the record itself (and its last status) persists so
/// the settled edge can only ever fire once.
#[derive(Default)]
struct MarketState {
    writer: Option<BufWriter<File>>,
    last_status: Option<String>,
}

pub struct MarketRecorder {
    config: Config,
    stream_client: StreamClient,
    rest_client: RestClient,
    file_manager: FileManager,
    storage: Option<S3Storage>,
    markets: HashMap<String, MarketState>,
    catalogues: HashMap<String, MarketCatalogue>,
    initial_clk: String,
    clk: String,
    max_retries: u32,
    retry_delay: Duration,
    resume_cleared: bool,
    cancel: CancellationToken,
}

impl MarketRecorder {
    pub async fn new(config: Config, cancel: CancellationToken) -> Result<Self> {
        let authenticator = if config.username.is_empty() {
            None
        } else {
            Some(Authenticator::new(&config.app_key, &config.username, &config.password)?)
        };
        let stream_client = StreamClient::new(
            &config.app_key,
            &config.session_token,
            config.heartbeat_ms,
            authenticator,
        );
        let rest_client = RestClient::new(&config.app_key, &config.session_token, "en")?;
        let file_manager = FileManager::new(&config.output_path);

        let storage = if config.s3_bucket.is_empty() {
            None
        } else {
            Some(
                S3Storage::new(&config.s3_bucket, &config.s3_base_path)
                    .await
                    .context("failed to initialize S3 storage")?,
            )
        };

        Ok(Self {
            config,
            stream_client,
            rest_client,
            file_manager,
            storage,
            markets: HashMap::new(),
            catalogues: HashMap::new(),
            initial_clk: String::new(),
            clk: String::new(),
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
            resume_cleared: false,
            cancel,
        })
    }

    /// Swap the REST client, e.g. for an endpoint override.
    pub fn with_rest_client(mut self, rest_client: RestClient) -> Self {
        self.rest_client = rest_client;
        self
    }

    pub fn initial_clk(&self) -> &str {
        &self.initial_clk
    }

    pub fn clk(&self) -> &str {
        &self.clk
    }

    pub fn market_status(&self, market_id: &str) -> Option<&str> {
        self.markets.get(market_id)?.last_status.as_deref()
    }

    pub fn has_open_writer(&self, market_id: &str) -> bool {
        self.markets
            .get(market_id)
            .map(|state| state.writer.is_some())
            .unwrap_or(false)
    }

    pub fn cache_catalogue(&mut self, market_id: impl Into<String>, catalogue: MarketCatalogue) {
        self.catalogues.insert(market_id.into(), catalogue);
    }

    pub fn cached_catalogue(&self, market_id: &str) -> Option<&MarketCatalogue> {
        self.catalogues.get(market_id)
    }

    /// Run until cancelled or the retry budget is exhausted. Both are fatal
    /// to the caller; cancellation surfaces as [`StreamError::Cancelled`].
    /// All buffered writers are flushed before returning.
    pub async fn run(&mut self) -> Result<()> {
        self.open_configured_writers()?;
        let result = self.run_connection_loop().await;
        self.flush_all_writers();
        result
    }

    async fn run_connection_loop(&mut self) -> Result<()> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown requested, stopping recorder");
                return Err(StreamError::Cancelled.into());
            }

            match self.establish_connection().await {
                Ok(mut conn) => {
                    attempt = 0;
                    self.resume_cleared = false;
                    info!("connection established, starting stream processing");

                    if let Err(e) = self.process_stream(&mut conn).await {
                        conn.shutdown().await;
                        if is_cancellation(&e) {
                            info!("shutdown requested, stopping recorder");
                            return Err(e);
                        }
                        // Unknown stream errors fail open: anything short
                        // of cancellation is worth another connection.
                        warn!(error = %e, "stream error, will retry");
                        if !self.backoff().await {
                            return Err(StreamError::Cancelled.into());
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    error!(error = %e, attempt, "failed to establish connection");

                    let session_refreshed = matches!(e, StreamError::SessionRefreshed);
                    if matches!(e, StreamError::SubscriptionFailed(_))
                        && !self.resume_cleared
                        && (!self.initial_clk.is_empty() || !self.clk.is_empty())
                    {
                        // The server may reject a resume outright; retrying with
                        // the same clocks would loop. One full resubscribe is
                        // allowed per recovery sequence.
                        warn!("subscription rejected while holding resume clocks, clearing clocks for a full resubscribe");
                        self.initial_clk.clear();
                        self.clk.clear();
                        self.resume_cleared = true;
                    }
                    if attempt >= self.max_retries {
                        return Err(anyhow::Error::new(e).context("max retries exceeded"));
                    }
                    if session_refreshed {
                        // Reconnect immediately with the refreshed token.
                        continue;
                    }
                    if !self.backoff().await {
                        return Err(StreamError::Cancelled.into());
                    }
                }
            }
        }
    }

    /// Sleep for the retry delay. Returns false when cancelled mid-sleep.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }

    async fn establish_connection(&mut self) -> Result<StreamConn<TlsStream<TcpStream>>, StreamError> {
        let mut conn = self.stream_client.dial().await?;

        if let Err(err) = self.stream_client.authenticate(&mut conn).await {
            conn.shutdown().await;
            if matches!(err, StreamError::SessionRefreshed) {
                // Both clients must carry the new token before any retry.
                self.config.session_token = self.stream_client.session_token().to_string();
                self.rest_client.update_session_token(self.stream_client.session_token());
            }
            return Err(err);
        }

        if let Err(err) = self.stream_client.request_heartbeat(&mut conn).await {
            conn.shutdown().await;
            return Err(err);
        }

        let filter = self.config.market_filter();
        if let Err(err) = self
            .stream_client
            .subscribe(&mut conn, &filter, &self.initial_clk, &self.clk)
            .await
        {
            conn.shutdown().await;
            return Err(err);
        }

        info!("subscription established, recording stream");
        Ok(conn)
    }

    /// Read and process frames until the connection errors or the recorder is
    /// cancelled. Cancellation surfaces as [`StreamError::Cancelled`].
    pub async fn process_stream<S>(&mut self, conn: &mut StreamConn<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StreamError::Cancelled.into());
            }
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled.into()),
                message = conn.read_message() => message?,
            };
            self.handle_payload(&payload).await?;
        }
    }

    /// Process one inbound frame: capture clocks, then demultiplex `mcm`
    /// market changes into their per-market logs.
    pub async fn handle_payload(&mut self, raw: &[u8]) -> Result<()> {
        let (initial_clk, clk) = extract_clocks(raw);
        if self.initial_clk.is_empty() && !initial_clk.is_empty() {
            self.initial_clk = initial_clk;
        }
        if !clk.is_empty() {
            self.clk = clk;
        }

        if extract_op(raw) != "mcm" {
            return Ok(());
        }
        if extract_change_type(raw) == "HEARTBEAT" {
            return Ok(());
        }

        let frame: Value = serde_json::from_slice(raw).context("failed to parse MCM message")?;
        let changes: Vec<Value> = match frame.get("mc").and_then(Value::as_array) {
            Some(mc) if !mc.is_empty() => mc.to_vec(),
            _ => return Ok(()),
        };

        let op = frame.get("op").cloned().unwrap_or(Value::Null);
        let pt = frame.get("pt").cloned().unwrap_or(Value::Null);
        let frame_clk = frame.get("clk").cloned().unwrap_or(Value::Null);

        for change in changes {
            let Some(market_id) = market_change_id(&change) else {
                continue;
            };
            let market_id = market_id.to_string();

            self.ensure_catalogue(&market_id).await;

            let mut just_settled = false;
            let mut new_status = String::new();
            if let Some(status) = market_change_status(&change) {
                new_status = status.to_string();
                let state = self.markets.entry(market_id.clone()).or_default();
                let was_settled = state
                    .last_status
                    .as_deref()
                    .map(is_market_settled)
                    .unwrap_or(false);
                just_settled = !was_settled && is_market_settled(&new_status);
                state.last_status = Some(new_status.clone());
            }

            if !self.has_open_writer(&market_id) {
                match self.file_manager.create_market_writer(&market_id) {
                    Ok(writer) => {
                        self.markets.entry(market_id.clone()).or_default().writer = Some(writer);
                        info!(%market_id, "created writer for new market");
                    }
                    Err(e) => {
                        error!(%market_id, error = %e, "failed to create writer for new market");
                    }
                }
            }

            // One frame per market: this change only, request id stripped.
            let mut single = json!({
                "op": op.clone(),
                "pt": pt.clone(),
                "clk": frame_clk.clone(),
                "mc": [change],
            });
            strip_request_id(&mut single);

            let mut enriched = single.clone();
            if let Some(catalogue) = self.catalogues.get(&market_id) {
                enrich::enrich_payload(catalogue, &mut enriched);
            }
            let line = match serde_json::to_string(&enriched) {
                Ok(line) => line,
                Err(e) => {
                    error!(%market_id, error = %e, "failed to marshal single market message");
                    continue;
                }
            };

            if let Some(writer) = self
                .markets
                .get_mut(&market_id)
                .and_then(|state| state.writer.as_mut())
            {
                if let Err(e) = writeln!(writer, "{line}") {
                    error!(%market_id, error = %e, "failed to write to file");
                    continue;
                }
                if let Err(e) = writer.flush() {
                    error!(%market_id, error = %e, "failed to flush file");
                    continue;
                }
            }

            if just_settled {
                info!(%market_id, status = %new_status, "market settled");
                if let Err(e) = self.handle_settlement(&market_id, &single).await {
                    error!(%market_id, error = %e, "failed to handle market settlement");
                }
                self.catalogues.remove(&market_id);
                debug!(%market_id, "removed market catalogue from cache");
            }
        }

        Ok(())
    }

    /// Fetch and cache the catalogue for a market on first sighting. Fetch
    /// failures are logged and never block stream processing.
    async fn ensure_catalogue(&mut self, market_id: &str) {
        if self.catalogues.contains_key(market_id) {
            return;
        }

        info!(%market_id, "fetching market catalogue");
        let filter = MarketFilter {
            market_ids: vec![market_id.to_string()],
            ..Default::default()
        };
        let projections = [
            MarketProjection::Event,
            MarketProjection::MarketDescription,
            MarketProjection::RunnerDescription,
            MarketProjection::EventType,
            MarketProjection::Competition,
        ];

        match self
            .rest_client
            .list_market_catalogue(&filter, &projections, MarketSort::FirstToStart, 1)
            .await
        {
            Ok(catalogues) => match catalogues.into_iter().next() {
                Some(catalogue) => {
                    info!(%market_id, market_name = %catalogue.market_name, "cached market catalogue");
                    self.catalogues.insert(market_id.to_string(), catalogue);
                }
                None => warn!(%market_id, "no market catalogue found"),
            },
            Err(e) => {
                error!(%market_id, error = %e, "failed to fetch market catalogue");
            }
        }
    }

    /// Terminal sequence for a just-settled market: close its writer,
    /// compress the log, upload the archive, and delete both files. Any
    /// failure leaves the local files in place.
    async fn handle_settlement(&mut self, market_id: &str, payload: &Value) -> Result<()> {
        if let Some(state) = self.markets.get_mut(market_id) {
            if let Some(mut writer) = state.writer.take() {
                if let Err(e) = writer.flush() {
                    error!(%market_id, error = %e, "failed to flush writer");
                }
            }
        }

        let event_info = match extract_event_info(payload) {
            Ok(info) => info,
            Err(e) => {
                error!(%market_id, error = %e, "failed to extract event info");
                return Ok(());
            }
        };

        let input_file = self.file_manager.market_file_path(market_id);
        let compressed_file = self.file_manager.compressed_file_path(market_id);

        if let Err(e) = self.file_manager.compress_to_bzip2(&input_file, &compressed_file) {
            error!(%market_id, error = %e, "failed to compress file");
            return Ok(());
        }
        info!(%market_id, file = %compressed_file.display(), "compressed market file");

        if let Some(storage) = &self.storage {
            let key = storage.build_key(&event_info, &format!("{market_id}.bz2"));
            if let Err(e) = storage.upload(&compressed_file, &key).await {
                error!(%market_id, %key, error = %e, "failed to upload to S3");
                return Ok(());
            }
            info!(%market_id, %key, "uploaded market file to S3");
            self.file_manager
                .cleanup_files([input_file.as_path(), compressed_file.as_path()]);
        }

        Ok(())
    }

    /// Eagerly create writers for statically configured market ids.
    pub fn open_configured_writers(&mut self) -> Result<()> {
        for market_id in self.config.market_ids.clone() {
            let writer = self
                .file_manager
                .create_market_writer(&market_id)
                .with_context(|| format!("open output file for market {market_id}"))?;
            self.markets.entry(market_id).or_default().writer = Some(writer);
        }
        Ok(())
    }

    fn flush_all_writers(&mut self) {
        for (market_id, state) in &mut self.markets {
            if let Some(writer) = state.writer.as_mut() {
                if let Err(e) = writer.flush() {
                    error!(%market_id, error = %e, "failed to flush writer on shutdown");
                }
            }
        }
    }
}

/// Cancellation is fatal and must never be retried.
fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StreamError>(), Some(StreamError::Cancelled))
}

