//! Handshake state machine for the exchange stream.
//!
//! Connection lifecycle: TLS dial (server-name pinned) → authentication →
//! heartbeat request → market subscription → steady-state streaming. Each
//! handshake phase waits for its ack under a 30-second read deadline;
//! `connection` and `heartbeat` frames received while waiting are skipped.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::auth::{is_invalid_session_error, Authenticator};
use crate::rest::MarketFilter;

use super::wire::{StreamConn, StreamError};

pub const BETFAIR_STREAM_HOST: &str = "stream-api.betfair.com";
pub const BETFAIR_STREAM_ADDRESS: &str = "stream-api.betfair.com:443";

const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Price/definition fields requested from the stream for every market.
const MARKET_DATA_FIELDS: [&str; 7] = [
    "EX_ALL_OFFERS",
    "EX_TRADED",
    "EX_MARKET_DEF",
    "EX_LTP",
    "EX_TRADED_VOL",
    "SP_TRADED",
    "SP_PROJECTED",
];

pub struct StreamClient {
    app_key: String,
    session_token: String,
    heartbeat_ms: u64,
    authenticator: Option<Authenticator>,
}

impl StreamClient {
    pub fn new(
        app_key: impl Into<String>,
        session_token: impl Into<String>,
        heartbeat_ms: u64,
        authenticator: Option<Authenticator>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            session_token: session_token.into(),
            heartbeat_ms,
            authenticator,
        }
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn set_session_token(&mut self, session_token: impl Into<String>) {
        self.session_token = session_token.into();
    }

    /// Open a TLS connection to the stream endpoint.
    pub async fn dial(&self) -> Result<StreamConn<TlsStream<TcpStream>>, StreamError> {
        debug!(address = BETFAIR_STREAM_ADDRESS, "connecting to exchange stream");
        let tcp = TcpStream::connect(BETFAIR_STREAM_ADDRESS).await?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs()? {
            let _ = roots.add(cert);
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(BETFAIR_STREAM_HOST)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let tls = connector.connect(server_name, tcp).await?;
        debug!("TLS connection established");
        Ok(StreamConn::new(tls))
    }

    /// Send the authentication request and wait for its ack.
    ///
    /// When the ack reports an invalid session and an authenticator is
    /// configured, a fresh token is obtained and held; the caller sees
    /// [`StreamError::SessionRefreshed`] and reconnects with the new token.
    pub async fn authenticate<S>(&mut self, conn: &mut StreamConn<S>) -> Result<(), StreamError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let request = json!({
            "op": "authentication",
            "id": 1,
            "appKey": self.app_key,
            "session": self.session_token,
        });
        debug!("sending authentication request");
        conn.write_json(&request).await?;

        loop {
            let payload = conn.read_message_timeout(HANDSHAKE_READ_TIMEOUT).await?;
            let op = extract_frame_op(&payload);

            match op.as_str() {
                "connection" => {
                    info!("received connection info");
                    continue;
                }
                "heartbeat" => {
                    debug!("received heartbeat while authenticating");
                    continue;
                }
                _ => {}
            }

            if let Err(message) = validate_ack("authentication", &payload) {
                error!(%message, "authentication validation failed");

                if is_invalid_session_error(&message) {
                    if let Some(authenticator) = &self.authenticator {
                        info!("session token expired, attempting to refresh");
                        match authenticator.login().await {
                            Ok(token) => {
                                self.session_token = token;
                                return Err(StreamError::SessionRefreshed);
                            }
                            Err(e) => {
                                return Err(StreamError::AuthenticationFailed(format!(
                                    "failed to refresh session token: {e}"
                                )));
                            }
                        }
                    }
                }
                return Err(StreamError::AuthenticationFailed(message));
            }

            info!("authenticated with exchange stream");
            return Ok(());
        }
    }

    /// Ask the server to emit heartbeats. No ack is awaited.
    pub async fn request_heartbeat<S>(&self, conn: &mut StreamConn<S>) -> Result<(), StreamError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let request = json!({
            "op": "heartbeat",
            "id": 2,
            "heartbeatMs": self.heartbeat_ms,
        });
        conn.write_json(&request).await
    }

    /// Subscribe to the market filter, resuming from the given clocks when
    /// they are non-empty, and wait for the subscription ack.
    pub async fn subscribe<S>(
        &self,
        conn: &mut StreamConn<S>,
        filter: &MarketFilter,
        initial_clk: &str,
        clk: &str,
    ) -> Result<(), StreamError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if !initial_clk.is_empty() {
            info!(initial_clk, "using stored initialClk for fast recovery");
        }
        if !clk.is_empty() {
            info!(clk, "using stored clk for fast recovery");
        }

        let subscription = build_subscription_message(filter, initial_clk, clk);
        conn.write_json(&subscription).await?;

        loop {
            let payload = conn.read_message_timeout(HANDSHAKE_READ_TIMEOUT).await?;
            let op = extract_frame_op(&payload);

            match op.as_str() {
                "connection" | "heartbeat" => {
                    debug!(%op, "skipping frame while waiting for subscription ack");
                    continue;
                }
                "marketSubscription" | "status" => match validate_ack("marketSubscription", &payload) {
                    Ok(()) => {
                        info!("market subscription confirmed");
                        return Ok(());
                    }
                    Err(message) => return Err(StreamError::SubscriptionFailed(message)),
                },
                _ => {
                    debug!(%op, "non-ack frame while waiting for subscription ack");
                    continue;
                }
            }
        }
    }
}

/// Build the `marketSubscription` request frame. Resume clocks are included
/// only when non-empty.
pub fn build_subscription_message(filter: &MarketFilter, initial_clk: &str, clk: &str) -> Value {
    let mut market_filter = serde_json::Map::new();
    if !filter.market_ids.is_empty() {
        market_filter.insert("marketIds".to_string(), json!(filter.market_ids));
    }
    if !filter.event_type_ids.is_empty() {
        market_filter.insert("eventTypeIds".to_string(), json!(filter.event_type_ids));
    }
    if !filter.market_countries.is_empty() {
        market_filter.insert("countryCodes".to_string(), json!(filter.market_countries));
    }
    if !filter.market_type_codes.is_empty() {
        market_filter.insert("marketTypes".to_string(), json!(filter.market_type_codes));
    }

    let mut message = json!({
        "op": "marketSubscription",
        "id": 3,
        "marketFilter": market_filter,
        "marketDataFilter": { "fields": MARKET_DATA_FIELDS },
    });

    if !initial_clk.is_empty() {
        message["initialClk"] = json!(initial_clk);
    }
    if !clk.is_empty() {
        message["clk"] = json!(clk);
    }

    message
}

fn extract_frame_op(raw: &[u8]) -> String {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct OpProbe {
        op: String,
    }
    serde_json::from_slice::<OpProbe>(raw)
        .map(|p| p.op)
        .unwrap_or_default()
}

/// Validate an ack frame: the op must match (or be `status`) and the status
/// field must be `SUCCESS`, case-insensitively, in either spelling.
fn validate_ack(expected_op: &str, raw: &[u8]) -> Result<(), String> {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Ack {
        op: String,
        status: String,
        #[serde(rename = "statusCode")]
        status_code: String,
        #[serde(rename = "errorMessage")]
        error_message: String,
        #[serde(rename = "errorCode")]
        error_code: String,
    }

    let ack: Ack = serde_json::from_slice(raw).map_err(|e| format!("decode ack: {e}"))?;

    if ack.op != expected_op && ack.op != "status" {
        return Err(format!("unexpected op {:?} (want {:?})", ack.op, expected_op));
    }

    let status = if ack.status.trim().is_empty() {
        &ack.status_code
    } else {
        &ack.status
    };
    if !status.trim().eq_ignore_ascii_case("SUCCESS") {
        let message = [ack.error_message.as_str(), ack.error_code.as_str(), "unknown error"]
            .into_iter()
            .find(|m| !m.trim().is_empty())
            .unwrap_or("unknown error");
        return Err(message.to_string());
    }

    Ok(())
}
