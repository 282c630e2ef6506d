//! JSON-RPC client for the betting API.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::types::{MarketCatalogue, MarketFilter, MarketProjection, MarketSort};

const BETTING_URL: &str = "https://api.betfair.com/exchange/betting/json-rpc/v1";

pub struct RestClient {
    client: reqwest::Client,
    app_key: String,
    session_token: String,
    locale: String,
    base_url: String,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: String,
    params: &'a Value,
    id: i64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl RestClient {
    pub fn new(
        app_key: impl Into<String>,
        session_token: impl Into<String>,
        locale: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build betting api http client")?;

        Ok(Self {
            client,
            app_key: app_key.into(),
            session_token: session_token.into(),
            locale: locale.into(),
            base_url: BETTING_URL.to_string(),
        })
    }

    /// Override the betting endpoint. Tests point this at a local listener.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Swap the session token after a mid-run refresh.
    pub fn update_session_token(&mut self, session_token: impl Into<String>) {
        self.session_token = session_token.into();
    }

    pub async fn list_market_catalogue(
        &self,
        filter: &MarketFilter,
        projections: &[MarketProjection],
        sort: MarketSort,
        max_results: u32,
    ) -> Result<Vec<MarketCatalogue>> {
        let params = serde_json::json!({
            "filter": filter,
            "marketProjection": projections,
            "sort": sort,
            "maxResults": max_results,
            "locale": self.locale,
        });

        let result = self.call("listMarketCatalogue", &params).await?;
        serde_json::from_value(result).context("decode market catalogue result")
    }

    async fn call(&self, method: &str, params: &Value) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: format!("SportsAPING/v1.0/{method}"),
            params,
            id: 1,
        };

        let resp = self
            .client
            .post(&self.base_url)
            .header("Accept", "application/json")
            .header("X-Application", &self.app_key)
            .header("X-Authentication", &self.session_token)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;

        if !resp.status().is_success() {
            return Err(anyhow!("{method} failed with status {}", resp.status().as_u16()));
        }

        let rpc: JsonRpcResponse = resp
            .json()
            .await
            .with_context(|| format!("decode {method} response"))?;

        if let Some(err) = rpc.error {
            return Err(anyhow!("api error {}: {}", err.code, err.message));
        }

        Ok(rpc.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_rpc_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_list_market_catalogue_decodes_result() {
        let url = spawn_rpc_server(
            r#"{"jsonrpc":"2.0","result":[{"marketId":"1.248231892","marketName":"Win"}],"id":1}"#,
        )
        .await;
        let client = RestClient::new("app-key", "token", "en")
            .unwrap()
            .with_base_url(url);

        let filter = MarketFilter {
            market_ids: vec!["1.248231892".to_string()],
            ..Default::default()
        };
        let catalogues = client
            .list_market_catalogue(&filter, &[MarketProjection::Event], MarketSort::FirstToStart, 1)
            .await
            .unwrap();

        assert_eq!(catalogues.len(), 1);
        assert_eq!(catalogues[0].market_id, "1.248231892");
        assert_eq!(catalogues[0].market_name, "Win");
    }

    #[tokio::test]
    async fn test_rpc_error_is_surfaced() {
        let url = spawn_rpc_server(
            r#"{"jsonrpc":"2.0","error":{"code":-32099,"message":"ANGX-0003"},"id":1}"#,
        )
        .await;
        let client = RestClient::new("app-key", "token", "en")
            .unwrap()
            .with_base_url(url);

        let err = client
            .list_market_catalogue(&MarketFilter::default(), &[], MarketSort::FirstToStart, 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ANGX-0003"));
    }
}
