//! Interactive login against the Betfair identity service.
//!
//! Produces the session token used by both the stream handshake and the
//! REST client. The stream client also calls [`Authenticator::login`]
//! mid-run when the exchange reports the held session as invalid.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

const LOGIN_URL: &str = "https://identitysso.betfair.com/api/login";

pub struct Authenticator {
    app_key: String,
    username: String,
    password: String,
    login_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginResponse {
    #[serde(rename = "sessionToken")]
    session_token: String,
    token: String,
    #[serde(rename = "loginStatus")]
    login_status: String,
    status: String,
    #[serde(rename = "statusCode")]
    status_code: String,
    error: String,
    #[serde(rename = "errorDetails")]
    error_details: String,
}

impl Authenticator {
    pub fn new(app_key: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build login http client")?;

        Ok(Self {
            app_key: app_key.into(),
            username: username.into(),
            password: password.into(),
            login_url: LOGIN_URL.to_string(),
            client,
        })
    }

    /// Override the identity endpoint. Tests point this at a local listener.
    pub fn with_login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = url.into();
        self
    }

    /// Submit credentials and return a fresh session token.
    ///
    /// The token is taken from the response body when present, falling back
    /// to the `ssoid` session cookie.
    pub async fn login(&self) -> Result<String> {
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];

        let resp = self
            .client
            .post(&self.login_url)
            .header("X-Application", &self.app_key)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .context("perform login request")?;

        let status = resp.status();
        let cookie_token = resp
            .cookies()
            .find(|c| c.name().eq_ignore_ascii_case("ssoid"))
            .map(|c| c.value().to_string());
        let body = resp.text().await.context("read login response")?;

        if !status.is_success() {
            bail!("login failed with status {}: {}", status.as_u16(), body.trim());
        }

        let lr: LoginResponse = serde_json::from_str(&body)
            .with_context(|| format!("decode login response (body={})", body.trim()))?;

        let login_status =
            first_non_empty(&[lr.login_status.as_str(), lr.status.as_str(), lr.status_code.as_str()])
                .to_uppercase();
        if !login_status.is_empty() && login_status != "SUCCESS" {
            let message = first_non_empty(&[lr.error.as_str(), lr.error_details.as_str(), body.trim()]);
            bail!("login {}: {}", login_status, message);
        }

        let mut token = first_non_empty(&[lr.session_token.as_str(), lr.token.as_str()]).to_string();
        if token.is_empty() {
            token = cookie_token.unwrap_or_default();
        }
        if token.is_empty() {
            bail!("login response did not include a session token (body={})", body.trim());
        }

        Ok(token)
    }
}

/// Whether an error message reports the held session as unusable.
///
/// The exchange spells this a few different ways across endpoints; all are
/// matched case-insensitively.
pub fn is_invalid_session_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("invalid_session_information")
        || lowered.contains("unrecognisedcredentials")
        || lowered.contains("no_session")
}

fn first_non_empty<'a>(values: &[&'a str]) -> &'a str {
    values
        .iter()
        .copied()
        .find(|v| !v.trim().is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_login_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/api/login")
    }

    #[tokio::test]
    async fn test_login_returns_session_token() {
        let url = spawn_login_server(r#"{"sessionToken":"T2","loginStatus":"SUCCESS"}"#).await;
        let auth = Authenticator::new("app-key", "user", "pass")
            .unwrap()
            .with_login_url(url);

        let token = auth.login().await.unwrap();
        assert_eq!(token, "T2");
    }

    #[tokio::test]
    async fn test_login_failure_carries_error() {
        let url = spawn_login_server(r#"{"loginStatus":"INVALID_USERNAME_OR_PASSWORD"}"#).await;
        let auth = Authenticator::new("app-key", "user", "wrong")
            .unwrap()
            .with_login_url(url);

        let err = auth.login().await.unwrap_err();
        assert!(err.to_string().contains("INVALID_USERNAME_OR_PASSWORD"));
    }

    #[tokio::test]
    async fn test_login_token_field_fallback() {
        let url = spawn_login_server(r#"{"token":"ALT","status":"SUCCESS"}"#).await;
        let auth = Authenticator::new("app-key", "user", "pass")
            .unwrap()
            .with_login_url(url);

        assert_eq!(auth.login().await.unwrap(), "ALT");
    }

    #[test]
    fn test_invalid_session_classification() {
        assert!(is_invalid_session_error("INVALID_SESSION_INFORMATION"));
        assert!(is_invalid_session_error(
            "authentication failed: invalid_session_information"
        ));
        assert!(is_invalid_session_error("UNRECOGNISEDCREDENTIALS"));
        assert!(is_invalid_session_error("error: NO_SESSION"));
        assert!(!is_invalid_session_error("connection closed"));
        assert!(!is_invalid_session_error("timeout"));
    }
}
