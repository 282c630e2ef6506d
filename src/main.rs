use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use betfair_recorder::auth::Authenticator;
use betfair_recorder::config::Config;
use betfair_recorder::recorder::MarketRecorder;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = Config::from_env().context("failed to load configuration")?;

    if config.session_token.is_empty() {
        let authenticator = Authenticator::new(&config.app_key, &config.username, &config.password)?;
        config.session_token = authenticator
            .login()
            .await
            .context("interactive login failed")?;
        info!("obtained session token via interactive login");
    }

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let mut recorder = MarketRecorder::new(config.clone(), cancel)
        .await
        .context("failed to create market recorder")?;

    info!(market_ids = ?config.market_ids, "starting market recorder");

    if let Err(e) = recorder.run().await {
        error!(error = %e, "recorder terminated");
        return Err(e);
    }
    Ok(())
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("shutdown signal received");
        cancel.cancel();
    });
}
