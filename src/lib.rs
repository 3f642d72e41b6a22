pub mod api;
pub mod appointment;
pub mod background;
pub mod clock;
pub mod config;
pub mod core_state;
pub mod crypto;
pub mod db;
pub mod directory;
pub mod identity;
pub mod models;
pub mod notify;
pub mod otp;
pub mod scheduling;
pub mod session;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigError};
use crate::core_state::{CoreError, CoreState};
use crate::notify::{HttpRelayMailer, LogMailer, MailError, Mailer};

/// Seconds allowed for one relay POST.
const RELAY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Store error: {0}")]
    Core(#[from] CoreError),
    #[error("Mail relay error: {0}")]
    Mail(#[from] MailError),
    #[error("Server error: {0}")]
    Server(#[from] api::ServerError),
    #[error("Startup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER)),
        )
        .init();
}

fn build_mailer(config: &AppConfig) -> Result<Arc<dyn Mailer>, StartupError> {
    Ok(match config.mail_relay_url.as_deref() {
        Some(url) => {
            tracing::info!(url, "Delivering mail through HTTP relay");
            Arc::new(HttpRelayMailer::new(url, RELAY_TIMEOUT_SECS)?)
        }
        None => {
            tracing::warn!("HEALTHSYNC_MAIL_RELAY_URL not set; mail is logged, not sent");
            Arc::new(LogMailer)
        }
    })
}

/// Start the service and block until Ctrl-C.
pub async fn run() -> Result<(), StartupError> {
    init_tracing();
    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    // The relay client is a blocking reqwest client, which must not be
    // built on a runtime worker.
    let (core, mailer, bind) = tokio::task::spawn_blocking(|| {
        let config = AppConfig::from_env()?;
        let bind = config.bind;
        let mailer = build_mailer(&config)?;
        let core = Arc::new(CoreState::open(config)?);
        Ok::<_, StartupError>((core, mailer, bind))
    })
    .await??;

    let delivery = background::start_delivery_worker(core.clone(), mailer);
    let sweeper = background::start_sweeper(core.clone());

    let mut server = api::start(core.clone(), bind).await?;
    tracing::info!(addr = %server.local_addr(), "Listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
    server.shutdown();
    server.stopped().await;

    // Joining the worker threads blocks; keep it off the runtime.
    let _ = tokio::task::spawn_blocking(move || {
        drop(delivery);
        drop(sweeper);
        if let Err(e) = core.flush_audit() {
            tracing::warn!(error = %e, "Final audit flush failed");
        }
    })
    .await;

    tracing::info!("{} stopped", config::APP_NAME);
    Ok(())
}
