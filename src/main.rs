//! `coordinatord` — binds the HTTP/WebSocket router and runs it to
//! completion. Process wiring only; all behavior lives in the library
//! crate (see `src/lib.rs`).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use session_coordinator::config;
use session_coordinator::coordinator::Coordinator;
use session_coordinator::crypto::EnvelopeCipher;
use session_coordinator::ports::callback::HttpCallbackPort;
use session_coordinator::ports::codehost::HttpCodeHostPort;
use session_coordinator::ports::identity::HttpIdentityPort;
use session_coordinator::ports::provider::HttpProviderPort;
use session_coordinator::ports::{IdentityConfig, Ports};
use session_coordinator::secrets_store::SecretsStore;
use session_coordinator::{http, ws, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::load().context("loading configuration")?;

    tokio::fs::create_dir_all(&config.server.data_dir)
        .await
        .context("creating data directory")?;

    let cipher = EnvelopeCipher::from_base64_key(&config.crypto.master_key_b64)
        .context("master key is not a valid base64-encoded 32-byte key")?;

    let secrets_db_url = format!(
        "sqlite://{}?mode=rwc",
        config.server.data_dir.join("secrets.sqlite").display()
    );
    let secrets = SecretsStore::connect(
        &secrets_db_url,
        cipher.clone(),
        config.secrets.max_secrets_per_repo,
        config.secrets.max_value_bytes,
        config.secrets.max_aggregate_bytes,
    )
    .await
    .context("connecting to secrets store")?;

    let ports = Ports {
        provider: Arc::new(HttpProviderPort::new(config.ports.provider_base_url.clone())),
        codehost: Arc::new(HttpCodeHostPort::new(config.ports.codehost_base_url.clone())),
        identity: Arc::new(HttpIdentityPort::new(config.ports.identity_base_url.clone())),
        callback: Arc::new(HttpCallbackPort::new(config.crypto.callback_secret.clone())),
        identity_config: IdentityConfig {
            app_id: config.ports.identity_app_id.clone(),
            private_key_pem: config.ports.identity_private_key_pem.clone(),
            installation_id: config.ports.identity_installation_id.clone(),
        },
        cipher: Arc::new(cipher),
        callback_url: config.ports.callback_url.clone(),
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let coordinator = Arc::new(Coordinator::new(config, ports, secrets));
    let state = AppState { coordinator: coordinator.clone() };

    let app = http::router().merge(ws::handler::router()).with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "coordinator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, stopping session actors");
    coordinator.shutdown_all().await;
}
