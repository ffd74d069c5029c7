//! Shield VPN command line client
//!
//! Connects to one server from the configured directory and keeps the
//! session up until interrupted.
//!
//! ```text
//! shield <config.toml|config.json> <server-id>
//! ```
//!
//! Runs with the direct data plane: control-plane calls use the host
//! network and no traffic is routed.

use anyhow::{Context, Result, bail};
use shield_net::{CookieStore, SocketConfig, TcpSocketFactory};
use shield_vpn::{
    ApiClient, Collaborators, DirectDataPlane, FileCredentialStore, KeyPair, NetworkProber, SessionConfig,
    SessionManager, SessionState, StaticDirectory,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CREDENTIALS_PATH: &str = "credentials.json";

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(server_id)) = (args.next(), args.next()) else {
        bail!("usage: shield <config.toml|config.json> <server-id>");
    };

    let config = SessionConfig::from_file(&PathBuf::from(&config_path))
        .with_context(|| format!("loading {}", config_path))?;
    let credentials_path = config
        .credentials_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CREDENTIALS_PATH));
    info!("Shield starting, credentials at {}", credentials_path.display());

    let directory = Arc::new(StaticDirectory::from_config(&config));
    sync_client_config(&config, &directory).await;

    let session = SessionManager::new(
        config,
        Collaborators {
            directory,
            prober: Arc::new(NetworkProber::new()),
            data_plane: Arc::new(DirectDataPlane::with_tcp(SocketConfig::default())),
            credentials: Arc::new(FileCredentialStore::new(credentials_path)),
        },
        KeyPair::generate(),
    );

    let mut transitions = session.transitions();
    session.connect(&server_id).await;

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Cannot listen for ctrl-c: {}", e);
                }
                info!("Interrupted, disconnecting");
                session.cancel().await;
                break Ok(());
            }
            transition = transitions.recv() => match transition {
                Ok(SessionState::Failed(reason)) => break Err(reason),
                Ok(SessionState::Connected) => {
                    if let Some(cert) = session.current_certificate() {
                        info!("Session up, certificate fingerprint {}", cert.public_key_fingerprint);
                    }
                }
                Ok(state) => info!("Session {}", state),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} state updates", n),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    match outcome {
        Ok(()) => {
            info!("Shield stopped");
            Ok(())
        }
        Err(reason) => {
            session.cancel().await;
            bail!("connection to {} failed: {}", server_id, reason)
        }
    }
}

/// Pull ports and protocol flags from the API before the first attempt.
/// Failure keeps the configured defaults.
async fn sync_client_config(config: &SessionConfig, directory: &StaticDirectory) {
    let api = ApiClient::new(
        Arc::new(TcpSocketFactory::new(SocketConfig::default())),
        Arc::new(CookieStore::new()),
        config.api.clone(),
    );
    match api.client_config(None, &CancellationToken::new()).await {
        Ok(client_config) => directory.apply_client_config(&client_config),
        Err(e) => warn!("Client config unavailable, using configured ports: {}", e),
    }
}
