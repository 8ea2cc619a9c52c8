use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use beacon_core::config::{BeaconConfig, LoggingConfig, StoreBackend};
use beacon_core::error::{BeaconError, Result};
use beacon_core::store::ResourceStore;
use beacon_runtime::{BeaconNode, MemoryStore, PgResourceStore};

/// Instance property carrying the host name the node runs on.
const HOSTNAME_PROPERTY: &str = "beacon.hostname";

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Open the configured resource store, creating its schema if needed.
pub async fn open_store(config: &BeaconConfig) -> Result<Arc<dyn ResourceStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Postgres => {
            let store = PgResourceStore::from_config(&config.store).await?;
            store.migrate().await?;
            tracing::info!("Connected to resource store");
            Ok(Arc::new(store))
        }
    }
}

/// A beacon process: one node plus its inbound connector endpoint.
pub struct Beacon {
    config: BeaconConfig,
    listen: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Beacon {
    /// Create a new builder.
    pub fn builder() -> BeaconBuilder {
        BeaconBuilder::new()
    }

    /// The validated configuration.
    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    /// Address of the inbound connector endpoint, if any.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen
    }

    /// Run until Ctrl-C or [`shutdown`](Self::shutdown).
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Beacon starting");

        let store = open_store(&self.config).await?;
        let node = Arc::new(BeaconNode::builder(self.config.clone()).with_store(store).build()?);

        let server = match self.listen {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                let router = node.connector_router();
                tracing::info!("Connector endpoint listening on {}", addr);
                Some(tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, router).await {
                        tracing::error!("Connector endpoint error: {}", e);
                    }
                }))
            }
            None => None,
        };

        let handle = node.start().await;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = self.shutdown_rx.recv() => {
                tracing::info!("Received shutdown notification");
            }
        }

        let stopped = handle.stop().await;
        if let Some(server) = server {
            server.abort();
        }
        tracing::info!("Beacon stopped");
        stopped
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// A sender that stops the runtime once [`run`](Self::run) owns it.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// Builder for the [`Beacon`] runtime.
#[derive(Default)]
pub struct BeaconBuilder {
    config: Option<BeaconConfig>,
    listen: Option<String>,
}

impl BeaconBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: BeaconConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Address of the inbound connector endpoint, overriding
    /// `connector.listen`.
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    /// Validate the configuration and build the runtime.
    pub fn build(self) -> Result<Beacon> {
        let mut config = self
            .config
            .ok_or_else(|| BeaconError::Config("Configuration is required".to_string()))?;
        config.validate()?;

        if !config.instance.properties.contains_key(HOSTNAME_PROPERTY) {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            config.instance.properties.insert(HOSTNAME_PROPERTY.to_string(), host);
        }

        let listen = match self.listen.or_else(|| config.connector.listen.clone()) {
            Some(addr) => Some(addr.parse::<SocketAddr>().map_err(|e| {
                BeaconError::Config(format!("Invalid listen address {}: {}", addr, e))
            })?),
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Beacon {
            config,
            listen,
            shutdown_tx,
            shutdown_rx,
        })
    }
}
