//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's state
//! and manages the lifecycle of all its concurrent services.

use crate::{
    config::Config,
    crypto::Identity,
    error::Result,
    node::Node,
    store::Store,
    transport::{serial::SerialTransport, udp::UdpTransport, Transport},
};
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration. Configuration
    /// errors are fatal here, before anything touches the disk.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Handle used by embedders and tests to stop the app without a signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The main run loop for the application.
    ///
    /// This function performs the following steps:
    ///   1. Creates the persisted-state layout beneath the application root.
    ///   2. Loads or generates the node's cryptographic identity.
    ///   3. Opens the store and constructs the enabled transports.
    ///   4. Starts the node runtime and the optional GPS emitter.
    ///   5. Waits for a shutdown signal (like Ctrl+C) and gracefully
    ///      terminates all tasks.
    pub async fn run(self) -> Result<()> {
        fs::create_dir_all(&self.config.data_dir)?;
        fs::create_dir_all(self.config.attachments_dir())?;
        fs::create_dir_all(self.config.logs_dir())?;

        let identity = Identity::load_or_generate(self.config.key_path(), &self.config.profile())?;

        tracing::info!(
            node_id = %identity.node.short_id(),
            callsign = %identity.node.callsign,
            "🚀 Starting node..."
        );

        let store = Arc::new(Store::open(self.config.store_path())?);

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        if self.config.batman_enabled {
            transports.push(Arc::new(UdpTransport::new(
                self.config.ip_port,
                self.config.ip_interface.clone(),
            )));
        }
        if self.config.lora_enabled {
            transports.push(Arc::new(SerialTransport::new(
                self.config.lora.port.clone(),
                self.config.lora.baudrate,
            )));
        }
        if transports.is_empty() {
            tracing::warn!("No transports enabled; node will only serve local reads");
        }

        let node = Arc::new(Node::new(
            identity,
            store,
            transports,
            self.config.active_window(),
        ));
        node.start().await?;

        // Optional periodic emission of the configured static position.
        let gps_task = if self.config.gps_enabled {
            let node = node.clone();
            let position = self.config.position.clone();
            let interval = std::time::Duration::from_secs(self.config.gps_interval_secs);
            let token = self.shutdown_token.clone();
            Some(tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = timer.tick() => {
                            if let Err(e) =
                                node.update_position(position.lat, position.lon, position.alt, 10.0, 0.0, 0.0)
                            {
                                tracing::warn!(error = %e, "Periodic position update failed");
                            }
                        }
                    }
                }
            }))
        } else {
            None
        };

        // --- Wait for Shutdown Signal ---
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        if let Some(task) = gps_task {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "GPS emitter task failed");
            }
        }
        node.stop().await;
        tracing::info!("👋 Node has shut down gracefully.");

        Ok(())
    }
}
