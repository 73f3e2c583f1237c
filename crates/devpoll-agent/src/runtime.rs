//! Agent runtime: wires collaborators, restores devices and serves commands.

use crate::config::{AgentConfig, DeviceSeed};
use crate::persistence::SqliteStore;
use crate::session::{AgentSession, MonitoredGateway};
use anyhow::{bail, Context, Result};
use devpoll_adapter_http::{GatewayClient, GatewayClientConfig};
use devpoll_core::{
    AdminCommand, Collaborators, ConfigurationStore, DeviceRegistry, DeviceResolver, MemoryStore,
    PointUpdate, PollScheduler, PropertyFetchGateway, TokioScheduler,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// A line read from the command input.
#[derive(Debug)]
pub enum AgentCommand {
    /// Create a device
    Add(Box<DeviceSeed>),
    /// Print every device's status
    Status,
    /// Administrative command against one device
    Device {
        /// Target device
        name: String,
        /// Command
        command: AdminCommand,
    },
}

/// Parse one command line.
///
/// Accepted shapes:
/// - `"status"`
/// - `{"add": { ...device seed... }}`
/// - `{"device": "<name>", "action": "<action>", ...}`
///
/// # Errors
///
/// Returns error if the line matches none of the shapes.
pub fn parse_command(line: &str) -> Result<AgentCommand> {
    let value: Value = serde_json::from_str(line).context("Command is not JSON")?;

    match value {
        Value::String(word) if word == "status" => Ok(AgentCommand::Status),
        Value::Object(mut fields) => {
            if let Some(seed) = fields.remove("add") {
                let seed: DeviceSeed =
                    serde_json::from_value(seed).context("Invalid device in add command")?;
                return Ok(AgentCommand::Add(Box::new(seed)));
            }
            let name = match fields.remove("device") {
                Some(Value::String(name)) => name,
                Some(_) => bail!("\"device\" must be a string"),
                None => bail!("Command needs \"add\" or \"device\""),
            };
            let command: AdminCommand = serde_json::from_value(Value::Object(fields))
                .context("Invalid device command")?;
            Ok(AgentCommand::Device { name, command })
        }
        other => bail!("Unrecognized command: {other}"),
    }
}

/// Why the agent loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ctrl+C
    Signal,
    /// The gateway session was shut down
    SessionClosed,
}

/// The polling agent.
pub struct Agent {
    config: AgentConfig,
    registry: Arc<DeviceRegistry>,
    session: Arc<AgentSession>,
    updates: mpsc::Receiver<PointUpdate>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let client = Arc::new(
            GatewayClient::new(GatewayClientConfig {
                base_url: config.gateway.url.clone(),
                timeout: config.gateway.timeout,
                bearer_token: config.gateway.bearer_token.clone(),
                ca_cert_path: config.gateway.ca_cert_path.clone(),
                client_cert_path: config.gateway.client_cert_path.clone(),
                client_key_path: config.gateway.client_key_path.clone(),
            })
            .context("Failed to create gateway client")?,
        );

        let store: Arc<dyn ConfigurationStore> = match config.persistence.store_type.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            _ => Arc::new(
                SqliteStore::open(&config.persistence.db_path).with_context(|| {
                    format!(
                        "Failed to open database {}",
                        config.persistence.db_path.display()
                    )
                })?,
            ),
        };

        Ok(Self::assemble(
            config,
            client.clone(),
            client,
            store,
            Arc::new(TokioScheduler::current()),
        ))
    }

    /// Build an agent around the given transport, store and scheduler.
    ///
    /// Fetches go through a [`MonitoredGateway`] so that repeated transport
    /// failures mark the session lost.
    pub fn assemble(
        config: AgentConfig,
        gateway: Arc<dyn PropertyFetchGateway>,
        resolver: Arc<dyn DeviceResolver>,
        store: Arc<dyn ConfigurationStore>,
        scheduler: Arc<dyn PollScheduler>,
    ) -> Self {
        let session = Arc::new(AgentSession::new());
        let (tx, updates) = mpsc::channel(config.update_buffer);
        let gateway = Arc::new(MonitoredGateway::new(
            gateway,
            session.clone(),
            config.gateway.max_transport_failures,
        ));

        let registry = Arc::new(DeviceRegistry::new(Collaborators {
            scheduler,
            gateway,
            resolver,
            store,
            session: session.clone(),
            updates: tx,
        }));

        Self {
            config,
            registry,
            session,
            updates,
        }
    }

    /// Session of the gateway connection.
    #[must_use]
    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    /// Registry of managed devices.
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Restore persisted devices and create configured ones.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub async fn bootstrap(&self) -> Result<()> {
        let restored = self
            .registry
            .restore_all()
            .await
            .context("Failed to restore devices")?;
        tracing::info!(restored, "Persisted devices restored");

        for seed in &self.config.devices {
            if let Err(err) = self.seed_device(seed.clone()).await {
                tracing::warn!(device = %seed.settings.name, error = %err, "Failed to seed device");
            }
        }
        Ok(())
    }

    async fn seed_device(&self, seed: DeviceSeed) -> Result<()> {
        let name = seed.settings.name.clone();
        let controller = match self.registry.get(&name).await {
            Some(controller) => controller,
            None => {
                tracing::info!(device = %name, "Creating configured device");
                self.registry.add_device(seed.settings).await?
            }
        };
        for point in seed.points {
            controller.register_point(point).await?;
        }
        for point in seed.subscribe {
            controller.add_subscription(point).await?;
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(error = %err, "Ignoring command");
                return;
            }
        };

        match command {
            AgentCommand::Status => {
                let statuses = self.registry.statuses().await;
                match serde_json::to_string(&statuses) {
                    Ok(json) => println!("{json}"),
                    Err(err) => tracing::warn!(error = %err, "Failed to encode status"),
                }
            }
            AgentCommand::Add(seed) => {
                let name = seed.settings.name.clone();
                match self.seed_device(*seed).await {
                    Ok(()) => tracing::info!(device = %name, "Device added"),
                    Err(err) => tracing::warn!(device = %name, error = %err, "Add failed"),
                }
            }
            AgentCommand::Device { name, command } => {
                tracing::debug!(device = %name, ?command, "Executing command");
                if let Err(err) = self.registry.execute(&name, command).await {
                    tracing::warn!(device = %name, error = %err, "Command failed");
                }
            }
        }
    }

    /// Run the agent with commands from stdin until Ctrl+C or the gateway
    /// session closes.
    ///
    /// # Errors
    ///
    /// Returns error if bootstrapping fails.
    pub async fn run(self) -> Result<StopReason> {
        self.run_with_input(BufReader::new(tokio::io::stdin())).await
    }

    /// Run the agent reading command lines from `input`.
    ///
    /// # Errors
    ///
    /// Returns error if bootstrapping fails.
    pub async fn run_with_input<R>(mut self, input: R) -> Result<StopReason>
    where
        R: AsyncBufRead + Unpin,
    {
        tracing::info!(gateway = %self.config.gateway.url, "Starting agent runtime");

        self.bootstrap().await?;

        let mut lines = input.lines();
        let mut stdin_open = true;

        tracing::info!("Agent running, press Ctrl+C to stop");

        let reason = loop {
            tokio::select! {
                Some(update) = self.updates.recv() => {
                    log_update(&update);
                }
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => self.handle_line(&line).await,
                        Ok(None) => {
                            tracing::debug!("Command input closed");
                            stdin_open = false;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "Failed to read command input");
                            stdin_open = false;
                        }
                    }
                }
                () = self.session.closed() => {
                    tracing::error!("Gateway session closed, stopping");
                    break StopReason::SessionClosed;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break StopReason::Signal;
                }
            }
        };

        self.registry.shutdown().await;
        tracing::info!(?reason, "Agent stopped");
        Ok(reason)
    }
}

fn log_update(update: &PointUpdate) {
    match &update.result {
        Ok(value) => tracing::info!(
            device = %update.device,
            point = %update.point,
            %value,
            at = %update.at,
            "Point value"
        ),
        Err(err) => tracing::warn!(
            device = %update.device,
            point = %update.point,
            error = %err,
            at = %update.at,
            "Point read failed"
        ),
    }
}
