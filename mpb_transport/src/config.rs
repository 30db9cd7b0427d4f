//! Session configuration.

use std::time::Duration;

use mpb_core::MultipathError;
use serde::{Deserialize, Serialize};

/// Subflow selection strategies shipped with the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAlgorithm {
    /// First active subflow that can send.
    FirstAvailable,
    RoundRobin,
    MinRtt,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

impl From<ConfigError> for MultipathError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(reason) => MultipathError::Config(reason),
            other => MultipathError::Config(other.to_string()),
        }
    }
}

/// Per-session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Delivery queue limit in records (0 = unlimited)
    #[serde(default = "default_rx_queue_limit")]
    pub rx_queue_limit: usize,
    /// Session send queue limit in records (0 = unlimited)
    #[serde(default = "default_tx_queue_limit")]
    pub tx_queue_limit: usize,
    /// Bound for the key-exchange carrier's blocking dial (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound for the transmit path's wait for connection completion (milliseconds)
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Handshake retransmit timeout for joining subflows (milliseconds)
    #[serde(default = "default_join_retransmit_timeout_ms")]
    pub join_retransmit_timeout_ms: u64,
    /// Backlog of listening subflows
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerAlgorithm,
}

fn default_rx_queue_limit() -> usize { 256 }
fn default_tx_queue_limit() -> usize { 256 }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_send_timeout_ms() -> u64 { 1_000 }
fn default_join_retransmit_timeout_ms() -> u64 { 200 }
fn default_listen_backlog() -> u32 { 1000 }
fn default_scheduler() -> SchedulerAlgorithm { SchedulerAlgorithm::FirstAvailable }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rx_queue_limit: default_rx_queue_limit(),
            tx_queue_limit: default_tx_queue_limit(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            join_retransmit_timeout_ms: default_join_retransmit_timeout_ms(),
            listen_backlog: default_listen_backlog(),
            scheduler: default_scheduler(),
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn join_retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.join_retransmit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_backlog == 0 {
            return Err(ConfigError::Invalid("listen_backlog must be positive".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

/// Builder for SessionConfig
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    rx_queue_limit: Option<usize>,
    tx_queue_limit: Option<usize>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    join_retransmit_timeout: Option<Duration>,
    listen_backlog: Option<u32>,
    scheduler: Option<SchedulerAlgorithm>,
}

impl SessionConfigBuilder {
    pub fn rx_queue_limit(mut self, limit: usize) -> Self {
        self.rx_queue_limit = Some(limit);
        self
    }

    pub fn tx_queue_limit(mut self, limit: usize) -> Self {
        self.tx_queue_limit = Some(limit);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn join_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.join_retransmit_timeout = Some(timeout);
        self
    }

    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = Some(backlog);
        self
    }

    pub fn scheduler(mut self, algo: SchedulerAlgorithm) -> Self {
        self.scheduler = Some(algo);
        self
    }

    pub fn build(self) -> SessionConfig {
        let default = SessionConfig::default();
        SessionConfig {
            rx_queue_limit: self.rx_queue_limit.unwrap_or(default.rx_queue_limit),
            tx_queue_limit: self.tx_queue_limit.unwrap_or(default.tx_queue_limit),
            connect_timeout_ms: self
                .connect_timeout
                .map_or(default.connect_timeout_ms, |t| t.as_millis() as u64),
            send_timeout_ms: self
                .send_timeout
                .map_or(default.send_timeout_ms, |t| t.as_millis() as u64),
            join_retransmit_timeout_ms: self
                .join_retransmit_timeout
                .map_or(default.join_retransmit_timeout_ms, |t| t.as_millis() as u64),
            listen_backlog: self.listen_backlog.unwrap_or(default.listen_backlog),
            scheduler: self.scheduler.unwrap_or(default.scheduler),
        }
    }
}
