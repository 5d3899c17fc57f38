//! Tunables for key updates and connection IDs.

use std::time::Duration;

use thiserror::Error;

/// Packets sent or received under one generation before a local update is
/// requested.
pub const DEFAULT_KEY_UPDATE_PACKET_INTERVAL: u64 = 100_000;

/// Age of a generation after which a local update is requested.
pub const DEFAULT_KEY_UPDATE_TIME_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How long a superseded remote generation stays available for reordered
/// packets (three probe timeouts at a 1s PTO).
pub const DEFAULT_KEY_RETENTION_PERIOD: Duration = Duration::from_secs(3);

/// Length of locally issued connection IDs.
pub const DEFAULT_CONNECTION_ID_LENGTH: usize = 8;

/// Maximum number of active locally issued connection IDs.
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: usize = 8;

/// Longest connection ID QUIC v1 permits.
pub const MAX_CONNECTION_ID_LENGTH: usize = 20;

/// Key update and connection ID configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdateConfig {
    /// Packets per generation before a local update (`None` disables)
    pub packet_interval: Option<u64>,
    /// Generation age before a local update (`None` disables)
    pub time_interval: Option<Duration>,
    /// Retention window for the previous remote generation
    pub retention_period: Duration,
    /// Length of locally issued connection IDs (1..=20)
    pub connection_id_length: usize,
    /// Cap on simultaneously active locally issued connection IDs
    pub active_connection_id_limit: usize,
}

impl Default for KeyUpdateConfig {
    fn default() -> Self {
        Self {
            packet_interval: Some(DEFAULT_KEY_UPDATE_PACKET_INTERVAL),
            time_interval: Some(DEFAULT_KEY_UPDATE_TIME_INTERVAL),
            retention_period: DEFAULT_KEY_RETENTION_PERIOD,
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
            active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
        }
    }
}

impl KeyUpdateConfig {
    /// Configuration that requests an update on every packet.
    ///
    /// Used by stress tests; never appropriate for production traffic.
    #[must_use]
    pub fn every_packet() -> Self {
        Self { packet_interval: Some(1), time_interval: None, ..Self::default() }
    }

    /// Check that every field is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_interval == Some(0) {
            return Err(ConfigError::ZeroPacketInterval);
        }
        if self.time_interval == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroTimeInterval);
        }
        if !(1..=MAX_CONNECTION_ID_LENGTH).contains(&self.connection_id_length) {
            return Err(ConfigError::ConnectionIdLength(self.connection_id_length));
        }
        if self.active_connection_id_limit < 2 {
            return Err(ConfigError::ActiveLimitTooLow(self.active_connection_id_limit));
        }
        Ok(())
    }
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A packet interval of zero would update before any packet exists
    #[error("packet interval must be at least 1")]
    ZeroPacketInterval,

    /// A zero time interval would update continuously
    #[error("time interval must be non-zero")]
    ZeroTimeInterval,

    /// Connection ID length outside 1..=20
    #[error("connection id length {0} outside 1..=20")]
    ConnectionIdLength(usize),

    /// QUIC requires an active connection ID limit of at least 2
    #[error("active connection id limit {0} below 2")]
    ActiveLimitTooLow(usize),
}
