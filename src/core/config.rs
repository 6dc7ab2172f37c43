//! Centralized configuration constants for peerlink.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (message type tags, blob URL
//! scheme) stay in their respective modules.

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Payload bytes per binary chunk frame (16 KiB).
///
/// Small enough to cross every SCTP implementation without fragmentation
/// issues; the final chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Data channel buffered amount high-water mark (16 MiB).
/// The sender stops queueing chunks once `buffered_amount` would exceed it.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 16 * 1024 * 1024;

/// Data channel buffered amount low-water mark (12 MiB).
/// Installed as the channel's low threshold; crossing it resumes the sender.
pub const DC_BUFFERED_AMOUNT_LOW: usize = 12 * 1024 * 1024;

/// Largest file either side will send or accept (2 GiB).
/// Received files are reassembled in memory, so this bounds peak usage.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

// ── Signaling ────────────────────────────────────────────────────────────────

/// How long an unanswered connection request stays pending.
pub const CONNECTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the node's housekeeping tick (request expiry).
pub const EXPIRY_TICK: Duration = Duration::from_secs(1);

// ── Transport ────────────────────────────────────────────────────────────────

/// Label of the single data channel the initiator opens.
pub const DATA_CHANNEL_LABEL: &str = "peerlink";

/// Rendezvous servers used when no ICE configuration is supplied.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ── Runtime-tunable groups ───────────────────────────────────────────────────

/// Flow-control and size limits for one transfer.
///
/// Defaults mirror the constants above; tests shrink them to exercise
/// backpressure without allocating megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferLimits {
    pub chunk_size: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub max_file_size: u64,
}

impl TransferLimits {
    /// Check the flow-control marks can make progress.
    ///
    /// The sender resumes only when the buffer drains to `low_water`, so a
    /// full chunk must fit between the two marks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_water >= self.high_water {
            return Err(ConfigError::Watermarks {
                low: self.low_water,
                high: self.high_water,
            });
        }
        let gap = self.high_water - self.low_water;
        if self.chunk_size == 0 || self.chunk_size > gap {
            return Err(ConfigError::ChunkSize {
                chunk: self.chunk_size,
                gap,
            });
        }
        Ok(())
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water: DC_BUFFERED_AMOUNT_HIGH,
            low_water: DC_BUFFERED_AMOUNT_LOW,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

/// A relay-class (TURN) fallback server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Connectivity-assist servers handed to every new transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServer>,
    /// Gather loopback candidates too; needed when both peers share a host.
    pub include_loopback: bool,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            turn: None,
            include_loopback: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermarks_ordered() {
        let limits = TransferLimits::default();
        assert!(limits.low_water < limits.high_water);
        assert!(limits.chunk_size < limits.low_water);
    }

    #[test]
    fn test_limits_validation() {
        assert_eq!(TransferLimits::default().validate(), Ok(()));

        let inverted = TransferLimits {
            high_water: 100,
            low_water: 100,
            ..TransferLimits::default()
        };
        assert!(matches!(inverted.validate(), Err(ConfigError::Watermarks { .. })));

        let too_big = TransferLimits {
            chunk_size: 8 * 1024 * 1024,
            ..TransferLimits::default()
        };
        assert_eq!(
            too_big.validate(),
            Err(ConfigError::ChunkSize {
                chunk: 8 * 1024 * 1024,
                gap: 4 * 1024 * 1024
            })
        );

        let zero = TransferLimits {
            chunk_size: 0,
            ..TransferLimits::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let limits: TransferLimits = toml::from_str("chunk_size = 1024").unwrap();
        assert_eq!(limits.chunk_size, 1024);
        assert_eq!(limits.high_water, DC_BUFFERED_AMOUNT_HIGH);

        let ice: IceConfig = toml::from_str("include_loopback = true").unwrap();
        assert!(ice.include_loopback);
        assert_eq!(ice.stun_urls.len(), DEFAULT_STUN_URLS.len());
    }
}
