//! Error taxonomy for connection and transfer failures.
//!
//! Every variant's `Display` is the exact text shown to the user, so each
//! one must tell them what to do next (retry, pick a smaller file, wait).
//! Plumbing errors stay `anyhow::Error` until they reach a boundary that
//! classifies them into one of these.

use thiserror::Error;

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Relay connection is not open; reconnect before contacting peers")]
    RelayUnavailable,

    #[error("A connection with {0} is already in progress")]
    AlreadyInProgress(String),

    #[error("No pending connection request from {0}")]
    NoPendingRequest(String),

    #[error("No session with {0}")]
    UnknownPeer(String),

    #[error("Not connected to {0}; connect before sending files")]
    NotConnected(String),

    #[error("No transfer in progress with {0}")]
    NoActiveTransfer(String),

    #[error("Cannot connect to yourself")]
    SelfConnection,

    #[error("Node has stopped")]
    NodeStopped,

    #[error("Connection to {peer} {state}; start a new connection to retry")]
    ConnectionFailed { peer: String, state: String },

    #[error("Could not set up the connection: {0}")]
    Transport(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rejected tunables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Low-water mark ({low} bytes) must be below the high-water mark ({high} bytes)")]
    Watermarks { low: usize, high: usize },

    #[error("Chunk size ({chunk} bytes) must be between 1 and the watermark gap ({gap} bytes)")]
    ChunkSize { chunk: usize, gap: usize },
}

/// Failures scoped to a single file transfer. None of these tear down the
/// session; the data channel stays usable for the next attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Another file is already being sent to this peer")]
    TransferInProgress,

    #[error("File too large ({size} bytes, limit {limit} bytes); pick a smaller file")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Could not read the local file: {0}")]
    ReadFailed(String),

    #[error("Data channel closed during the transfer")]
    ChannelClosed,

    #[error("Transfer truncated: received {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error("Peer sent more data than announced ({received} > {expected} bytes)")]
    Overflow { received: u64, expected: u64 },

    #[error("Reassembled file is {actual} bytes, expected {expected}")]
    SizeMismatch { actual: u64, expected: u64 },

    #[error("Could not assemble the received file: {0}")]
    FinalizeFailed(String),

    #[error("Transfer cancelled")]
    Cancelled,
}

pub type PeerResult<T> = Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_distinct() {
        let msgs = [
            PeerError::RelayUnavailable.to_string(),
            PeerError::NotConnected("bob".into()).to_string(),
            TransferError::ChannelNotOpen.to_string(),
            TransferError::FileTooLarge { size: 10, limit: 5 }.to_string(),
            TransferError::ReadFailed("denied".into()).to_string(),
            TransferError::Truncated { received: 1, expected: 2 }.to_string(),
            TransferError::FinalizeFailed("oom".into()).to_string(),
        ];
        for (i, a) in msgs.iter().enumerate() {
            for b in &msgs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_transfer_error_is_transparent() {
        let err: PeerError = TransferError::Cancelled.into();
        assert_eq!(err.to_string(), "Transfer cancelled");
    }
}
