pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod notify;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transfer;
