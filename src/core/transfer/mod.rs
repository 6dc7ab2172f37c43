//! Chunked transfer protocol carried on an open data channel.
//!
//! Frames are told apart by kind alone:
//!
//!   text   → JSON [`ControlMessage`] (`file-info`, `file-complete`, `transfer-cancelled`)
//!   binary → one raw chunk, at most the configured chunk size
//!
//! Chunks carry no sequence number or transfer id, so a session runs one
//! file per direction at a time and relies on the channel being ordered.

pub mod receiver;
pub mod sender;

use crate::core::connection::ChannelFrame;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Media type used when the sender does not supply one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// File metadata announced before the first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileInfo {
        #[serde(rename = "fileInfo")]
        file_info: FileInfo,
    },
    FileComplete,
    TransferCancelled,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded data channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrame {
    Control(ControlMessage),
    Chunk(Bytes),
}

impl DataFrame {
    pub fn decode(frame: ChannelFrame) -> Result<Self> {
        match frame {
            ChannelFrame::Text(text) => {
                let msg = serde_json::from_str(&text).context("control frame")?;
                Ok(Self::Control(msg))
            }
            ChannelFrame::Binary(data) => Ok(Self::Chunk(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_info_wire_shape() {
        let msg = ControlMessage::FileInfo {
            file_info: FileInfo {
                name: "a.txt".into(),
                mime_type: "text/plain".into(),
                size: 40960,
            },
        };
        let v: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(v["type"], "file-info");
        assert_eq!(v["fileInfo"]["name"], "a.txt");
        assert_eq!(v["fileInfo"]["type"], "text/plain");
        assert_eq!(v["fileInfo"]["size"], 40960);
    }

    #[test]
    fn test_decode_markers() {
        let complete = DataFrame::decode(ChannelFrame::Text(r#"{"type":"file-complete"}"#.into()));
        assert_eq!(complete.unwrap(), DataFrame::Control(ControlMessage::FileComplete));
        let cancelled =
            DataFrame::decode(ChannelFrame::Text(r#"{"type":"transfer-cancelled"}"#.into()));
        assert_eq!(cancelled.unwrap(), DataFrame::Control(ControlMessage::TransferCancelled));
    }

    #[test]
    fn test_binary_is_chunk() {
        let f = DataFrame::decode(ChannelFrame::Binary(Bytes::from_static(b"{\"type\":1}")));
        assert_eq!(f.unwrap(), DataFrame::Chunk(Bytes::from_static(b"{\"type\":1}")));
    }

    #[test]
    fn test_garbage_text_rejected() {
        assert!(DataFrame::decode(ChannelFrame::Text("nope".into())).is_err());
        assert!(DataFrame::decode(ChannelFrame::Text(r#"{"type":"file-info"}"#.into())).is_err());
    }
}
