//! Relay channel: the always-on control path between a user and the server.
//!
//! Only small JSON signaling messages travel here, never file bytes. The
//! core sees the relay through two narrow contracts:
//!
//! - [`RelayChannel`]: this user's send side plus an "is it open" check.
//!   Inbound traffic arrives as raw text on an `mpsc` receiver and is parsed
//!   with [`RelayMessage::parse`], which tolerates junk.
//! - [`RelayDirectory`]: the read-only user → socket lookup. Callers must
//!   always handle "absent".
//!
//! [`hub::RelayHub`] is the in-process implementation of both.

pub mod hub;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ── Opaque blobs ─────────────────────────────────────────────────────────────

/// Session description or connectivity candidate, carried verbatim.
///
/// The relay never looks inside; only the transport that produced it (and
/// its counterpart on the other peer) knows the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalBlob(pub serde_json::Value);

impl SignalBlob {
    /// Encode any serializable transport value into a blob.
    pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Decode the blob back into the transport's own type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// Every relay message this subsystem sends or consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    ConnectionRequest {
        sender: String,
        receiver: String,
        #[serde(rename = "senderName", default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },
    ConnectionAccepted {
        sender: String,
        receiver: String,
    },
    ConnectionRejected {
        sender: String,
        receiver: String,
    },
    Offer {
        sender: String,
        receiver: String,
        offer: SignalBlob,
    },
    Answer {
        sender: String,
        receiver: String,
        answer: SignalBlob,
    },
    Candidate {
        sender: String,
        receiver: String,
        candidate: SignalBlob,
    },
    /// Ephemeral chat signal; shares the channel, never touches session state.
    Typing {
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver: Option<String>,
    },
}

/// Message types known to travel on the relay that this subsystem ignores.
const FOREIGN_TYPES: &[&str] = &["chat", "message", "send-message", "read-receipt"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("malformed relay message: {0}")]
    Malformed(String),
}

impl RelayMessage {
    /// Parse one inbound relay frame.
    ///
    /// - `Ok(Some(_))`: a message for this subsystem, with non-empty routing ids.
    /// - `Ok(None)`: a well-formed message of a type handled elsewhere.
    /// - `Err(_)`: junk. Callers log and drop it.
    pub fn parse(text: &str) -> Result<Option<Self>, RelayError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| RelayError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Malformed("missing type".into()))?;

        if !Self::is_known_kind(&kind) {
            if FOREIGN_TYPES.contains(&kind.as_str()) {
                debug!(event = "relay_foreign_type", kind = %kind, "Ignoring relay message");
            } else {
                debug!(event = "relay_unknown_type", kind = %kind, "Ignoring unknown relay message type");
            }
            return Ok(None);
        }

        let msg: RelayMessage =
            serde_json::from_value(value).map_err(|e| RelayError::Malformed(e.to_string()))?;

        if msg.sender().is_empty() {
            return Err(RelayError::Malformed(format!("{kind}: empty sender")));
        }
        if msg.receiver().is_some_and(str::is_empty) {
            return Err(RelayError::Malformed(format!("{kind}: empty receiver")));
        }
        Ok(Some(msg))
    }

    fn is_known_kind(kind: &str) -> bool {
        matches!(
            kind,
            "connection-request"
                | "connection-accepted"
                | "connection-rejected"
                | "offer"
                | "answer"
                | "candidate"
                | "typing"
        )
    }

    /// Wire name of this message's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionRequest { .. } => "connection-request",
            Self::ConnectionAccepted { .. } => "connection-accepted",
            Self::ConnectionRejected { .. } => "connection-rejected",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Typing { .. } => "typing",
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::ConnectionRequest { sender, .. }
            | Self::ConnectionAccepted { sender, .. }
            | Self::ConnectionRejected { sender, .. }
            | Self::Offer { sender, .. }
            | Self::Answer { sender, .. }
            | Self::Candidate { sender, .. }
            | Self::Typing { sender, .. } => sender,
        }
    }

    /// Routing target. Only `typing` may omit it.
    pub fn receiver(&self) -> Option<&str> {
        match self {
            Self::ConnectionRequest { receiver, .. }
            | Self::ConnectionAccepted { receiver, .. }
            | Self::ConnectionRejected { receiver, .. }
            | Self::Offer { receiver, .. }
            | Self::Answer { receiver, .. }
            | Self::Candidate { receiver, .. } => Some(receiver),
            Self::Typing { receiver, .. } => receiver.as_deref(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Contracts ────────────────────────────────────────────────────────────────

/// One user's handle on the relay.
pub trait RelayChannel: Send + Sync {
    /// Identity this channel is registered under.
    fn user_id(&self) -> &str;

    /// Whether `send` would reach the relay right now. Checked before every
    /// send; a closed channel is a user-visible error, not a silent drop.
    fn is_open(&self) -> bool;

    /// Hand a message to the relay. Delivery to the receiver is best-effort.
    fn send(&self, msg: &RelayMessage) -> anyhow::Result<()>;
}

/// Read-only view of who is currently reachable through the relay.
pub trait RelayDirectory: Send + Sync {
    fn lookup(&self, user_id: &str) -> Option<hub::RelayEndpoint>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_connection_request() {
        let text = r#"{"type":"connection-request","sender":"x","receiver":"y","senderName":"Xavier"}"#;
        let msg = RelayMessage::parse(text).unwrap().unwrap();
        assert_eq!(
            msg,
            RelayMessage::ConnectionRequest {
                sender: "x".into(),
                receiver: "y".into(),
                sender_name: Some("Xavier".into()),
            }
        );
    }

    #[test]
    fn test_sender_name_optional() {
        let text = r#"{"type":"connection-request","sender":"x","receiver":"y"}"#;
        match RelayMessage::parse(text).unwrap().unwrap() {
            RelayMessage::ConnectionRequest { sender_name, .. } => assert!(sender_name.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_blob_passes_through_untouched() {
        let blob = json!({"type": "offer", "sdp": "v=0\r\n"});
        let msg = RelayMessage::Offer {
            sender: "x".into(),
            receiver: "y".into(),
            offer: SignalBlob(blob.clone()),
        };
        let text = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["offer"], blob);
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        for text in [
            "not json",
            r#"{"sender":"x","receiver":"y"}"#,
            r#"{"type":"offer","sender":"x","receiver":"y"}"#,
            r#"{"type":"connection-accepted","receiver":"y"}"#,
            r#"{"type":"connection-accepted","sender":"x"}"#,
            r#"{"type":"candidate","sender":"","receiver":"y","candidate":{}}"#,
            r#"{"type":"answer","sender":"x","receiver":"","answer":{}}"#,
            r#"{"type":7,"sender":"x","receiver":"y"}"#,
        ] {
            assert!(RelayMessage::parse(text).is_err(), "accepted {text}");
        }
    }

    #[test]
    fn test_foreign_and_unknown_types_ignored() {
        let chat = r#"{"type":"chat","sender":"x","receiver":"y","text":"hi"}"#;
        assert_eq!(RelayMessage::parse(chat), Ok(None));
        let other = r#"{"type":"presence","who":"x"}"#;
        assert_eq!(RelayMessage::parse(other), Ok(None));
    }

    #[test]
    fn test_typing_without_receiver() {
        let msg = RelayMessage::parse(r#"{"type":"typing","sender":"x"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "typing");
        assert_eq!(msg.receiver(), None);
    }
}
