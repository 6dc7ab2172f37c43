//! User-facing notifications.
//!
//! Provides concise, level-aware notices. Everything the
//! user must act on goes through here; verbose details belong in `tracing`
//! logs. The node emits them as [`AppEvent::Notice`](crate::core::node::AppEvent)
//! and embedders decide how to render and dismiss them.

// ── Notification Level ───────────────────────────────────────────────────────

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    /// Neutral informational message (e.g. "bob wants to connect").
    Info,
    /// Positive outcome (e.g. "Connected", "File received").
    Success,
    /// Non-critical issue (e.g. "Transfer cancelled", "Request expired").
    Warning,
    /// Actionable error (e.g. "Connection failed").
    Error,
}

impl NotifyLevel {
    /// Short prefix for plain-text rendering.
    pub fn icon(self) -> &'static str {
        match self {
            NotifyLevel::Info => "(i)",
            NotifyLevel::Success => "(+)",
            NotifyLevel::Warning => "(x)",
            NotifyLevel::Error => "(!)",
        }
    }
}

// ── Notification ─────────────────────────────────────────────────────────────

/// A single user-facing notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotifyLevel,
    pub message: String,
}

impl Notification {
    pub fn new(level: NotifyLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Success, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotifyLevel::Error, message)
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.level.icon(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(Notification::info("a").level, NotifyLevel::Info);
        assert_eq!(Notification::success("a").level, NotifyLevel::Success);
        assert_eq!(Notification::warn("a").level, NotifyLevel::Warning);
        assert_eq!(Notification::error("a").level, NotifyLevel::Error);
    }

    #[test]
    fn test_plain_text_rendering() {
        assert_eq!(Notification::error("fail").to_string(), "(!) fail");
        assert_eq!(Notification::success("sent").to_string(), "(+) sent");
    }
}
