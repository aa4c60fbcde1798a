//! Operator commands and session status messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Well-known status message kinds.
pub mod kind {
    /// Run instructions, sent once when an operator connects.
    pub const INSTRUCTIONS: &str = "INSTRUCTIONS";
    /// Progress notices from the running session.
    pub const STATUS: &str = "STATUS";
    /// Failures the operator should see.
    pub const ERROR: &str = "ERROR";
}

/// Sending half of a session's status channel.
pub type StatusSender = mpsc::UnboundedSender<StatusMessage>;

/// Receiving half of a session's status channel.
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusMessage>;

/// Operator action carried by a [`CommandMessage`].
///
/// Anything the dispatcher does not understand is kept verbatim in
/// [`Action::Unknown`] so it can be logged before being discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Begin a new run for the subject.
    Start,
    /// Cooperatively cancel the subject's in-flight run.
    Cancel,
    /// Record a key press into the running trial.
    Key,
    /// Release a run paused for operator confirmation.
    Continue,
    /// Unrecognized (or missing) action.
    Unknown(String),
}

impl Action {
    /// Wire representation of the action.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "START",
            Self::Cancel => "CANCEL",
            Self::Key => "KEY",
            Self::Continue => "CONTINUE",
            Self::Unknown(raw) => raw,
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "START" => Self::Start,
            "CANCEL" => Self::Cancel,
            "KEY" => Self::Key,
            "CONTINUE" => Self::Continue,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Unknown(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound instruction from the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandMessage {
    /// Subject the run belongs to. Empty for session-wide commands.
    #[serde(rename = "subjectID")]
    pub subject_id: String,
    /// What the operator wants done.
    pub action: Action,
    /// Key label, only meaningful for [`Action::Key`].
    pub content: String,
    /// Key code, only meaningful for [`Action::Key`].
    pub key_code: u8,
}

impl CommandMessage {
    /// Create a command with only an action and a subject.
    #[must_use]
    pub fn new(action: Action, subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            action,
            ..Self::default()
        }
    }

    /// Create a key press command.
    #[must_use]
    pub fn key(content: impl Into<String>, key_code: u8) -> Self {
        Self {
            action: Action::Key,
            content: content.into(),
            key_code,
            ..Self::default()
        }
    }
}

/// One outbound notice to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusMessage {
    /// Message category, see [`kind`].
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Free-form payload.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl StatusMessage {
    /// Create a status message of an arbitrary kind.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Run instructions for a freshly connected operator.
    #[must_use]
    pub fn instructions(message: impl Into<String>) -> Self {
        Self::new(kind::INSTRUCTIONS, message)
    }

    /// Progress notice.
    #[must_use]
    pub fn status(message: impl Into<String>) -> Self {
        Self::new(kind::STATUS, message)
    }

    /// Error notice.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(kind::ERROR, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_field_names() {
        let msg: CommandMessage = serde_json::from_str(
            r#"{"subjectID":"s01","action":"KEY","content":"a","keyCode":65}"#,
        )
        .unwrap();
        assert_eq!(msg.subject_id, "s01");
        assert_eq!(msg.action, Action::Key);
        assert_eq!(msg.content, "a");
        assert_eq!(msg.key_code, 65);
    }

    #[test]
    fn test_missing_fields_default() {
        let msg: CommandMessage = serde_json::from_str(r#"{"action":"CONTINUE"}"#).unwrap();
        assert_eq!(msg.action, Action::Continue);
        assert!(msg.subject_id.is_empty());
        assert_eq!(msg.key_code, 0);

        let msg: CommandMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(msg.action, Action::Unknown(String::new()));
    }

    #[test]
    fn test_unknown_action_is_preserved() {
        let msg: CommandMessage = serde_json::from_str(r#"{"action":"PAUSE"}"#).unwrap();
        assert_eq!(msg.action, Action::Unknown("PAUSE".to_string()));
        assert_eq!(msg.action.to_string(), "PAUSE");
    }

    #[test]
    fn test_actions_are_case_sensitive() {
        assert_eq!(
            Action::from("start".to_string()),
            Action::Unknown("start".to_string())
        );
    }

    #[test]
    fn test_status_field_order() {
        let json = serde_json::to_string(&StatusMessage::instructions("X")).unwrap();
        assert_eq!(json, r#"{"kind":"INSTRUCTIONS","message":"X"}"#);
    }

    #[test]
    fn test_status_omits_empty_fields() {
        let json = serde_json::to_string(&StatusMessage::new("STATUS", "")).unwrap();
        assert_eq!(json, r#"{"kind":"STATUS"}"#);
    }
}
