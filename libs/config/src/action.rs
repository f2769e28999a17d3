//! Routing actions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Kind of an action as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Forward,
    Reject,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Forward => f.write_str("FORWARD"),
            ActionType::Reject => f.write_str("REJECT"),
        }
    }
}

/// What to do with a connection once it has been classified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ActionRecord", into = "ActionRecord")]
pub enum Action {
    /// Dial `to_addr` and pipe the connection to it.
    Forward { to_addr: String },
    /// Close the connection without dialing anything.
    #[default]
    Reject,
}

impl Action {
    /// Create a forward action.
    pub fn forward(to_addr: impl Into<String>) -> Self {
        Action::Forward {
            to_addr: to_addr.into(),
        }
    }

    /// The kind of this action.
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::Forward { .. } => ActionType::Forward,
            Action::Reject => ActionType::Reject,
        }
    }

    /// Destination address for forward actions.
    pub fn to_addr(&self) -> Option<&str> {
        match self {
            Action::Forward { to_addr } => Some(to_addr),
            Action::Reject => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Forward { to_addr } => write!(f, "FORWARD {}", to_addr),
            Action::Reject => f.write_str("REJECT"),
        }
    }
}

/// On-disk shape of an action: `{"type": "FORWARD", "to_addr": "host:port"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionRecord {
    #[serde(rename = "type", alias = "action")]
    kind: ActionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    to_addr: String,
}

impl TryFrom<ActionRecord> for Action {
    type Error = ConfigError;

    fn try_from(record: ActionRecord) -> Result<Self, Self::Error> {
        match record.kind {
            ActionType::Forward if record.to_addr.trim().is_empty() => Err(
                ConfigError::InvalidAction("FORWARD requires a non-empty to_addr".to_string()),
            ),
            ActionType::Forward => Ok(Action::Forward {
                to_addr: record.to_addr,
            }),
            ActionType::Reject => Ok(Action::Reject),
        }
    }
}

impl From<Action> for ActionRecord {
    fn from(action: Action) -> Self {
        match action {
            Action::Forward { to_addr } => ActionRecord {
                kind: ActionType::Forward,
                to_addr,
            },
            Action::Reject => ActionRecord {
                kind: ActionType::Reject,
                to_addr: String::new(),
            },
        }
    }
}
