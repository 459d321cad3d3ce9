//! Contract types for the backing store.
//!
//! The store is eventually consistent. An acknowledgment may carry a delay
//! indicator (`warnings == ["DELAY", <token>, ..]`) meaning "accepted, effect
//! not yet guaranteed visible". The effect is later confirmed out of band by
//! a `finished-processing` signal whose message ends with the same token.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// First warning of a delayed acknowledgment.
pub const DELAY_WARNING: &str = "DELAY";

/// Table that holds current property values.
pub const PROPERTIES_TABLE: &str = "properties";

// ---------------------------------------------------------------------------
// Statement
// ---------------------------------------------------------------------------

/// A statement submitted to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    Update {
        device_id: String,
        property: String,
        value: Value,
    },
    Select {
        device_id: String,
        property: String,
    },
}

impl Statement {
    pub fn update(device_id: impl Into<String>, property: impl Into<String>, value: Value) -> Self {
        Statement::Update {
            device_id: device_id.into(),
            property: property.into(),
            value,
        }
    }

    pub fn select(device_id: impl Into<String>, property: impl Into<String>) -> Self {
        Statement::Select {
            device_id: device_id.into(),
            property: property.into(),
        }
    }

    /// `(device_id, property)` addressed by this statement.
    pub fn key(&self) -> (&str, &str) {
        match self {
            Statement::Update {
                device_id,
                property,
                ..
            }
            | Statement::Select {
                device_id,
                property,
            } => (device_id, property),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Update {
                device_id,
                property,
                value,
            } => write!(
                f,
                "UPDATE {PROPERTIES_TABLE} SET value = '{value}' WHERE device_id = '{device_id}' AND name = '{property}'"
            ),
            Statement::Select {
                device_id,
                property,
            } => write!(
                f,
                "SELECT value FROM {PROPERTIES_TABLE} WHERE device_id = '{device_id}' AND name = '{property}'"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageAck
// ---------------------------------------------------------------------------

/// Result of `execute(statement)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl StorageAck {
    /// Plain acknowledgment: effect visible now.
    pub fn applied() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Value>) -> Self {
        Self {
            rows: Some(rows),
            warnings: None,
        }
    }

    /// Accepted, completion will be signalled later under `token`.
    pub fn delayed(token: impl Into<String>) -> Self {
        Self {
            rows: None,
            warnings: Some(vec![DELAY_WARNING.to_string(), token.into()]),
        }
    }

    /// The completion token when the acknowledgment carries a delay indicator.
    ///
    /// `["DELAY"]` without a token is not a usable delay indicator and is
    /// treated as a plain acknowledgment.
    pub fn delay_token(&self) -> Option<&str> {
        let w = self.warnings.as_ref()?;
        match (w.first(), w.get(1)) {
            (Some(first), Some(token)) if first == DELAY_WARNING => Some(token.as_str()),
            _ => None,
        }
    }

    /// `value` column of the first row, if any.
    pub fn first_value(&self) -> Option<&Value> {
        let row = self.rows.as_ref()?.first()?;
        match row {
            Value::Object(map) => map.get("value"),
            other => Some(other),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageSignal
// ---------------------------------------------------------------------------

/// Asynchronous events emitted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "message", rename_all = "kebab-case")]
pub enum StorageSignal {
    /// A delayed statement has taken effect. Message is `"<context> <token>"`.
    FinishedProcessing(String),
    /// The store detected a consistency problem. Classified by prefix.
    ConsistencyError(String),
}

/// Extract the completion token from a `finished-processing` message.
///
/// The token is the last whitespace-separated word. Returns `None` for a
/// blank message.
pub fn completion_token(message: &str) -> Option<&str> {
    message.split_whitespace().next_back()
}
