// Numan Thabit 2025
//! Decoding of the `meta.err` payload into a failure kind.

use serde::Serialize;
use serde_json::Value;

/// Label used when no known shape matches.
pub const UNKNOWN_ERROR_KIND: &str = "unknown";

/// Failure reason of a transaction, decoded from the first matching shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TxError {
    /// `{"InstructionError": [index, detail]}` with a named detail.
    Instruction {
        /// Position of the failing instruction.
        index: u64,
        /// Named instruction error (`Custom`, `InvalidAccountData`, ...).
        kind: String,
    },
    /// Object payload keyed by a transaction-level error name.
    Transaction {
        /// Top-level error key.
        kind: String,
    },
    /// Bare string payload.
    Raw {
        /// The string as sent.
        message: String,
    },
    /// Nothing recognizable.
    Unknown,
}

impl TxError {
    /// Try each known shape in priority order.
    pub fn decode(payload: &Value) -> Self {
        if let Some(instruction) = Self::instruction_error(payload) {
            return instruction;
        }
        match payload {
            Value::Object(map) => match map.keys().next() {
                Some(key) => Self::Transaction { kind: key.clone() },
                None => Self::Unknown,
            },
            Value::String(message) if !message.is_empty() => Self::Raw {
                message: message.clone(),
            },
            _ => Self::Unknown,
        }
    }

    fn instruction_error(payload: &Value) -> Option<Self> {
        let parts = payload.get("InstructionError")?.as_array()?;
        let [index, detail] = parts.as_slice() else {
            return None;
        };
        let index = index.as_u64()?;
        let kind = match detail {
            Value::String(name) if !name.is_empty() => name.clone(),
            Value::Object(map) => map.keys().next()?.clone(),
            _ => return None,
        };
        Some(Self::Instruction { index, kind })
    }

    /// Normalized kind string used as the counter key.
    pub fn kind(&self) -> &str {
        match self {
            Self::Instruction { kind, .. } | Self::Transaction { kind } => kind,
            Self::Raw { message } => message,
            Self::Unknown => UNKNOWN_ERROR_KIND,
        }
    }
}
