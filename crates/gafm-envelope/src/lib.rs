//! Payload envelope decoding: turns whatever the report webhook returned into account records.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use gafm_core::AccountRecord;
use serde_json::{Map, Value};
use tracing::warn;

pub const CRATE_NAME: &str = "gafm-envelope";

pub const UPDATED_AT_KEY: &str = "atualização";
pub const UPDATED_AT_KEY_UNACCENTED: &str = "atualizacao";

/// Known upstream shapes. Borrowed from the payload so decoding never clones
/// until records are built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Envelope<'a> {
    /// `[ {account}, ... ]`
    Array(&'a [Value]),
    /// `{ "data": [...], "atualização": "..." }`
    Object(&'a Map<String, Value>),
    /// `[ { "data": [...], "atualização": "..." } ]`
    WrappedArray(&'a Map<String, Value>),
    Unknown(&'a Value),
}

impl<'a> Envelope<'a> {
    pub fn decode(payload: &'a Value) -> Self {
        match payload {
            // An account may carry its own `data` (a date), so only a list
            // there marks the wrapped form.
            Value::Array(items) => match items.first() {
                Some(Value::Object(first)) if first.get("data").is_some_and(Value::is_array) => {
                    Envelope::WrappedArray(first)
                }
                _ => Envelope::Array(items),
            },
            Value::Object(map) if has_data(map) => Envelope::Object(map),
            other => Envelope::Unknown(other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Array(_) => "array",
            Envelope::Object(_) => "object",
            Envelope::WrappedArray(_) => "wrapped_array",
            Envelope::Unknown(_) => "unknown",
        }
    }

    fn accounts_value(&self) -> Option<&'a Value> {
        match *self {
            Envelope::Array(_) => None,
            Envelope::Object(map) | Envelope::WrappedArray(map) => map.get("data"),
            Envelope::Unknown(value) => Some(value),
        }
    }

    fn raw_accounts(&self) -> &'a [Value] {
        if let Envelope::Array(items) = *self {
            return items;
        }
        match self.accounts_value() {
            Some(Value::Array(items)) => items.as_slice(),
            _ => {
                warn!(envelope = self.kind(), "payload carries no account list; using empty data");
                &[]
            }
        }
    }

    pub fn updated_at(&self) -> Option<String> {
        match *self {
            Envelope::Object(map) => text_field(map, UPDATED_AT_KEY)
                .or_else(|| text_field(map, UPDATED_AT_KEY_UNACCENTED)),
            Envelope::WrappedArray(map) => text_field(map, UPDATED_AT_KEY),
            Envelope::Array(_) | Envelope::Unknown(_) => None,
        }
    }
}

/// `null`, `false`, zero and `""` all count as a missing `data` key.
fn has_data(map: &Map<String, Value>) -> bool {
    match map.get("data") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub accounts: Vec<AccountRecord>,
    pub updated_at: Option<String>,
}

/// Decodes any payload into classified accounts. Unrecognised shapes degrade
/// to an empty list; this never fails and never touches `payload`.
pub fn normalize(payload: &Value) -> Normalized {
    let envelope = Envelope::decode(payload);
    let accounts = envelope
        .raw_accounts()
        .iter()
        .map(|item| match item {
            Value::Object(map) => AccountRecord::from_fields(map.clone()),
            _ => AccountRecord::from_fields(Map::new()),
        })
        .collect();

    Normalized {
        accounts,
        updated_at: envelope.updated_at(),
    }
}

pub fn load_payload_file(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
