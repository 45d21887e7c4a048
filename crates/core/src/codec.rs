//! Wire formats of the shared artifact.
//!
//! The format is chosen by deployment configuration and must match what the
//! data plane was started with; bytes are never sniffed.

use std::fmt;
use std::str::FromStr;

use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Broker, Brokers};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Protobuf,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Json => f.write_str("json"),
            Format::Protobuf => f.write_str("protobuf"),
        }
    }
}

impl FromStr for Format {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "protobuf" | "proto" => Ok(Format::Protobuf),
            other => Err(ModelError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown data plane config format: {0} (expected json or protobuf)")]
    UnknownFormat(String),
    #[error("failed to encode brokers as json: {0}")]
    EncodeJson(#[from] serde_json::Error),
}

/// Artifact bytes could not be decoded.
///
/// `partial` is only set when at least one broker entry survived; such a
/// value is safe to merge into and write back.
#[derive(Debug, Error)]
#[error("malformed {format} artifact: {reason}")]
pub struct DecodeError {
    pub format: Format,
    pub reason: String,
    pub partial: Option<Brokers>,
}

impl DecodeError {
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }
}

pub fn encode(brokers: &Brokers, format: Format) -> Result<Vec<u8>, ModelError> {
    match format {
        Format::Json => Ok(serde_json::to_vec(brokers)?),
        Format::Protobuf => Ok(brokers.encode_to_vec()),
    }
}

/// Decode artifact bytes. Empty input is an empty aggregate in every format.
pub fn decode(bytes: &[u8], format: Format) -> Result<Brokers, DecodeError> {
    if bytes.is_empty() {
        return Ok(Brokers::default());
    }
    match format {
        Format::Json => serde_json::from_slice::<Brokers>(bytes).map_err(|e| DecodeError {
            format,
            reason: e.to_string(),
            partial: salvage_json(bytes),
        }),
        // protobuf decoding is all-or-nothing
        Format::Protobuf => Brokers::decode(bytes).map_err(|e| DecodeError { format, reason: e.to_string(), partial: None }),
    }
}

/// Keep every broker entry that decodes on its own.
fn salvage_json(bytes: &[u8]) -> Option<Brokers> {
    let doc: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let obj = doc.as_object()?;
    let brokers: Vec<Broker> = obj
        .get("brokers")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|b| serde_json::from_value(b.clone()).ok()).collect())
        .unwrap_or_default();
    if brokers.is_empty() {
        return None;
    }
    // a present but unreadable generation is not salvageable
    let volume_generation = match obj.get("volumeGeneration") {
        None | Some(serde_json::Value::Null) => 0,
        Some(serde_json::Value::Number(n)) => n.as_u64()?,
        Some(serde_json::Value::String(s)) => s.trim().parse().ok()?,
        Some(_) => return None,
    };
    Some(Brokers { brokers, volume_generation })
}
