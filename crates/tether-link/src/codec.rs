//! MessagePack wire codec shared by both transports.
//!
//! Every payload is a single msgpack map with string keys.  Surface traffic
//! carries only [`Value`]s in both directions.  Peripheral traffic towards the
//! bridge additionally carries the [`IDENTITY_FIELD`], a string naming the
//! device that sent it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tether_types::{StateMap, TetherError, Value};

/// Key under which a peripheral announces its identity code.
pub const IDENTITY_FIELD: &str = "ID";

/// Any value allowed in an inbound peripheral frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum Field {
    Value(Value),
    Text(String),
}

/// A decoded peripheral frame: the identity field split from the telemetry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeripheralFrame {
    /// Value of the [`IDENTITY_FIELD`], if present.
    pub identity: Option<String>,
    /// All other fields.
    pub fields: StateMap,
}

impl PeripheralFrame {
    /// Frame carrying only an identity, as sent during the handshake.
    pub fn hello(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            fields: StateMap::new(),
        }
    }
}

/// Encode a state map.
///
/// # Errors
///
/// Returns [`TetherError::Encode`] if msgpack serialisation fails.
pub fn encode_state(map: &StateMap) -> Result<Vec<u8>, TetherError> {
    rmp_serde::to_vec(map).map_err(|e| TetherError::Encode(e.to_string()))
}

/// Decode a payload that must be a map of string keys to int/bool values.
///
/// # Errors
///
/// Returns [`TetherError::Decode`] for malformed msgpack, a non-map payload,
/// or values that are neither integers nor booleans.
pub fn decode_state(bytes: &[u8]) -> Result<StateMap, TetherError> {
    rmp_serde::from_slice(bytes).map_err(|e| TetherError::Decode(e.to_string()))
}

/// Encode a peripheral frame (identity plus telemetry) the way a device
/// would put it on the wire, without the trailing delimiter.
///
/// # Errors
///
/// Returns [`TetherError::Encode`] if msgpack serialisation fails.
pub fn encode_peripheral_frame(frame: &PeripheralFrame) -> Result<Vec<u8>, TetherError> {
    let mut raw: BTreeMap<&str, Field> = frame
        .fields
        .iter()
        .map(|(k, v)| (k.as_str(), Field::Value(*v)))
        .collect();
    if let Some(identity) = &frame.identity {
        raw.insert(IDENTITY_FIELD, Field::Text(identity.clone()));
    }
    rmp_serde::to_vec(&raw).map_err(|e| TetherError::Encode(e.to_string()))
}

/// Decode an inbound peripheral frame.
///
/// # Errors
///
/// Returns [`TetherError::Decode`] for malformed msgpack, an identity field
/// that is not a string, or text in any other field.
pub fn decode_peripheral_frame(bytes: &[u8]) -> Result<PeripheralFrame, TetherError> {
    let raw: BTreeMap<String, Field> =
        rmp_serde::from_slice(bytes).map_err(|e| TetherError::Decode(e.to_string()))?;

    let mut frame = PeripheralFrame::default();
    for (key, field) in raw {
        match (key.as_str() == IDENTITY_FIELD, field) {
            (true, Field::Text(code)) => frame.identity = Some(code),
            (true, Field::Value(v)) => {
                return Err(TetherError::Decode(format!(
                    "identity field must be a string, got {v}"
                )));
            }
            (false, Field::Value(v)) => {
                frame.fields.insert(key, v);
            }
            (false, Field::Text(_)) => {
                return Err(TetherError::Decode(format!(
                    "field '{key}' carries text, expected an int or bool"
                )));
            }
        }
    }
    Ok(frame)
}
