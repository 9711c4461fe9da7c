//! `tether-types` – shared vocabulary for the surface ↔ peripheral bridge.
//!
//! Everything that crosses a crate boundary lives here: device identities,
//! state values, the device [`Roster`] with its per-device schemas, and the
//! workspace-wide [`TetherError`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keyed state for one device: key name → current value.
///
/// A `BTreeMap` keeps iteration (and therefore encoded output) ordered by
/// key, which makes snapshots stable across calls.
pub type StateMap = BTreeMap<String, Value>;

// ────────────────────────────────────────────────────────────────────────────
// Identities
// ────────────────────────────────────────────────────────────────────────────

/// Index of a peripheral inside the [`Roster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeripheralId(pub usize);

/// Who owns (or is writing to) a state map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// A peripheral connection that has not completed its handshake yet.
    Unassigned,
    /// The remote control application.
    Surface,
    /// A configured microcontroller.
    Peripheral(PeripheralId),
}

// ────────────────────────────────────────────────────────────────────────────
// Values
// ────────────────────────────────────────────────────────────────────────────

/// A single state value.
///
/// Serialised untagged so that it maps onto a plain msgpack / TOML boolean or
/// integer with no wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
}

impl Value {
    /// Integer payload, if this is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(_) => None,
        }
    }

    /// Boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(_) => None,
        }
    }

    /// `true` when both values carry the same type.
    pub fn same_kind(&self, other: &Value) -> bool {
        matches!(
            (self, other),
            (Value::Bool(_), Value::Bool(_)) | (Value::Int(_), Value::Int(_))
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Roster
// ────────────────────────────────────────────────────────────────────────────

/// Declaration of one peripheral as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralSpec {
    /// Identity code the device sends in its `"ID"` field, e.g. `"A_A"`.
    pub code: String,
    /// Surface key reporting whether the device is present.  Defaults to
    /// `code`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_key: Option<String>,
    /// Command keys sent to the device and their idle values.
    pub defaults: StateMap,
}

/// A validated peripheral entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Peripheral {
    pub id: PeripheralId,
    pub code: String,
    pub presence_key: String,
    pub defaults: StateMap,
}

/// The fixed set of devices and their schemas, immutable after startup.
///
/// Construct with [`Roster::new`], which rejects ambiguous or inconsistent
/// declarations so that every surface key dispatches to exactly one
/// peripheral.
#[derive(Debug, Clone)]
pub struct Roster {
    surface: StateMap,
    peripherals: Vec<Peripheral>,
    owners: HashMap<String, PeripheralId>,
}

impl Roster {
    /// Validate and build a roster.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] when a peripheral code is empty or
    /// repeated, when two peripherals declare the same key, or when a
    /// presence key is missing from the surface schema or is not boolean.
    pub fn new(surface: StateMap, specs: Vec<PeripheralSpec>) -> Result<Self, TetherError> {
        let mut peripherals = Vec::with_capacity(specs.len());
        let mut owners = HashMap::new();
        let mut codes = HashSet::new();

        for (index, spec) in specs.into_iter().enumerate() {
            let id = PeripheralId(index);
            if spec.code.is_empty() {
                return Err(TetherError::Config(format!(
                    "peripheral #{index} has an empty identity code"
                )));
            }
            if !codes.insert(spec.code.clone()) {
                return Err(TetherError::Config(format!(
                    "peripheral code '{}' is declared twice",
                    spec.code
                )));
            }

            let presence_key = spec.presence_key.unwrap_or_else(|| spec.code.clone());
            match surface.get(&presence_key) {
                Some(Value::Bool(_)) => {}
                Some(other) => {
                    return Err(TetherError::Config(format!(
                        "presence key '{presence_key}' must be a bool, surface default is {}",
                        other.kind()
                    )));
                }
                None => {
                    return Err(TetherError::Config(format!(
                        "presence key '{presence_key}' of '{}' is not in the surface schema",
                        spec.code
                    )));
                }
            }

            for key in spec.defaults.keys() {
                if let Some(previous) = owners.insert(key.clone(), id) {
                    let PeripheralId(previous) = previous;
                    return Err(TetherError::Config(format!(
                        "key '{key}' is declared by both peripheral #{previous} and '{}'",
                        spec.code
                    )));
                }
            }

            peripherals.push(Peripheral {
                id,
                code: spec.code,
                presence_key,
                defaults: spec.defaults,
            });
        }

        Ok(Self {
            surface,
            peripherals,
            owners,
        })
    }

    /// Default values of the surface-owned (telemetry) map.
    pub fn surface_schema(&self) -> &StateMap {
        &self.surface
    }

    /// All configured peripherals in roster order.
    pub fn peripherals(&self) -> &[Peripheral] {
        &self.peripherals
    }

    /// Look up a peripheral by id.
    pub fn peripheral(&self, id: PeripheralId) -> Option<&Peripheral> {
        self.peripherals.get(id.0)
    }

    /// Resolve a wire identity code to a peripheral id.
    pub fn resolve_code(&self, code: &str) -> Option<PeripheralId> {
        self.peripherals.iter().find(|p| p.code == code).map(|p| p.id)
    }

    /// The peripheral whose schema contains `key`, if any.
    pub fn owner_of(&self, key: &str) -> Option<PeripheralId> {
        self.owners.get(key).copied()
    }

    /// Schema (default values) of `device`.  `None` for
    /// [`DeviceId::Unassigned`] and for ids outside the roster.
    pub fn schema(&self, device: DeviceId) -> Option<&StateMap> {
        match device {
            DeviceId::Unassigned => None,
            DeviceId::Surface => Some(&self.surface),
            DeviceId::Peripheral(id) => self.peripheral(id).map(|p| &p.defaults),
        }
    }

    /// Human-readable name of `device` for logs and error messages.
    pub fn label(&self, device: DeviceId) -> String {
        match device {
            DeviceId::Unassigned => "unassigned".to_string(),
            DeviceId::Surface => "surface".to_string(),
            DeviceId::Peripheral(id) => match self.peripheral(id) {
                Some(p) => p.code.clone(),
                None => format!("peripheral #{}", id.0),
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type spanning schema violations, wire decoding and
/// transport failures.
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Schema Error on {device}: {details}")]
    Schema { device: String, details: String },

    #[error("Invalid Operation on {device}: {details}")]
    InvalidOperation { device: String, details: String },

    #[error("Decode Error: {0}")]
    Decode(String),

    #[error("Encode Error: {0}")]
    Encode(String),

    #[error("Identity Mismatch: expected {expected}, received {received}")]
    IdentityMismatch { expected: String, received: String },

    #[error("Unknown Device: {0:?} is not in the roster")]
    UnknownDevice(String),

    #[error("Transport Error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Configuration Error: {0}")]
    Config(String),
}
