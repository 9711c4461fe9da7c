//! [`StateStore`] – the single source of truth for every device's state.
//!
//! The store keeps one [`StateMap`] per device identity, each seeded from the
//! [`Roster`] schema and guarded by its own mutex.  Writes are routed by the
//! identity of the writer:
//!
//! * **Surface** writes are commands.  Each key is dispatched to the one
//!   peripheral whose schema declares it and written through the
//!   [`RampPolicy`].
//! * **Peripheral** writes are telemetry.  Keys must belong to the surface
//!   schema and are assigned directly into the surface map.
//!
//! Every call validates all of its keys (and their value types) before it
//! touches any map, so a rejected call leaves the store unchanged and the key
//! set of every map always equals its schema.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tether_types::{DeviceId, PeripheralId, Roster, StateMap, TetherError, Value};
use tracing::{debug, info};

use crate::ramp::RampPolicy;

/// Central keyed store with dispatch and ramping.
///
/// Share it between sessions behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct StateStore {
    roster: Roster,
    ramp: RampPolicy,
    surface: Mutex<StateMap>,
    peripherals: Vec<Mutex<StateMap>>,
}

impl StateStore {
    /// Seed every map with its schema defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] if `ramp` does not fit `roster`.
    pub fn new(roster: Roster, ramp: RampPolicy) -> Result<Self, TetherError> {
        ramp.validate(&roster)?;
        let surface = Mutex::new(roster.surface_schema().clone());
        let peripherals = roster
            .peripherals()
            .iter()
            .map(|p| Mutex::new(p.defaults.clone()))
            .collect();
        Ok(Self {
            roster,
            ramp,
            surface,
            peripherals,
        })
    }

    /// The roster this store was built from.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The ramp policy applied to surface commands.
    pub fn ramp_policy(&self) -> &RampPolicy {
        &self.ramp
    }

    /// Schema defaults of `device`, if it has a schema.
    pub fn defaults(&self, device: DeviceId) -> Option<&StateMap> {
        self.roster.schema(device)
    }

    /// Read stored values of `device`.
    ///
    /// An empty `keys` slice returns a copy of the whole map; otherwise only
    /// the requested keys are returned.
    ///
    /// # Errors
    ///
    /// * [`TetherError::Schema`] – a requested key is not in the schema.
    /// * [`TetherError::InvalidOperation`] – `device` is
    ///   [`DeviceId::Unassigned`].
    /// * [`TetherError::UnknownDevice`] – the peripheral id is not in the
    ///   roster.
    pub fn get(&self, device: DeviceId, keys: &[&str]) -> Result<StateMap, TetherError> {
        let map = lock(self.slot(device)?);
        if keys.is_empty() {
            return Ok(map.clone());
        }

        let mut selected = StateMap::new();
        for key in keys {
            match map.get(*key) {
                Some(value) => {
                    selected.insert((*key).to_string(), *value);
                }
                None => {
                    return Err(TetherError::Schema {
                        device: self.roster.label(device),
                        details: format!("unknown key '{key}'"),
                    });
                }
            }
        }
        Ok(selected)
    }

    /// Shorthand for [`get`][Self::get] with no key filter.
    pub fn snapshot(&self, device: DeviceId) -> Result<StateMap, TetherError> {
        self.get(device, &[])
    }

    /// Write `values` on behalf of `device`.
    ///
    /// With `reset_to_default` set (surface only) `values` is ignored and
    /// every peripheral map is restored to its schema defaults.
    ///
    /// # Errors
    ///
    /// * [`TetherError::Schema`] – a surface key belongs to no peripheral, a
    ///   peripheral key is outside the surface schema, or a value has the
    ///   wrong type.
    /// * [`TetherError::InvalidOperation`] – `reset_to_default` from a
    ///   peripheral, or any write from [`DeviceId::Unassigned`].
    /// * [`TetherError::UnknownDevice`] – the peripheral id is not in the
    ///   roster.
    pub fn set(
        &self,
        device: DeviceId,
        reset_to_default: bool,
        values: StateMap,
    ) -> Result<(), TetherError> {
        match device {
            DeviceId::Unassigned => Err(TetherError::InvalidOperation {
                device: self.roster.label(device),
                details: "writes require a completed handshake".to_string(),
            }),
            DeviceId::Surface if reset_to_default => {
                self.reset_peripherals();
                Ok(())
            }
            DeviceId::Surface => self.dispatch_commands(values),
            DeviceId::Peripheral(id) => {
                if self.peripherals.get(id.0).is_none() {
                    return Err(TetherError::UnknownDevice(self.roster.label(device)));
                }
                if reset_to_default {
                    return Err(TetherError::InvalidOperation {
                        device: self.roster.label(device),
                        details: "resetting to defaults is only supported for the surface"
                            .to_string(),
                    });
                }
                self.assign_telemetry(device, values)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    fn slot(&self, device: DeviceId) -> Result<&Mutex<StateMap>, TetherError> {
        match device {
            DeviceId::Unassigned => Err(TetherError::InvalidOperation {
                device: self.roster.label(device),
                details: "an unassigned device has no state".to_string(),
            }),
            DeviceId::Surface => Ok(&self.surface),
            DeviceId::Peripheral(id) => self
                .peripherals
                .get(id.0)
                .ok_or_else(|| TetherError::UnknownDevice(self.roster.label(device))),
        }
    }

    fn reset_peripherals(&self) {
        info!("restoring peripheral command maps to defaults");
        for (slot, peripheral) in self.peripherals.iter().zip(self.roster.peripherals()) {
            *lock(slot) = peripheral.defaults.clone();
        }
    }

    // Surface → peripherals.  Keys are grouped by owner so each destination
    // map is locked once.
    fn dispatch_commands(&self, values: StateMap) -> Result<(), TetherError> {
        let mut batches: BTreeMap<PeripheralId, Vec<(String, Value)>> = BTreeMap::new();
        for (key, value) in values {
            let owner = self.roster.owner_of(&key).ok_or_else(|| TetherError::Schema {
                device: self.roster.label(DeviceId::Surface),
                details: format!("key '{key}' is not declared by any peripheral"),
            })?;
            let default = self
                .roster
                .peripheral(owner)
                .and_then(|p| p.defaults.get(&key));
            self.check_kind(DeviceId::Peripheral(owner), &key, default, &value)?;
            batches.entry(owner).or_default().push((key, value));
        }

        for (owner, batch) in batches {
            let mut map = lock(&self.peripherals[owner.0]);
            for (key, value) in batch {
                self.ramp.apply(&key, value, &mut map);
            }
        }
        Ok(())
    }

    // Peripheral → surface.  Direct assignment, no ramping.
    fn assign_telemetry(&self, device: DeviceId, values: StateMap) -> Result<(), TetherError> {
        let schema = self.roster.surface_schema();
        for (key, value) in &values {
            match schema.get(key) {
                Some(default) => self.check_kind(device, key, Some(default), value)?,
                None => {
                    return Err(TetherError::Schema {
                        device: self.roster.label(device),
                        details: format!("key '{key}' is not part of the surface schema"),
                    });
                }
            }
        }

        if !values.is_empty() {
            debug!(device = %self.roster.label(device), keys = values.len(), "telemetry update");
        }
        let mut map = lock(&self.surface);
        map.extend(values);
        Ok(())
    }

    fn check_kind(
        &self,
        device: DeviceId,
        key: &str,
        default: Option<&Value>,
        value: &Value,
    ) -> Result<(), TetherError> {
        match default {
            Some(default) if default.same_kind(value) => Ok(()),
            Some(default) => Err(TetherError::Schema {
                device: self.roster.label(device),
                details: format!("key '{key}' expects a value like {default}, got {value}"),
            }),
            None => Err(TetherError::Schema {
                device: self.roster.label(device),
                details: format!("unknown key '{key}'"),
            }),
        }
    }
}

// A poisoned map still holds a schema-complete state, so keep using it.
fn lock(map: &Mutex<StateMap>) -> MutexGuard<'_, StateMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}
