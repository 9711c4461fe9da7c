//! Rate limiting for thruster-style command keys.
//!
//! A [`RampPolicy`] names the keys whose stored value must move toward a
//! target by one fixed step per update instead of jumping there.  The step is
//! applied whole even when it carries the value past the target, so a key at
//! `1500` ramping toward `1503` with step `2` goes `1500 → 1502 → 1504`; the
//! next update then steps back toward the target.
//!
//! # Example
//!
//! ```rust
//! use tether_store::ramp::ramp_toward;
//!
//! assert_eq!(ramp_toward(1500, 1503, 2), 1502);
//! assert_eq!(ramp_toward(1502, 1503, 2), 1504);
//! assert_eq!(ramp_toward(1504, 1504, 2), 1504);
//! ```

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tether_types::{Roster, StateMap, TetherError, Value};
use tracing::trace;

/// One ramp step from `current` toward `target`.
///
/// Moves by exactly `step` in the direction of `target`, overshooting when
/// `step` is larger than the remaining distance.  Returns `current` unchanged
/// once it equals `target`.
pub fn ramp_toward(current: i64, target: i64, step: i64) -> i64 {
    match current.cmp(&target) {
        Ordering::Greater => current.saturating_sub(step),
        Ordering::Less => current.saturating_add(step),
        Ordering::Equal => current,
    }
}

/// Set of rate-limited keys plus the shared step magnitude.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampPolicy {
    /// Maximum change applied to a ramp key per update.
    pub step: i64,
    /// Keys (from peripheral schemas) that are rate-limited.
    #[serde(default)]
    pub keys: BTreeSet<String>,
}

impl RampPolicy {
    /// Build a policy ramping `keys` by `step`.
    pub fn new<I, K>(step: i64, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            step,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// A policy that ramps nothing.
    pub fn disabled() -> Self {
        Self::new(1, Vec::<String>::new())
    }

    /// `true` when `key` is rate-limited.
    pub fn is_ramped(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Check the policy against `roster`.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] when the step is not positive, or when
    /// a ramp key is not declared by any peripheral or has a non-integer
    /// default.
    pub fn validate(&self, roster: &Roster) -> Result<(), TetherError> {
        if self.step <= 0 {
            return Err(TetherError::Config(format!(
                "ramp step must be positive, got {}",
                self.step
            )));
        }
        for key in &self.keys {
            let default = roster
                .owner_of(key)
                .and_then(|id| roster.peripheral(id))
                .and_then(|p| p.defaults.get(key));
            match default {
                Some(Value::Int(_)) => {}
                Some(Value::Bool(_)) => {
                    return Err(TetherError::Config(format!(
                        "ramp key '{key}' has a boolean default"
                    )));
                }
                None => {
                    return Err(TetherError::Config(format!(
                        "ramp key '{key}' is not declared by any peripheral"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write `target` for `key` into `map`: one ramp step for ramp keys, a
    /// direct assignment for everything else.  Keys absent from `map` are
    /// left alone so the key set never changes.
    pub fn apply(&self, key: &str, target: Value, map: &mut StateMap) {
        let Some(slot) = map.get_mut(key) else {
            return;
        };
        if !self.is_ramped(key) {
            *slot = target;
            return;
        }
        match (slot.as_int(), target.as_int()) {
            (Some(current), Some(goal)) => {
                let next = ramp_toward(current, goal, self.step);
                trace!(key, current, target = goal, next, "ramp step");
                *slot = Value::Int(next);
            }
            _ => *slot = target,
        }
    }
}

impl Default for RampPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}
