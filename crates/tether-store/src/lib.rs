//! `tether-store` – authoritative device state
//!
//! Holds the command and telemetry maps shared by every session and owns the
//! only dispatch and ramping logic in the system.
//!
//! # Modules
//!
//! - [`store`] – [`StateStore`][store::StateStore]: per-device keyed maps
//!   with schema enforcement, surface → peripheral dispatch, and
//!   peripheral → surface telemetry writes.
//! - [`ramp`] – [`RampPolicy`][ramp::RampPolicy]: the rate limit applied to
//!   thruster-style command keys.

pub mod ramp;
pub mod store;

pub use ramp::RampPolicy;
pub use store::StateStore;
