//! `tether-link` – the transports around the [`StateStore`][tether_store::StateStore].
//!
//! # Modules
//!
//! - [`codec`] – msgpack encoding of state maps and peripheral frames.
//! - [`surface`] – [`SurfaceSession`]: one TCP client sending commands and
//!   receiving telemetry.
//! - [`peripheral`] – [`PeripheralSession`]: handshake and newline-framed
//!   exchange with one serial device.
//! - [`transport`] – the [`SerialLink`] and [`Connector`] seams plus the
//!   `tokio-serial` implementation.
//! - [`backoff`] – retry pacing for the reconnect loops.
//! - [`supervisor`] – [`Supervisor`]: spawns and restarts every session.

pub mod backoff;
pub mod codec;
pub mod peripheral;
pub mod supervisor;
pub mod surface;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use peripheral::{PeripheralSession, PeripheralState};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use surface::{SurfaceConfig, SurfaceSession, SurfaceState};
pub use transport::{Connector, SerialConfig, SerialConnector, SerialLink};
