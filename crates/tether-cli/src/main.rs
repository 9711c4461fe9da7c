//! `tether` – surface ↔ microcontroller state bridge.
//!
//! 1. Initialises logging (see [`telemetry`]).
//! 2. Loads `~/.tether/config.toml` plus `TETHER_*` overrides (see [`config`]).
//! 3. Builds the shared state store from the configured roster and ramp
//!    policy.
//! 4. Starts the supervisor: one TCP listener for the surface, one reconnect
//!    loop per serial port.
//! 5. Runs until Ctrl-C or until a supervisor loop dies.
//!
//! `tether init-config` instead writes the built-in defaults to the config
//! path (unless a file is already there) and exits, as a starting point for
//! describing a different vehicle.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use tether_link::{Supervisor, SupervisorHandle};
use tether_store::StateStore;
use tether_types::TetherError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("tether");

    if std::env::args().nth(1).as_deref() == Some("init-config") {
        return init_config();
    }

    let handle = match start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start the bridge");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = handle.wait() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "supervisor loop panicked");
                ExitCode::FAILURE
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for Ctrl-C");
                return ExitCode::FAILURE;
            }
            info!("Ctrl-C received, shutting down");
            ExitCode::SUCCESS
        }
    }
}

fn init_config() -> ExitCode {
    let path = config::config_path();
    if path.exists() {
        warn!(config = %path.display(), "config file already exists, leaving it untouched");
        return ExitCode::FAILURE;
    }
    match config::save_to(&config::Config::default(), &path) {
        Ok(()) => {
            info!(config = %path.display(), "wrote default configuration");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to write configuration");
            ExitCode::FAILURE
        }
    }
}

async fn start() -> Result<SupervisorHandle, TetherError> {
    let path = config::config_path();
    let cfg = config::load()?;
    info!(config = %path.display(), "configuration loaded");

    let roster = cfg.roster()?;
    let store = Arc::new(StateStore::new(roster, cfg.ramp.clone())?);
    for peripheral in store.roster().peripherals() {
        info!(
            device = %peripheral.code,
            keys = peripheral.defaults.len(),
            presence = %peripheral.presence_key,
            "peripheral registered"
        );
    }

    if cfg.serial.ports.is_empty() {
        warn!("no serial ports configured, only the surface link will run");
    }
    let connectors = cfg.serial.connectors();

    Supervisor::new(store, cfg.surface, cfg.serial, cfg.reconnect, connectors)
        .start()
        .await
}
