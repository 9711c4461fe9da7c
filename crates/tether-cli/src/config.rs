//! Bridge configuration – reads/writes `~/.tether/config.toml`.
//!
//! Every section is optional; anything left out falls back to the stock ROV
//! deployment (surface on `0.0.0.0:50000`, a thruster board `A_A` and a
//! manipulator board `A_B`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_link::{BackoffConfig, SerialConfig, SurfaceConfig};
use tether_store::RampPolicy;
use tether_types::{PeripheralSpec, Roster, StateMap, TetherError, Value};

/// Idle pulse width for every actuator.
const IDLE: i64 = 1_500;

const THRUSTERS: [&str; 8] = [
    "T_HFP", "T_HFS", "T_HAP", "T_HAS", "T_VFP", "T_VFS", "T_VAP", "T_VAS",
];

/// Everything the `tether` binary needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub surface: SurfaceConfig,

    #[serde(default)]
    pub serial: SerialConfig,

    /// Pacing of surface accept and serial reconnect retries.
    #[serde(default)]
    pub reconnect: BackoffConfig,

    #[serde(default = "default_ramp")]
    pub ramp: RampPolicy,

    #[serde(default)]
    pub devices: Devices,
}

/// Device schemas: the surface map plus one entry per peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Devices {
    /// Telemetry keys reported to the surface and their initial values.
    #[serde(default = "default_surface")]
    pub surface: StateMap,

    #[serde(default = "default_peripherals")]
    pub peripherals: Vec<PeripheralSpec>,
}

fn default_ramp() -> RampPolicy {
    RampPolicy::new(2, THRUSTERS.into_iter().chain(["T_M"]))
}

fn default_surface() -> StateMap {
    StateMap::from([
        ("A_A".to_string(), Value::Bool(false)),
        ("A_B".to_string(), Value::Bool(false)),
        ("S_A".to_string(), Value::Int(0)),
        ("S_B".to_string(), Value::Int(0)),
    ])
}

fn idle(keys: &[&str]) -> StateMap {
    keys.iter()
        .map(|key| (key.to_string(), Value::Int(IDLE)))
        .collect()
}

fn default_peripherals() -> Vec<PeripheralSpec> {
    vec![
        PeripheralSpec {
            code: "A_A".to_string(),
            presence_key: None,
            defaults: idle(&THRUSTERS),
        },
        PeripheralSpec {
            code: "A_B".to_string(),
            presence_key: None,
            defaults: idle(&["T_M", "M_G", "M_C"]),
        },
    ]
}

impl Default for Devices {
    fn default() -> Self {
        Self {
            surface: default_surface(),
            peripherals: default_peripherals(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            surface: SurfaceConfig::default(),
            serial: SerialConfig::default(),
            reconnect: BackoffConfig::default(),
            ramp: default_ramp(),
            devices: Devices::default(),
        }
    }
}

impl Config {
    /// Validate the device section into a [`Roster`].
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Config`] for duplicate codes, keys owned by two
    /// peripherals, or presence keys missing from the surface map.
    pub fn roster(&self) -> Result<Roster, TetherError> {
        Roster::new(
            self.devices.surface.clone(),
            self.devices.peripherals.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Loading and saving
// ---------------------------------------------------------------------------

/// Path from `TETHER_CONFIG`, else `~/.tether/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TETHER_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tether").join("config.toml")
}

/// Load the config from [`config_path`] and apply `TETHER_*` overrides.
pub fn load() -> Result<Config, TetherError> {
    let mut cfg = load_from(&config_path())?;
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config at `path`.  A missing file yields [`Config::default`].
pub(crate) fn load_from(path: &Path) -> Result<Config, TetherError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TetherError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map_err(|e| TetherError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `TETHER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TETHER_HOST` | `surface.host` |
/// | `TETHER_PORT` | `surface.port` |
/// | `TETHER_BUFFER_SIZE` | `surface.buffer_size` |
/// | `TETHER_SERIAL_PORTS` | `serial.ports` (comma separated) |
/// | `TETHER_BAUD_RATE` | `serial.baud_rate` |
/// | `TETHER_READ_TIMEOUT_MS` | `serial.read_timeout_ms` |
/// | `TETHER_WRITE_TIMEOUT_MS` | `serial.write_timeout_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// Override logic behind [`apply_env_overrides`], with the variable lookup
/// injected so tests need not touch the process environment.
pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("TETHER_HOST") {
        cfg.surface.host = v;
    }
    if let Some(port) = var("TETHER_PORT").and_then(|v| v.parse().ok()) {
        cfg.surface.port = port;
    }
    if let Some(size) = var("TETHER_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
        cfg.surface.buffer_size = size;
    }
    if let Some(v) = var("TETHER_SERIAL_PORTS") {
        cfg.serial.ports = v
            .split(',')
            .map(str::trim)
            .filter(|port| !port.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(baud) = var("TETHER_BAUD_RATE").and_then(|v| v.parse().ok()) {
        cfg.serial.baud_rate = baud;
    }
    if let Some(ms) = var("TETHER_READ_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        cfg.serial.read_timeout_ms = ms;
    }
    if let Some(ms) = var("TETHER_WRITE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        cfg.serial.write_timeout_ms = ms;
    }
}

/// Write `cfg` to `path` as pretty TOML, creating parent directories.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), TetherError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TetherError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| TetherError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| TetherError::Config(format!("failed to write {}: {e}", path.display())))
}
