//! Daemon Settings
//!
//! Persistent settings stored as JSON in /etc/yogavpc/config.json

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vpc_error::{Result, VpcError};

use crate::constants::{aggregator, gate, paths};
use crate::gate::GateOptions;
use crate::platform::PlatformKind;

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Platform family the device belongs to
    pub platform: PlatformKind,

    /// ACPI path of the VPC device; the profile default when unset
    pub device_path: Option<String>,

    /// acpi_call interface file
    pub acpi_call_path: PathBuf,

    /// ec_sys register file; firmware methods are used when absent
    pub ec_io_path: PathBuf,

    /// Upper bound on a single serializer turn
    pub turn_timeout_ms: u64,

    /// Pending turns before submitters wait
    pub queue_depth: usize,

    /// Socket the sensor aggregator publishes on
    pub aggregator_socket: Option<PathBuf>,

    /// How often to look for a (re)published aggregator
    pub aggregator_poll_ms: u64,

    /// Control socket served by the daemon
    pub socket_path: PathBuf,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            platform: PlatformKind::default(),
            device_path: None,
            acpi_call_path: PathBuf::from(paths::ACPI_CALL),
            ec_io_path: PathBuf::from(paths::EC_IO),
            turn_timeout_ms: gate::DEFAULT_TURN_TIMEOUT_MS,
            queue_depth: gate::DEFAULT_QUEUE_DEPTH,
            aggregator_socket: None,
            aggregator_poll_ms: aggregator::DEFAULT_POLL_MS,
            socket_path: PathBuf::from(paths::DAEMON_SOCKET),
        }
    }
}

impl DaemonSettings {
    /// Clamp values into their supported ranges
    pub fn sanitize(&mut self) {
        let clamped = self.turn_timeout_ms.clamp(gate::MIN_TURN_TIMEOUT_MS, gate::MAX_TURN_TIMEOUT_MS);
        if clamped != self.turn_timeout_ms {
            warn!("turn_timeout_ms {} out of range, using {}", self.turn_timeout_ms, clamped);
            self.turn_timeout_ms = clamped;
        }
        if self.queue_depth == 0 {
            warn!("queue_depth 0 is not usable, using 1");
            self.queue_depth = 1;
        }
        if self.aggregator_poll_ms == 0 {
            self.aggregator_poll_ms = aggregator::DEFAULT_POLL_MS;
        }
    }

    /// Device path, falling back to the platform default
    pub fn device(&self) -> String {
        self.device_path
            .clone()
            .unwrap_or_else(|| self.platform.profile().default_device().to_string())
    }

    pub fn gate_options(&self) -> GateOptions {
        GateOptions {
            turn_timeout: Duration::from_millis(self.turn_timeout_ms),
            queue_depth: self.queue_depth,
        }
    }

    pub fn aggregator_poll(&self) -> Duration {
        Duration::from_millis(self.aggregator_poll_ms)
    }
}

pub fn get_settings_path() -> PathBuf {
    PathBuf::from(paths::CONFIG_FILE)
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<DaemonSettings> {
    let mut settings = match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<DaemonSettings>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No settings at {}, using defaults", path.display());
            DaemonSettings::default()
        }
        Err(e) => {
            return Err(VpcError::config(format!("cannot read {}: {}", path.display(), e)));
        }
    };
    settings.sanitize();
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &DaemonSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    fs::write(path, content)?;
    Ok(())
}
