//! Constants and configuration values for YogaVPC
//!
//! Centralizes paths, firmware method names and defaults.
//! Add new magic numbers here instead of scattering them across modules.

use std::time::Duration;

use crate::platform::Feature;

/// System paths
pub mod paths {
    /// Daemon configuration file
    pub const CONFIG_FILE: &str = "/etc/yogavpc/config.json";

    /// Daemon control socket
    pub const DAEMON_SOCKET: &str = "/run/yogavpc.sock";

    /// Daemon PID file
    pub const PID_FILE: &str = "/run/yogavpcd.pid";

    /// acpi_call kernel interface
    pub const ACPI_CALL: &str = "/proc/acpi/call";

    /// ec_sys debugfs register file
    pub const EC_IO: &str = "/sys/kernel/debug/ec/ec0/io";

    /// Present when systemd-journald is accepting native log records
    pub const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";
}

/// ACPI device paths of the VPC device per platform family
pub mod devices {
    /// IdeaPad / Yoga VPC2004 device
    pub const IDEAPAD_VPC: &str = "\\_SB.PCI0.LPCB.EC0.VPC0";

    /// ThinkPad hotkey device
    pub const THINKPAD_HKEY: &str = "\\_SB.PCI0.LPCB.EC.HKEY";
}

/// Firmware method naming
pub mod firmware {
    /// Longest ACPI name segment
    pub const METHOD_NAME_MAX: usize = 4;

    /// Read one EC byte: RE1B(offset) -> byte
    pub const EC_READ_METHOD: &str = "RE1B";

    /// Write one EC byte: WE1B(offset, value)
    pub const EC_WRITE_METHOD: &str = "WE1B";

    /// acpi_call error marker for an absent method
    pub const AE_NOT_FOUND: &str = "AE_NOT_FOUND";
}

/// Command serializer tuning
pub mod gate {
    use super::Duration;

    pub const DEFAULT_TURN_TIMEOUT_MS: u64 = 5_000;
    pub const MIN_TURN_TIMEOUT_MS: u64 = 50;
    pub const MAX_TURN_TIMEOUT_MS: u64 = 60_000;

    /// Pending turns before submitters start waiting for queue space
    pub const DEFAULT_QUEUE_DEPTH: usize = 32;

    pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TURN_TIMEOUT_MS);
}

/// Sensor aggregator integration
pub mod aggregator {
    use super::Feature;

    /// Plugin name announced with every handoff
    pub const PLUGIN_NAME: &str = "YogaVPC";

    /// How often the daemon looks for a (re)published aggregator socket
    pub const DEFAULT_POLL_MS: u64 = 2_000;

    /// Capacity of the publish broadcast channel
    pub const NOTIFIER_CAPACITY: usize = 8;

    /// Fixed key set pushed to the aggregator, one per aggregated feature
    pub const KEYS: &[(Feature, &str)] = &[
        (Feature::ClamshellMode, "VCSM"),
        (Feature::ConservationMode, "VBCM"),
        (Feature::BacklightMode, "VBKL"),
        (Feature::FanControl, "VFAN"),
        (Feature::Battery, "VBAT"),
    ];
}

/// IPC limits
pub mod ipc {
    use std::time::Duration;

    /// Maximum concurrent client connections to the daemon
    pub const MAX_CONNECTIONS: usize = 16;

    pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Client-side wait for a response; covers a full resync of every toggle
    pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);
}
