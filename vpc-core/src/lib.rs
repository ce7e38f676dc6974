//! YogaVPC Core Library
//!
//! State synchronization and command serialization for Lenovo laptop
//! platform features reached through the VPC ACPI device.
//!
//! # Module Structure
//!
//! - `ec` - firmware method calls and raw EC register access
//! - `gate` - the single-writer command serializer
//! - `toggle` - per-feature cached state and the query/set protocol
//! - `power` - sleep/wake transitions and resynchronization
//! - `aggregator` - registration with the external sensor aggregator
//! - `platform` / `property` - capability tables and the property name table
//! - `driver` - the facade tying them together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpc_core::{AcpiCallFirmware, DeviceHandle, GateOptions, PlatformKind, ServiceNotifier, VpcDriver};
//! use vpc_protocol::PropertyValue;
//!
//! # async fn demo() -> vpc_core::Result<()> {
//! let firmware = Arc::new(AcpiCallFirmware::new("/proc/acpi/call", None));
//! let profile = PlatformKind::Ideapad.profile();
//! let device = DeviceHandle::new(profile.default_device(), firmware);
//! let driver = VpcDriver::attach(device, profile, GateOptions::default(), &ServiceNotifier::new()).await?;
//!
//! driver.set_property("ConservationMode", &PropertyValue::Bool(true)).await?;
//! driver.detach().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod constants;
pub mod driver;
pub mod ec;
pub mod gate;
pub mod platform;
pub mod power;
pub mod property;
pub mod registry;
pub mod settings;
pub mod toggle;

// Re-export error types
pub use vpc_error::{ErrorKind, Result, VpcError};

pub use aggregator::{
    handoff, Aggregator, PluginInfo, Published, RegistrationPhase, RegistrationState, SensorKey,
    ServiceNotifier,
};
pub use driver::{Outcome, VpcDriver};
pub use ec::{parse_call_output, validate_method_name, AcpiCallFirmware, DeviceHandle, EcAccess, Firmware};
pub use gate::{CommandGate, GateOptions};
pub use platform::{Feature, Generic, Ideapad, PlatformKind, PlatformProfile, Thinkpad, ToggleKind, ToggleSpec};
pub use power::{PowerState, ResyncReport};
pub use property::{Command, Property};
pub use registry::{Registry, Snapshot, SnapshotReader, ToggleSnapshot};
pub use settings::{get_settings_path, load_settings, save_settings, DaemonSettings};
pub use toggle::{Applied, Toggle, ToggleState};
