//! Platform profiles
//!
//! A profile is the per-family capability table: which toggles exist, which
//! firmware methods back them, and the optional device hooks run at attach
//! and for the `VPCconfig` dump. Families without a hook keep the default
//! (no-op) implementation.

use serde::{Deserialize, Serialize};

use crate::constants::devices;

/// Software-visible features backed by a firmware method pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    ClamshellMode,
    ConservationMode,
    BacklightMode,
    KeyboardMode,
    FanControl,
    Mute,
    EcLock,
    FnLock,
    Battery,
}

impl Feature {
    pub const ALL: [Feature; 9] = [
        Feature::ClamshellMode,
        Feature::ConservationMode,
        Feature::BacklightMode,
        Feature::KeyboardMode,
        Feature::FanControl,
        Feature::Mute,
        Feature::EcLock,
        Feature::FnLock,
        Feature::Battery,
    ];

    /// Property name used on the configuration boundary
    pub fn property(&self) -> &'static str {
        match self {
            Feature::ClamshellMode => "ClamshellMode",
            Feature::ConservationMode => "ConservationMode",
            Feature::BacklightMode => "BacklightMode",
            Feature::KeyboardMode => "KeyboardMode",
            Feature::FanControl => "FanControl",
            Feature::Mute => "Mute",
            Feature::EcLock => "ECLock",
            Feature::FnLock => "FnlockMode",
            Feature::Battery => "Battery",
        }
    }

    pub fn from_property(name: &str) -> Option<Feature> {
        Feature::ALL.into_iter().find(|f| f.property() == name)
    }
}

/// How a query result is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleKind {
    /// Bit 0 of the query result
    Boolean,
    /// Raw EC value, accepted up to `max` on set
    Numeric { max: u32 },
}

/// Firmware method pair backing one feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleSpec {
    pub feature: Feature,
    pub query: &'static str,
    /// None for read-only features
    pub set: Option<&'static str>,
    pub kind: ToggleKind,
}

impl ToggleSpec {
    pub const fn boolean(feature: Feature, query: &'static str, set: &'static str) -> Self {
        Self { feature, query, set: Some(set), kind: ToggleKind::Boolean }
    }

    pub const fn numeric(feature: Feature, query: &'static str, set: &'static str, max: u32) -> Self {
        Self { feature, query, set: Some(set), kind: ToggleKind::Numeric { max } }
    }

    pub const fn read_only(feature: Feature, query: &'static str) -> Self {
        Self { feature, query, set: None, kind: ToggleKind::Numeric { max: u32::MAX } }
    }
}

/// Device-specific capabilities of a platform family.
pub trait PlatformProfile: Send + Sync {
    fn name(&self) -> &'static str;

    /// Toggles in declaration order. Resync walks them in this order.
    fn toggles(&self) -> &'static [ToggleSpec];

    /// ACPI path of the VPC device when the configuration does not name one
    fn default_device(&self) -> &'static str {
        devices::IDEAPAD_VPC
    }

    /// Method evaluated at attach (and on `reset`) to confirm the device answers
    fn init_probe(&self) -> Option<&'static str> {
        None
    }

    /// Methods dumped by `VPCconfig`
    fn config_methods(&self) -> &'static [&'static str] {
        &[]
    }

    fn spec(&self, feature: Feature) -> Option<&'static ToggleSpec> {
        self.toggles().iter().find(|t| t.feature == feature)
    }
}

// ============================================================================
// Profiles
// ============================================================================

/// Any VPC device: clamshell mode only
pub struct Generic;

impl PlatformProfile for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn toggles(&self) -> &'static [ToggleSpec] {
        const TOGGLES: &[ToggleSpec] = &[ToggleSpec::boolean(Feature::ClamshellMode, "GCSM", "SCSM")];
        TOGGLES
    }
}

/// IdeaPad and Yoga laptops (VPC2004)
pub struct Ideapad;

impl PlatformProfile for Ideapad {
    fn name(&self) -> &'static str {
        "ideapad"
    }

    fn toggles(&self) -> &'static [ToggleSpec] {
        const TOGGLES: &[ToggleSpec] = &[
            ToggleSpec::boolean(Feature::ClamshellMode, "GCSM", "SCSM"),
            ToggleSpec::boolean(Feature::ConservationMode, "GBMD", "SBMC"),
            ToggleSpec::boolean(Feature::BacklightMode, "GKBL", "SKBL"),
            ToggleSpec::numeric(Feature::FanControl, "GFAN", "SFAN", 4),
            ToggleSpec::boolean(Feature::FnLock, "GFNL", "SFNL"),
            ToggleSpec::read_only(Feature::Battery, "GBID"),
        ];
        TOGGLES
    }

    fn init_probe(&self) -> Option<&'static str> {
        Some("_CFG")
    }

    fn config_methods(&self) -> &'static [&'static str] {
        &["_CFG", "GBID"]
    }
}

/// ThinkPad hotkey device
pub struct Thinkpad;

impl PlatformProfile for Thinkpad {
    fn name(&self) -> &'static str {
        "thinkpad"
    }

    fn toggles(&self) -> &'static [ToggleSpec] {
        const TOGGLES: &[ToggleSpec] = &[
            ToggleSpec::boolean(Feature::ClamshellMode, "GCSM", "SCSM"),
            ToggleSpec::numeric(Feature::BacklightMode, "MLCG", "MLCS", 2),
            ToggleSpec::numeric(Feature::KeyboardMode, "GKBM", "SKBM", 3),
            ToggleSpec::numeric(Feature::FanControl, "GFAN", "SFAN", 7),
            ToggleSpec::boolean(Feature::Mute, "GSMS", "SSMS"),
            ToggleSpec::boolean(Feature::EcLock, "GECL", "SECL"),
            ToggleSpec::boolean(Feature::FnLock, "GFNL", "SFNL"),
        ];
        TOGGLES
    }

    fn default_device(&self) -> &'static str {
        devices::THINKPAD_HKEY
    }

    fn init_probe(&self) -> Option<&'static str> {
        Some("MHKV")
    }

    fn config_methods(&self) -> &'static [&'static str] {
        &["MHKV", "MHKA"]
    }
}

/// Profile selector used in the configuration file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[default]
    Generic,
    Ideapad,
    Thinkpad,
}

impl PlatformKind {
    pub fn profile(self) -> &'static dyn PlatformProfile {
        match self {
            PlatformKind::Generic => &Generic,
            PlatformKind::Ideapad => &Ideapad,
            PlatformKind::Thinkpad => &Thinkpad,
        }
    }
}
