//! Driver state owned by the serializer worker
//!
//! Everything that touches the EC lives here and is only reachable through a
//! serializer turn. Outside code sees a [`Snapshot`], republished after
//! every turn.

use tokio::sync::watch;
use vpc_error::{Result, VpcError};

use crate::aggregator::{RegistrationPhase, RegistrationState, SensorKey};
use crate::constants::aggregator::KEYS;
use crate::ec::{DeviceHandle, EcAccess};
use crate::platform::{Feature, PlatformProfile};
use crate::power::PowerState;
use crate::toggle::{Toggle, ToggleState};

pub struct Registry {
    pub(crate) ec: EcAccess,
    pub(crate) profile: &'static dyn PlatformProfile,
    pub(crate) toggles: Vec<Toggle>,
    pub(crate) power: PowerState,
    pub(crate) registration: RegistrationState,
}

impl Registry {
    pub fn new(device: DeviceHandle, profile: &'static dyn PlatformProfile) -> Self {
        Self {
            ec: EcAccess::new(device),
            profile,
            toggles: profile.toggles().iter().copied().map(Toggle::new).collect(),
            power: PowerState::Active,
            registration: RegistrationState::Unregistered,
        }
    }

    pub fn ec(&self) -> &EcAccess {
        &self.ec
    }

    pub fn profile(&self) -> &'static dyn PlatformProfile {
        self.profile
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn registration(&self) -> &RegistrationState {
        &self.registration
    }

    pub fn toggle(&self, feature: Feature) -> Option<&Toggle> {
        self.toggles.iter().find(|t| t.feature() == feature)
    }

    /// Features in declaration order
    pub fn features(&self) -> Vec<Feature> {
        self.toggles.iter().map(Toggle::feature).collect()
    }

    /// Borrow the EC alongside one toggle
    pub fn split(&mut self, feature: Feature) -> Result<(&EcAccess, &mut Toggle)> {
        let profile = self.profile.name();
        let toggle = self
            .toggles
            .iter_mut()
            .find(|t| t.feature() == feature)
            .ok_or_else(|| {
                VpcError::method_missing(format!("{} ({} platform)", feature.property(), profile))
            })?;
        Ok((&self.ec, toggle))
    }

    /// Fail while the EC may be unpowered
    pub fn ensure_awake(&self) -> Result<()> {
        match self.power {
            PowerState::Active => Ok(()),
            PowerState::Sleeping => Err(VpcError::unavailable("system is sleeping")),
        }
    }

    pub(crate) fn invalidate(&mut self, feature: Feature) {
        if let Some(toggle) = self.toggles.iter_mut().find(|t| t.feature() == feature) {
            toggle.invalidate();
        }
    }

    pub(crate) fn mark_all_stale(&mut self) {
        self.toggles.iter_mut().for_each(Toggle::mark_stale);
    }

    /// Current key set for the aggregator
    pub fn sensor_keys(&self) -> Vec<SensorKey> {
        KEYS.iter()
            .filter_map(|(feature, key)| {
                self.toggle(*feature).map(|t| SensorKey { key: key.to_string(), value: t.state().value() })
            })
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            platform: self.profile.name(),
            bound: self.ec.is_bound(),
            power: self.power,
            registration: self.registration.phase(),
            aggregator_instance: self.registration.instance(),
            toggles: self
                .toggles
                .iter()
                .map(|t| ToggleSnapshot { feature: t.feature(), state: t.state(), missing: t.is_missing() })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleSnapshot {
    pub feature: Feature,
    pub state: ToggleState,
    pub missing: bool,
}

/// Read-only view of the driver published after every turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub platform: &'static str,
    pub bound: bool,
    pub power: PowerState,
    pub registration: RegistrationPhase,
    pub aggregator_instance: Option<u64>,
    pub toggles: Vec<ToggleSnapshot>,
}

impl Snapshot {
    pub fn toggle(&self, feature: Feature) -> Option<&ToggleSnapshot> {
        self.toggles.iter().find(|t| t.feature == feature)
    }

    pub fn value(&self, feature: Feature) -> Option<u32> {
        self.toggle(feature).and_then(|t| t.state.value())
    }
}

/// Shared read path onto the published snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Snapshot>,
}

impl SnapshotReader {
    pub(crate) fn new(rx: watch::Receiver<Snapshot>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    pub fn value(&self, feature: Feature) -> Option<u32> {
        self.rx.borrow().value(feature)
    }

    /// Key set as of the latest snapshot
    pub fn sensor_keys(&self) -> Vec<SensorKey> {
        let snapshot = self.rx.borrow();
        KEYS.iter()
            .filter_map(|(feature, key)| {
                snapshot
                    .toggle(*feature)
                    .map(|t| SensorKey { key: key.to_string(), value: t.state.value() })
            })
            .collect()
    }

    /// Wait for the next published snapshot. Errors once the driver is gone.
    pub async fn changed(&mut self) -> Result<Snapshot> {
        self.rx
            .changed()
            .await
            .map_err(|_| VpcError::unavailable("driver detached"))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
