//! Feature toggle state machine
//!
//! Each toggle caches the last value the hardware confirmed. The cache is
//! only ever `Valid` for a value that was successfully queried or set; any
//! failure drops it to `Invalid` so a stale value is never reported.

use tracing::{debug, info, warn};
use vpc_error::{ErrorKind, Result, VpcError};

use crate::ec::EcAccess;
use crate::platform::{Feature, ToggleKind, ToggleSpec};

/// Cached hardware state of a toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    Unknown,
    Valid(u32),
    Invalid,
}

impl ToggleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToggleState::Unknown => "unknown",
            ToggleState::Valid(_) => "valid",
            ToggleState::Invalid => "invalid",
        }
    }

    pub fn value(&self) -> Option<u32> {
        match self {
            ToggleState::Valid(v) => Some(*v),
            _ => None,
        }
    }
}

/// Result of a successful set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The set method ran
    Changed(u32),
    /// Hardware already held the value; no set call was made
    AlreadySet(u32),
}

impl Applied {
    pub fn value(&self) -> u32 {
        match self {
            Applied::Changed(v) | Applied::AlreadySet(v) => *v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Toggle {
    spec: ToggleSpec,
    state: ToggleState,
    /// The query method is absent on this machine. Permanent.
    missing: bool,
}

impl Toggle {
    pub fn new(spec: ToggleSpec) -> Self {
        Self { spec, state: ToggleState::Unknown, missing: false }
    }

    pub fn feature(&self) -> Feature {
        self.spec.feature
    }

    pub fn spec(&self) -> &ToggleSpec {
        &self.spec
    }

    pub fn state(&self) -> ToggleState {
        self.state
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    pub fn is_read_only(&self) -> bool {
        self.spec.set.is_none()
    }

    fn name(&self) -> &'static str {
        self.spec.feature.property()
    }

    fn decode(&self, raw: u32) -> u32 {
        match self.spec.kind {
            ToggleKind::Boolean => raw & 1,
            ToggleKind::Numeric { .. } => raw,
        }
    }

    /// Check a requested value against the toggle's kind
    pub fn validate(&self, requested: u32) -> Result<()> {
        let max = match self.spec.kind {
            ToggleKind::Boolean => 1,
            ToggleKind::Numeric { max } => max,
        };
        if requested > max {
            return Err(VpcError::invalid(format!(
                "{} accepts values up to {}, got {}",
                self.name(),
                max,
                requested
            )));
        }
        Ok(())
    }

    /// Read the hardware value and refresh the cache
    pub async fn query(&mut self, ec: &EcAccess) -> Result<u32> {
        if self.missing {
            return Err(VpcError::method_missing(self.spec.query));
        }
        match ec.evaluate(self.spec.query, &[]).await {
            Ok(raw) => {
                let value = self.decode(raw);
                if self.state != ToggleState::Valid(value) {
                    info!("{} is 0x{:x}", self.name(), value);
                }
                self.state = ToggleState::Valid(value);
                Ok(value)
            }
            Err(e) => {
                if e.kind() == ErrorKind::MethodMissing {
                    warn!("{} not supported: {} is absent", self.name(), self.spec.query);
                    self.missing = true;
                } else {
                    warn!("{} query failed: {}", self.name(), e);
                }
                self.state = ToggleState::Invalid;
                Err(e)
            }
        }
    }

    /// Drive hardware to `requested`, skipping the set call if it already holds it
    pub async fn set_value(&mut self, ec: &EcAccess, requested: u32) -> Result<Applied> {
        if self.missing {
            return Err(VpcError::method_missing(self.spec.query));
        }
        let Some(set_method) = self.spec.set else {
            return Err(VpcError::invalid(format!("{} is read-only", self.name())));
        };
        self.validate(requested)?;

        let current = match self.state {
            ToggleState::Valid(v) => v,
            _ => self.query(ec).await?,
        };
        if current == requested {
            debug!("{} already 0x{:x}", self.name(), requested);
            return Ok(Applied::AlreadySet(requested));
        }

        match ec.evaluate(set_method, &[requested]).await {
            Ok(_) => {
                info!("{} set to 0x{:x}", self.name(), requested);
                self.state = ToggleState::Valid(requested);
                Ok(Applied::Changed(requested))
            }
            Err(e) => {
                warn!("{} set to 0x{:x} failed: {}", self.name(), requested, e);
                self.state = ToggleState::Invalid;
                Err(VpcError::toggle(self.name(), requested, e))
            }
        }
    }

    /// Forced re-query. Missing toggles are not touched.
    pub async fn resync(&mut self, ec: &EcAccess) -> Result<u32> {
        if self.missing {
            return Err(VpcError::method_missing(self.spec.query));
        }
        self.query(ec).await
    }

    /// Invert a boolean toggle
    pub async fn flip(&mut self, ec: &EcAccess) -> Result<Applied> {
        if !ec.is_bound() {
            return Err(VpcError::unavailable("device handle is not bound"));
        }
        if self.spec.kind != ToggleKind::Boolean {
            return Err(VpcError::invalid(format!("{} is not a boolean toggle", self.name())));
        }
        let current = match self.state {
            ToggleState::Valid(v) => v,
            _ => self.query(ec).await?,
        };
        self.set_value(ec, current ^ 1).await
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = ToggleState::Invalid;
    }

    /// Drop a cached value that may no longer match hardware
    pub(crate) fn mark_stale(&mut self) {
        if !self.missing {
            self.state = ToggleState::Unknown;
        }
    }
}
