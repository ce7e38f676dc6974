//! Power transitions
//!
//! Sleep only records the new state. Wake demotes every cached value to
//! unknown in one turn, then re-queries each toggle in its own turn so
//! other requests can interleave and one failure does not stop the rest.

use serde::Serialize;
use tracing::{info, warn};
use vpc_error::Result;
use vpc_protocol::ResyncEntry;

use crate::gate::CommandGate;
use crate::platform::Feature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Active,
    Sleeping,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Active => "active",
            PowerState::Sleeping => "sleeping",
        }
    }
}

/// Per-toggle outcome of a resynchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub entries: Vec<ResyncEntry>,
}

impl ResyncReport {
    pub fn failures(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }

    pub fn is_clean(&self) -> bool {
        self.failures() == 0
    }

    pub fn entry(&self, feature: Feature) -> Option<&ResyncEntry> {
        self.entries.iter().find(|e| e.property == feature.property())
    }
}

/// Active -> Sleeping. Returns false if already sleeping.
pub async fn enter_sleep(gate: &CommandGate) -> Result<bool> {
    let changed = gate
        .submit(|reg| {
            Box::pin(async move {
                if reg.power == PowerState::Sleeping {
                    return Ok(false);
                }
                reg.power = PowerState::Sleeping;
                Ok(true)
            })
        })
        .await?;

    if changed {
        info!("Entering sleep, EC access suspended");
    }
    Ok(changed)
}

/// Sleeping -> Active followed by a full resync. None if already active.
pub async fn resume(gate: &CommandGate) -> Result<Option<ResyncReport>> {
    let woke = gate
        .submit(|reg| {
            Box::pin(async move {
                if reg.power == PowerState::Active {
                    return Ok(false);
                }
                reg.power = PowerState::Active;
                reg.mark_all_stale();
                Ok(true)
            })
        })
        .await?;

    if !woke {
        return Ok(None);
    }

    info!("Resumed, resynchronizing toggles");
    resync_all(gate).await.map(Some)
}

/// Re-query every toggle in declaration order, one turn each
pub async fn resync_all(gate: &CommandGate) -> Result<ResyncReport> {
    let features = gate
        .submit(|reg| Box::pin(async move { Ok(reg.features()) }))
        .await?;

    let mut report = ResyncReport::default();
    for feature in features {
        let result = gate
            .submit_for(Some(feature), move |reg| {
                Box::pin(async move {
                    reg.ensure_awake()?;
                    let (ec, toggle) = reg.split(feature)?;
                    toggle.resync(ec).await
                })
            })
            .await;

        let entry = match result {
            Ok(value) => ResyncEntry { property: feature.property().to_string(), value: Some(value), error: None },
            Err(e) => {
                warn!("Resync of {} failed: {}", feature.property(), e);
                ResyncEntry { property: feature.property().to_string(), value: None, error: Some(e.to_string()) }
            }
        };
        report.entries.push(entry);
    }

    if report.is_clean() {
        info!("Resynchronized {} toggles", report.entries.len());
    } else {
        warn!("Resynchronized {} toggles, {} failed", report.entries.len(), report.failures());
    }
    Ok(report)
}
