//! VPC driver facade
//!
//! Owns the serializer worker and the aggregator listener for one bound
//! device. Every request entering here becomes one or more serializer turns.

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vpc_error::{Result, VpcError};
use vpc_protocol::{ConfigEntry, PowerEvent, PropertyValue};

use crate::aggregator::{self, ServiceNotifier};
use crate::ec::DeviceHandle;
use crate::gate::{CommandGate, GateOptions};
use crate::platform::{Feature, PlatformProfile};
use crate::power::{self, ResyncReport};
use crate::property::{self, Command};
use crate::registry::{Registry, Snapshot, SnapshotReader};
use crate::toggle::Applied;

/// Result of a property request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Changed { feature: Feature, value: u32 },
    AlreadySet { feature: Feature, value: u32 },
    /// A read-only toggle or raw EC read
    Value { property: &'static str, value: u32 },
    Config(Vec<ConfigEntry>),
    Resynced(ResyncReport),
    Done { property: &'static str },
}

impl Outcome {
    fn applied(feature: Feature, applied: Applied) -> Self {
        match applied {
            Applied::Changed(value) => Outcome::Changed { feature, value },
            Applied::AlreadySet(value) => Outcome::AlreadySet { feature, value },
        }
    }
}

pub struct VpcDriver {
    gate: CommandGate,
    profile: &'static dyn PlatformProfile,
    worker: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl VpcDriver {
    /// Bind the device, probe it, sync every toggle and arm the aggregator notifier
    pub async fn attach(
        device: DeviceHandle,
        profile: &'static dyn PlatformProfile,
        options: GateOptions,
        notifier: &ServiceNotifier,
    ) -> Result<Self> {
        info!("Attaching {} profile to {}", profile.name(), device.path());
        let (gate, worker) = CommandGate::spawn(Registry::new(device, profile), options);
        let mut driver = Self { gate, profile, worker: Some(worker), listener: None };

        if let Err(e) = driver.probe().await {
            error!("VPC init failed: {}", e);
            let _ = driver.shutdown().await;
            return Err(e);
        }

        let report = power::resync_all(&driver.gate).await?;
        if !report.is_clean() {
            warn!("{} of {} toggles unavailable after attach", report.failures(), report.entries.len());
        }

        driver.listener = Some(aggregator::arm(&driver.gate, notifier).await?);
        Ok(driver)
    }

    async fn probe(&self) -> Result<()> {
        let Some(method) = self.profile.init_probe() else {
            return Ok(());
        };
        let value = self
            .gate
            .submit(move |reg| Box::pin(async move { reg.ec.evaluate(method, &[]).await }))
            .await?;
        info!("{} probe {} -> 0x{:x}", self.profile.name(), method, value);
        Ok(())
    }

    pub fn profile(&self) -> &'static dyn PlatformProfile {
        self.profile
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    pub fn snapshot(&self) -> Snapshot {
        self.gate.snapshot()
    }

    pub fn subscribe(&self) -> SnapshotReader {
        self.gate.reader()
    }

    /// Route a named property through the driver
    pub async fn set_property(&self, name: &str, value: &PropertyValue) -> Result<Outcome> {
        let command = property::parse(name, value, self.profile)?;
        self.execute(command).await
    }

    pub async fn execute(&self, command: Command) -> Result<Outcome> {
        match command {
            Command::Set(feature, requested) => {
                let applied = self
                    .gate
                    .submit_for(Some(feature), move |reg| {
                        Box::pin(async move {
                            reg.ensure_awake()?;
                            let (ec, toggle) = reg.split(feature)?;
                            toggle.set_value(ec, requested).await
                        })
                    })
                    .await?;
                Ok(Outcome::applied(feature, applied))
            }
            Command::Flip(feature) => {
                let applied = self
                    .gate
                    .submit_for(Some(feature), move |reg| {
                        Box::pin(async move {
                            reg.ensure_awake()?;
                            let (ec, toggle) = reg.split(feature)?;
                            toggle.flip(ec).await
                        })
                    })
                    .await?;
                Ok(Outcome::applied(feature, applied))
            }
            Command::Refresh(feature) => {
                let value = self
                    .gate
                    .submit_for(Some(feature), move |reg| {
                        Box::pin(async move {
                            reg.ensure_awake()?;
                            let (ec, toggle) = reg.split(feature)?;
                            toggle.resync(ec).await
                        })
                    })
                    .await?;
                Ok(Outcome::Value { property: feature.property(), value })
            }
            Command::ReadEc(register) => {
                let value = self
                    .gate
                    .submit(move |reg| {
                        Box::pin(async move {
                            reg.ensure_awake()?;
                            reg.ec.read_register(register.offset, register.width).await
                        })
                    })
                    .await?;
                Ok(Outcome::Value { property: "ReadEC", value: u32::from(value) })
            }
            Command::WriteEc(register) => {
                let value = register
                    .value
                    .ok_or_else(|| VpcError::invalid("WriteEC requires a value"))?;
                warn!(
                    "Raw EC write 0x{:02x} <- 0x{:x} ({:?}), cached toggles may be stale",
                    register.offset, value, register.width
                );
                self.gate
                    .submit(move |reg| {
                        Box::pin(async move {
                            reg.ensure_awake()?;
                            reg.ec.write_register(register.offset, register.width, value).await
                        })
                    })
                    .await?;
                Ok(Outcome::Done { property: "WriteEC" })
            }
            Command::DumpConfig => {
                let methods = self.profile.config_methods();
                let entries = self
                    .gate
                    .submit(move |reg| {
                        Box::pin(async move {
                            reg.ensure_awake()?;
                            let mut entries = Vec::with_capacity(methods.len());
                            for method in methods {
                                let entry = match reg.ec.evaluate(method, &[]).await {
                                    Ok(value) => ConfigEntry { method: method.to_string(), value: Some(value), error: None },
                                    Err(e) => ConfigEntry { method: method.to_string(), value: None, error: Some(e.to_string()) },
                                };
                                entries.push(entry);
                            }
                            Ok::<_, VpcError>(entries)
                        })
                    })
                    .await?;
                Ok(Outcome::Config(entries))
            }
            Command::Reset => {
                info!("Resetting VPC state");
                self.ensure_awake().await?;
                self.probe().await?;
                Ok(Outcome::Resynced(power::resync_all(&self.gate).await?))
            }
            Command::Update => {
                self.ensure_awake().await?;
                Ok(Outcome::Resynced(power::resync_all(&self.gate).await?))
            }
        }
    }

    async fn ensure_awake(&self) -> Result<()> {
        self.gate.submit(|reg| Box::pin(async move { reg.ensure_awake() })).await
    }

    /// Deliver a system power event. Resume returns the resync report.
    pub async fn power_event(&self, event: PowerEvent) -> Result<Option<ResyncReport>> {
        match event {
            PowerEvent::Sleep => power::enter_sleep(&self.gate).await.map(|_| None),
            PowerEvent::Resume => power::resume(&self.gate).await,
        }
    }

    /// Withdraw from the aggregator, unbind the device and stop both tasks
    pub async fn detach(mut self) -> Result<()> {
        info!("Detaching {} profile", self.profile.name());
        self.shutdown().await
    }

    /// Withdraw from the aggregator and unbind the device in one turn.
    ///
    /// Works through a shared reference, so callers still holding the driver
    /// only see `DeviceUnavailable` afterwards. Running it twice is harmless.
    pub async fn teardown(&self) -> Result<()> {
        self.gate
            .submit(|reg| {
                Box::pin(async move {
                    aggregator::release(reg).await;
                    if reg.ec.unbind().is_some() {
                        info!("Device unbound");
                    }
                    Ok(())
                })
            })
            .await
    }

    async fn shutdown(&mut self) -> Result<()> {
        let released = self.teardown().await;

        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
        }
        if let Some(worker) = self.worker.take() {
            // Gate clones held by callers keep the channel open
            worker.abort();
            let _ = worker.await;
        }
        released
    }
}

impl Drop for VpcDriver {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
