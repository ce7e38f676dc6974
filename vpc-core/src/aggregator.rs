//! Sensor aggregator registration
//!
//! The aggregator is an independent service that may appear, disappear and
//! be republished at any time. The driver subscribes to a [`ServiceNotifier`]
//! at attach; every publish event becomes a handoff turn on the serializer
//! that withdraws the previous registration and pushes the key set to the
//! new instance.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vpc_error::{Result, VpcError};

use crate::constants::aggregator::{NOTIFIER_CAPACITY, PLUGIN_NAME};
use crate::gate::CommandGate;
use crate::registry::{Registry, SnapshotReader};

/// Identity announced with every handoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

impl PluginInfo {
    pub fn current() -> Self {
        Self { name: PLUGIN_NAME.to_string(), version: env!("CARGO_PKG_VERSION").to_string() }
    }
}

/// One aggregated value, keyed by a 4-character identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorKey {
    pub key: String,
    pub value: Option<u32>,
}

/// A published aggregator instance. Calls may block; they run off the worker.
pub trait Aggregator: Send + Sync {
    /// Distinguishes successive publications
    fn instance(&self) -> u64;

    fn submit(&self, plugin: &PluginInfo, keys: &[SensorKey], reader: SnapshotReader) -> Result<()>;

    fn withdraw(&self, plugin: &PluginInfo) -> Result<()>;
}

pub type Published = Arc<dyn Aggregator>;

/// Broadcasts "aggregator published" events
#[derive(Clone)]
pub struct ServiceNotifier {
    tx: broadcast::Sender<Published>,
}

impl ServiceNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFIER_CAPACITY);
        Self { tx }
    }

    /// Announce an aggregator; returns how many listeners saw it
    pub fn publish(&self, aggregator: Published) -> usize {
        self.tx.send(aggregator).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ServiceNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration state. Moves forward only until teardown resets it.
#[derive(Clone, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    NotifierArmed,
    Registered(Published),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPhase {
    Unregistered,
    NotifierArmed,
    Registered,
}

impl RegistrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationPhase::Unregistered => "unregistered",
            RegistrationPhase::NotifierArmed => "notifier_armed",
            RegistrationPhase::Registered => "registered",
        }
    }
}

impl RegistrationState {
    pub fn phase(&self) -> RegistrationPhase {
        match self {
            RegistrationState::Unregistered => RegistrationPhase::Unregistered,
            RegistrationState::NotifierArmed => RegistrationPhase::NotifierArmed,
            RegistrationState::Registered(_) => RegistrationPhase::Registered,
        }
    }

    pub fn instance(&self) -> Option<u64> {
        match self {
            RegistrationState::Registered(agg) => Some(agg.instance()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instance() {
            Some(instance) => write!(f, "Registered({})", instance),
            None => write!(f, "{:?}", self.phase()),
        }
    }
}

async fn blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| VpcError::Ipc(format!("aggregator call aborted: {}", e)))?
}

/// Subscribe, mark the notifier armed and start listening for publish events
pub(crate) async fn arm(gate: &CommandGate, notifier: &ServiceNotifier) -> Result<JoinHandle<()>> {
    let rx = notifier.subscribe();
    gate.submit(|reg| {
        Box::pin(async move {
            reg.registration = RegistrationState::NotifierArmed;
            Ok(())
        })
    })
    .await?;
    debug!("Aggregator notifier armed");
    Ok(tokio::spawn(listen(gate.clone(), rx)))
}

async fn listen(gate: CommandGate, mut rx: broadcast::Receiver<Published>) {
    loop {
        match rx.recv().await {
            Ok(aggregator) => {
                let instance = aggregator.instance();
                match handoff(&gate, aggregator).await {
                    Ok(true) => info!("Registered with aggregator instance {}", instance),
                    Ok(false) => debug!("Ignoring aggregator instance {} during teardown", instance),
                    Err(e) => warn!("Handoff to aggregator instance {} failed: {}", instance, e),
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} aggregator publish events", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Aggregator listener stopped");
}

/// Handoff turn. Returns false when teardown has already started.
pub async fn handoff(gate: &CommandGate, aggregator: Published) -> Result<bool> {
    let reader = gate.reader();
    gate.submit(move |reg| Box::pin(register(reg, aggregator, reader))).await
}

async fn register(reg: &mut Registry, aggregator: Published, reader: SnapshotReader) -> Result<bool> {
    let plugin = PluginInfo::current();

    match std::mem::replace(&mut reg.registration, RegistrationState::NotifierArmed) {
        RegistrationState::Unregistered => {
            reg.registration = RegistrationState::Unregistered;
            return Ok(false);
        }
        RegistrationState::NotifierArmed => {}
        RegistrationState::Registered(previous) => {
            info!("Withdrawing registration with aggregator instance {}", previous.instance());
            let plugin = plugin.clone();
            if let Err(e) = blocking(move || previous.withdraw(&plugin)).await {
                debug!("Previous aggregator did not accept withdraw: {}", e);
            }
        }
    }

    let keys = reg.sensor_keys();
    let target = Arc::clone(&aggregator);
    let mut pending = PendingSubmit::new(Arc::clone(&aggregator));
    let delivery = Arc::clone(&pending.delivery);
    let result = blocking(move || {
        target.submit(&plugin, &keys, reader)?;
        let mut state = lock(&delivery);
        if state.abandoned {
            drop(state);
            withdraw_late(&target);
        } else {
            state.submitted = true;
        }
        Ok(())
    })
    .await;
    pending.claimed = true;
    result?;
    reg.registration = RegistrationState::Registered(aggregator);
    Ok(true)
}

#[derive(Default)]
struct Delivery {
    submitted: bool,
    abandoned: bool,
}

fn lock(delivery: &Mutex<Delivery>) -> MutexGuard<'_, Delivery> {
    delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A submit running on the blocking pool. If the turn is dropped before it
/// claims the result, whichever side sees the other finish withdraws.
struct PendingSubmit {
    aggregator: Published,
    delivery: Arc<Mutex<Delivery>>,
    claimed: bool,
}

impl PendingSubmit {
    fn new(aggregator: Published) -> Self {
        Self { aggregator, delivery: Arc::new(Mutex::new(Delivery::default())), claimed: false }
    }
}

impl Drop for PendingSubmit {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let submitted = {
            let mut state = lock(&self.delivery);
            state.abandoned = true;
            state.submitted
        };
        if submitted {
            let aggregator = Arc::clone(&self.aggregator);
            tokio::task::spawn_blocking(move || withdraw_late(&aggregator));
        }
    }
}

fn withdraw_late(aggregator: &Published) {
    let instance = aggregator.instance();
    match aggregator.withdraw(&PluginInfo::current()) {
        Ok(()) => warn!("Handoff to aggregator instance {} finished after its turn, withdrew it", instance),
        Err(e) => debug!("Late withdraw from aggregator instance {} failed: {}", instance, e),
    }
}

/// Teardown step run in the detach turn
pub(crate) async fn release(reg: &mut Registry) {
    if let RegistrationState::Registered(current) =
        std::mem::replace(&mut reg.registration, RegistrationState::Unregistered)
    {
        let plugin = PluginInfo::current();
        let instance = current.instance();
        match blocking(move || current.withdraw(&plugin)).await {
            Ok(()) => info!("Withdrew from aggregator instance {}", instance),
            Err(e) => debug!("Aggregator instance {} gone before withdraw: {}", instance, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::{DeviceHandle, MockFirmware};
    use crate::gate::GateOptions;
    use crate::platform::Generic;
    use std::sync::Mutex;

    struct Counting {
        instance: u64,
        submits: Mutex<u32>,
    }

    impl Aggregator for Counting {
        fn instance(&self) -> u64 {
            self.instance
        }

        fn submit(&self, _plugin: &PluginInfo, keys: &[SensorKey], _reader: SnapshotReader) -> Result<()> {
            assert_eq!(keys.len(), 1);
            *self.submits.lock().unwrap() += 1;
            Ok(())
        }

        fn withdraw(&self, _plugin: &PluginInfo) -> Result<()> {
            Err(VpcError::Ipc("gone".to_string()))
        }
    }

    fn gate() -> CommandGate {
        let mut mock = MockFirmware::new();
        mock.expect_evaluate().returning(|_, _, _| Ok(0));
        let registry = Registry::new(DeviceHandle::new("\\_SB.VPC0", Arc::new(mock)), &Generic);
        CommandGate::spawn(registry, GateOptions::default()).0
    }

    #[tokio::test]
    async fn test_handoff_before_arming_is_ignored() {
        let gate = gate();
        let agg = Arc::new(Counting { instance: 3, submits: Mutex::new(0) });
        assert!(!handoff(&gate, agg.clone()).await.unwrap());
        assert_eq!(*agg.submits.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_previous_aggregator_is_tolerated() {
        let gate = gate();
        let notifier = ServiceNotifier::new();
        let listener = arm(&gate, &notifier).await.unwrap();
        listener.abort();

        let first = Arc::new(Counting { instance: 1, submits: Mutex::new(0) });
        let second = Arc::new(Counting { instance: 2, submits: Mutex::new(0) });
        assert!(handoff(&gate, first).await.unwrap());
        assert!(handoff(&gate, second.clone()).await.unwrap());
        assert_eq!(gate.snapshot().aggregator_instance, Some(2));

        gate.submit(|reg| Box::pin(async move {
            release(reg).await;
            Ok(())
        }))
        .await
        .unwrap();
        assert_eq!(gate.snapshot().registration, RegistrationPhase::Unregistered);
        assert!(!handoff(&gate, second).await.unwrap());
    }
}
