//! Shared fixtures for driver integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vpc_core::{Aggregator, PluginInfo, SensorKey, Snapshot, SnapshotReader, VpcDriver};
use vpc_error::{Result, VpcError};

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Missing,
    Error,
}

/// Firmware stand-in: a method table plus a call log
#[derive(Default)]
pub struct StubFirmware {
    values: Mutex<HashMap<String, u32>>,
    /// set method -> query method it updates
    links: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<String, Failure>>,
    delays: Mutex<HashMap<String, Duration>>,
    ec: Mutex<Vec<u8>>,
    calls: Mutex<Vec<String>>,
}

impl StubFirmware {
    pub fn new() -> Arc<Self> {
        let stub = Self::default();
        *stub.ec.lock().unwrap() = vec![0u8; 256];
        Arc::new(stub)
    }

    /// Method pairs of the Generic profile
    pub fn generic(clamshell: u32) -> Arc<Self> {
        let stub = Self::new();
        stub.pair("GCSM", "SCSM", clamshell);
        stub
    }

    /// Method pairs of the Ideapad profile
    pub fn ideapad() -> Arc<Self> {
        let stub = Self::new();
        stub.value("_CFG", 0x0004_0000);
        stub.pair("GCSM", "SCSM", 0);
        stub.pair("GBMD", "SBMC", 1);
        stub.pair("GKBL", "SKBL", 0);
        stub.pair("GFAN", "SFAN", 2);
        stub.pair("GFNL", "SFNL", 0);
        stub.value("GBID", 0x55);
        stub
    }

    pub fn value(&self, method: &str, value: u32) {
        self.values.lock().unwrap().insert(method.to_string(), value);
    }

    pub fn pair(&self, query: &str, set: &str, value: u32) {
        self.value(query, value);
        self.value(set, 0);
        self.links.lock().unwrap().insert(set.to_string(), query.to_string());
    }

    pub fn remove(&self, method: &str) {
        self.values.lock().unwrap().remove(method);
    }

    pub fn fail(&self, method: &str, failure: Failure) {
        self.failures.lock().unwrap().insert(method.to_string(), failure);
    }

    pub fn heal(&self, method: &str) {
        self.failures.lock().unwrap().remove(method);
    }

    pub fn delay(&self, method: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(method.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn ec_byte(&self, offset: u8) -> u8 {
        self.ec.lock().unwrap()[usize::from(offset)]
    }

    pub fn set_ec_byte(&self, offset: u8, value: u8) {
        self.ec.lock().unwrap()[usize::from(offset)] = value;
    }
}

impl vpc_core::Firmware for StubFirmware {
    fn evaluate(&self, _device: &str, method: &str, args: &[u32]) -> Result<u32> {
        let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.calls.lock().unwrap().push(format!("{}({})", method, rendered.join(",")));

        let delay = self.delays.lock().unwrap().get(method).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        match self.failures.lock().unwrap().get(method) {
            Some(Failure::Missing) => return Err(VpcError::method_missing(method)),
            Some(Failure::Error) => return Err(VpcError::evaluation(method, "AE_ERROR")),
            None => {}
        }

        match method {
            "RE1B" => {
                let offset = args.first().copied().unwrap_or(0) as usize;
                return Ok(u32::from(self.ec.lock().unwrap()[offset]));
            }
            "WE1B" => {
                let offset = args.first().copied().unwrap_or(0) as usize;
                let value = args.get(1).copied().unwrap_or(0) as u8;
                self.ec.lock().unwrap()[offset] = value;
                return Ok(0);
            }
            _ => {}
        }

        let mut values = self.values.lock().unwrap();
        if !values.contains_key(method) {
            return Err(VpcError::method_missing(method));
        }
        let linked = self.links.lock().unwrap().get(method).cloned();
        match linked {
            Some(query) => {
                values.insert(query, args.first().copied().unwrap_or(0));
                Ok(0)
            }
            None => Ok(values[method]),
        }
    }
}

/// Aggregator stand-in that records handoffs into a shared log
pub struct RecordingAggregator {
    instance: u64,
    log: Arc<Mutex<Vec<String>>>,
    reject: bool,
    delay: Duration,
}

impl RecordingAggregator {
    pub fn new(instance: u64, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { instance, log: Arc::clone(log), reject: false, delay: Duration::ZERO })
    }

    pub fn rejecting(instance: u64, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { instance, log: Arc::clone(log), reject: true, delay: Duration::ZERO })
    }

    /// Accepts the handoff only after blocking for `delay`
    pub fn slow(instance: u64, log: &Arc<Mutex<Vec<String>>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self { instance, log: Arc::clone(log), reject: false, delay })
    }
}

impl Aggregator for RecordingAggregator {
    fn instance(&self) -> u64 {
        self.instance
    }

    fn submit(&self, plugin: &PluginInfo, keys: &[SensorKey], _reader: SnapshotReader) -> Result<()> {
        std::thread::sleep(self.delay);
        if self.reject {
            return Err(VpcError::Ipc("aggregator refused keys".to_string()));
        }
        let keys: Vec<String> = keys.iter().map(|k| k.key.clone()).collect();
        self.log
            .lock()
            .unwrap()
            .push(format!("submit:{}:{}:{}", self.instance, plugin.name, keys.join(",")));
        Ok(())
    }

    fn withdraw(&self, _plugin: &PluginInfo) -> Result<()> {
        self.log.lock().unwrap().push(format!("withdraw:{}", self.instance));
        Ok(())
    }
}

/// Poll the published snapshot until `pred` holds
pub async fn wait_for<P>(driver: &VpcDriver, pred: P) -> Snapshot
where
    P: Fn(&Snapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = driver.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot condition not reached")
}
