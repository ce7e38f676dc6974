//! Sensor aggregator socket
//!
//! The aggregator publishes itself by creating a Unix socket. We poll the
//! path and treat every new socket inode as a fresh publication, which the
//! driver then hands off to. Each handoff is one JSON line on its own
//! connection; live values are read back through the daemon's `Status`
//! request.

use std::io::Write;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use vpc_core::{Aggregator, PluginInfo, SensorKey, ServiceNotifier, SnapshotReader};
use vpc_error::{Result, VpcError};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct Handoff<'a> {
    plugin: &'a str,
    version: &'a str,
    keys: &'a [SensorKey],
}

#[derive(Serialize)]
struct Withdraw<'a> {
    plugin: &'a str,
    withdraw: bool,
}

/// One publication of the aggregator socket
pub struct SocketAggregator {
    path: PathBuf,
    instance: u64,
}

impl SocketAggregator {
    pub fn new(path: impl Into<PathBuf>, instance: u64) -> Self {
        Self { path: path.into(), instance }
    }

    /// Write one line and close the connection
    fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut stream = UnixStream::connect(&self.path)
            .map_err(|e| VpcError::Ipc(format!("aggregator {}: {}", self.path.display(), e)))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        stream.write_all(&line)?;
        Ok(())
    }
}

impl Aggregator for SocketAggregator {
    fn instance(&self) -> u64 {
        self.instance
    }

    fn submit(&self, plugin: &PluginInfo, keys: &[SensorKey], _reader: SnapshotReader) -> Result<()> {
        self.send(&Handoff { plugin: &plugin.name, version: &plugin.version, keys })?;
        debug!("Sent {} keys to aggregator instance {}", keys.len(), self.instance);
        Ok(())
    }

    fn withdraw(&self, plugin: &PluginInfo) -> Result<()> {
        self.send(&Withdraw { plugin: &plugin.name, withdraw: true })
    }
}

/// Identity of the socket file currently at `path`
fn socket_identity(path: &Path) -> Option<(u64, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    metadata.file_type().is_socket().then(|| (metadata.dev(), metadata.ino()))
}

/// Publish every new aggregator socket that appears at `path`
pub async fn watch(path: PathBuf, poll: Duration, notifier: ServiceNotifier) {
    info!("Watching for sensor aggregator at {}", path.display());
    let mut ticker = tokio::time::interval(poll);
    let mut current: Option<(u64, u64)> = None;
    let mut instance: u64 = 0;

    loop {
        ticker.tick().await;
        let seen = socket_identity(&path);
        if seen == current {
            continue;
        }
        current = seen;

        if seen.is_none() {
            debug!("Aggregator socket {} went away", path.display());
            continue;
        }

        instance += 1;
        let listeners = notifier.publish(Arc::new(SocketAggregator::new(&path, instance)));
        info!("Aggregator published (instance {}, {} listeners)", instance, listeners);
    }
}
