//! Command serializer
//!
//! All EC traffic goes through one worker task fed by a bounded channel.
//! Turns run one at a time in admission order; each caller awaits its own
//! result over a oneshot. A turn that overruns the timeout is dropped, and
//! the toggle it was working on (if any) is marked invalid.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use vpc_error::{Result, VpcError};

use crate::constants::gate::{DEFAULT_QUEUE_DEPTH, DEFAULT_TURN_TIMEOUT};
use crate::platform::Feature;
use crate::registry::{Registry, Snapshot, SnapshotReader};

type Job = Box<dyn for<'a> FnOnce(&'a mut Registry) -> BoxFuture<'a, ()> + Send>;

struct Turn {
    /// Toggle the turn works on; invalidated if the turn times out
    feature: Option<Feature>,
    job: Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOptions {
    pub turn_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self { turn_timeout: DEFAULT_TURN_TIMEOUT, queue_depth: DEFAULT_QUEUE_DEPTH }
    }
}

/// Submission side of the serializer. Cheap to clone.
#[derive(Clone)]
pub struct CommandGate {
    tx: mpsc::Sender<Turn>,
    snapshot: watch::Receiver<Snapshot>,
}

impl CommandGate {
    /// Move `registry` into a new worker task
    pub fn spawn(registry: Registry, options: GateOptions) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(registry.snapshot());
        let worker = tokio::spawn(run_worker(registry, rx, snapshot_tx, options.turn_timeout));
        (Self { tx, snapshot: snapshot_rx }, worker)
    }

    /// Run `op` exclusively against the registry and return its result
    pub async fn submit<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut Registry) -> BoxFuture<'a, Result<R>> + Send + 'static,
    {
        self.submit_for(None, op).await
    }

    /// Like [`submit`](Self::submit), on behalf of one toggle
    pub async fn submit_for<R, F>(&self, feature: Option<Feature>, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut Registry) -> BoxFuture<'a, Result<R>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(job(move |registry| {
            Box::pin(async move {
                let result = op(registry).await;
                let _ = reply_tx.send(result);
            })
        }));

        self.tx
            .send(Turn { feature, job })
            .await
            .map_err(|_| VpcError::unavailable("command gate is closed"))?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) if self.tx.is_closed() => Err(VpcError::unavailable("command gate is closed")),
            Err(_) => Err(VpcError::Timeout(match feature {
                Some(f) => format!("{} turn", f.property()),
                None => "command turn".to_string(),
            })),
        }
    }

    /// Turns admitted but not yet picked up by the worker
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Last published snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(self.snapshot.clone())
    }
}

/// Pins the closure to the higher-ranked signature `Job` needs
fn job<F>(f: F) -> F
where
    F: for<'a> FnOnce(&'a mut Registry) -> BoxFuture<'a, ()> + Send + 'static,
{
    f
}

async fn run_worker(
    mut registry: Registry,
    mut rx: mpsc::Receiver<Turn>,
    snapshot_tx: watch::Sender<Snapshot>,
    turn_timeout: Duration,
) {
    debug!("Command gate started (turn timeout {:?})", turn_timeout);

    while let Some(Turn { feature, job }) = rx.recv().await {
        if timeout(turn_timeout, job(&mut registry)).await.is_err() {
            match feature {
                Some(f) => {
                    warn!("{} turn timed out after {:?}, marking invalid", f.property(), turn_timeout);
                    registry.invalidate(f);
                }
                None => warn!("Command turn timed out after {:?}", turn_timeout),
            }
        }
        snapshot_tx.send_replace(registry.snapshot());
    }

    debug!("Command gate stopped");
}
