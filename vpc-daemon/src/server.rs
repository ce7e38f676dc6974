//! Unix Socket Server
//!
//! Newline-delimited JSON requests from the `yogavpc` client and from
//! system-sleep hooks. Every request that can reach the EC is audit-logged
//! with the peer's credentials.
//!
//! # Limits
//! - **Connection limit**: at most `MAX_CONNECTIONS` concurrent clients
//! - **Message limit**: lines over `MAX_MESSAGE_SIZE` are rejected before buffering
//! - **Timeouts**: idle reads and stalled writes close the connection
//! - **Authorization**: read-only requests are open, anything that drives hardware needs root

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use vpc_core::constants::ipc::{MAX_CONNECTIONS, READ_TIMEOUT, WRITE_TIMEOUT};
use vpc_core::{Outcome, ResyncReport, Snapshot, VpcDriver};
use vpc_protocol::{
    DriverStatus, ErrorKind, OutcomeKind, Request, RequestEnvelope, Response, ResponseData,
    ResponseEnvelope, SetOutcome, ToggleInfo, MAX_MESSAGE_SIZE,
};

/// Socket permissions: anyone may ask, only root may change hardware
const SOCKET_MODE: u32 = 0o666;

/// Global connection counter
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Client credentials from Unix socket peer
#[derive(Debug, Clone, Copy)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

pub async fn run_server<S>(socket_path: &str, driver: Arc<VpcDriver>, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let path = Path::new(socket_path);

    // Remove a stale socket, never a symlink
    if path.exists() {
        let metadata = path.symlink_metadata()?;
        if metadata.file_type().is_symlink() {
            anyhow::bail!("Socket path is a symlink - refusing for security");
        }
        std::fs::remove_file(path)?;
        debug!("Removed existing socket file");
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    info!("Listening on {} (mode {:o})", socket_path, SOCKET_MODE);
    info!("Limits: max_conn={}, max_msg={}", MAX_CONNECTIONS, MAX_MESSAGE_SIZE);

    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let Some(slot) = ConnectionSlot::acquire() else {
                            warn!("Connection limit reached ({}), rejecting new connection", MAX_CONNECTIONS);
                            drop(stream);
                            continue;
                        };

                        let driver = Arc::clone(&driver);
                        connections.spawn(async move {
                            let _slot = slot;
                            handle_client(stream, driver).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Connection tasks hold the driver; stop them so teardown sees no in-flight callers
    let open = connections.len();
    connections.abort_all();
    while connections.join_next().await.is_some() {}

    let _ = std::fs::remove_file(socket_path);
    info!("Server stopped ({} connections aborted)", open);
    Ok(())
}

/// One unit of the connection budget, returned on drop
struct ConnectionSlot;

impl ConnectionSlot {
    fn acquire() -> Option<Self> {
        ACTIVE_CONNECTIONS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < MAX_CONNECTIONS).then_some(n + 1))
            .ok()
            .map(|_| ConnectionSlot)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "Message too large"));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

async fn handle_client(stream: UnixStream, driver: Arc<VpcDriver>) {
    let Some(cred) = get_peer_credentials(&stream) else {
        error!("Failed to get peer credentials, rejecting connection");
        return;
    };
    debug!("Connection from uid={}, gid={}, pid={}", cred.uid, cred.gid, cred.pid);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        let read_result = timeout(READ_TIMEOUT, read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE)).await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(
                    "Client disconnected: uid={}, pid={}, requests={}, duration={:?}",
                    cred.uid, cred.pid, request_count, connection_start.elapsed()
                );
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!("Request #{} from uid={}: {} bytes", request_count, cred.uid, n);

                let Ok(line_str) = std::str::from_utf8(&line) else {
                    let envelope = ResponseEnvelope::new(0, Response::error(ErrorKind::ValueInvalid, "Invalid request encoding"));
                    let _ = send_response(&mut writer, &envelope).await;
                    break;
                };

                let envelope = process_request(line_str, &cred, &driver).await;
                if send_response(&mut writer, &envelope).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!("Message too large (>{} bytes) from uid={}, pid={}", MAX_MESSAGE_SIZE, cred.uid, cred.pid);
                    let envelope = ResponseEnvelope::new(0, Response::error(ErrorKind::ValueInvalid, "Message too large"));
                    let _ = send_response(&mut writer, &envelope).await;
                } else {
                    error!("Read error from uid={}, pid={}: {}", cred.uid, cred.pid, e);
                }
                break;
            }
            Err(_) => {
                debug!("Read timeout for uid={}, pid={}", cred.uid, cred.pid);
                break;
            }
        }
    }
}

/// Send response with timeout
async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    envelope: &ResponseEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(envelope).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","kind":"Internal","message":"Serialization error"}"#.to_string()
    });

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

/// Get peer credentials (uid, gid, pid) from Unix socket
fn get_peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    // SAFETY: ucred is a plain C struct with no pointers; all-zero is a valid value.
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: fd is a live socket owned by `stream`, and cred/len describe a correctly sized buffer.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result == 0 {
        Some(PeerCredentials { uid: cred.uid, gid: cred.gid, pid: cred.pid })
    } else {
        None
    }
}

/// Requests that can reach the EC
fn is_privileged(request: &Request) -> bool {
    matches!(request, Request::SetProperty { .. } | Request::Power { .. })
}

/// Process a single request and return response with audit logging
pub async fn process_request(line: &str, cred: &PeerCredentials, driver: &VpcDriver) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!("Invalid JSON from uid={}: {}", cred.uid, e);
            return ResponseEnvelope::new(0, Response::error(ErrorKind::ValueInvalid, "Invalid request format"));
        }
    };

    let request_id = envelope.id;
    let request = envelope.request;

    if let Err(e) = request.validate() {
        warn!("Request validation failed from uid={}: {}", cred.uid, e);
        return ResponseEnvelope::new(request_id, Response::error(ErrorKind::ValueInvalid, e));
    }

    if is_privileged(&request) && cred.uid != 0 {
        warn!(
            "AUDIT: Rejected {} from unprivileged uid={}, pid={}",
            request.type_name(),
            cred.uid,
            cred.pid
        );
        return ResponseEnvelope::new(
            request_id,
            Response::error(ErrorKind::PermissionDenied, "Permission denied: root required"),
        );
    }

    debug!(
        "Processing {} (id={}) from uid={}, pid={}, {} turns queued",
        request.type_name(),
        request_id,
        cred.uid,
        cred.pid,
        driver.gate().queued()
    );

    let response = match request {
        Request::Ping => Response::ok_string("pong"),

        Request::Version => Response::ok_string(env!("CARGO_PKG_VERSION")),

        Request::Status => Response::Ok(ResponseData::status(status_from(&driver.snapshot()))),

        Request::SetProperty { name, value } => {
            if name == "WriteEC" {
                warn!("DANGER AUDIT: WriteEC {:?} by uid={}, pid={}", value, cred.uid, cred.pid);
            } else {
                info!("AUDIT: SetProperty {}={:?} by uid={}, pid={}", name, value, cred.uid, cred.pid);
            }
            match driver.set_property(&name, &value).await {
                Ok(outcome) => outcome_response(outcome, driver),
                Err(e) => {
                    warn!("SetProperty {} failed: {}", name, e);
                    Response::from(&e)
                }
            }
        }

        Request::Power { event } => {
            info!("AUDIT: Power {:?} by uid={}, pid={}", event, cred.uid, cred.pid);
            match driver.power_event(event).await {
                Ok(Some(report)) => resync_response(report),
                Ok(None) => Response::ok(),
                Err(e) => Response::from(&e),
            }
        }
    };

    ResponseEnvelope::new(request_id, response)
}

// ============================================================================
// Core -> protocol conversion
// ============================================================================

pub fn status_from(snapshot: &Snapshot) -> DriverStatus {
    DriverStatus {
        platform: snapshot.platform.to_string(),
        power: snapshot.power.as_str().to_string(),
        registration: snapshot.registration.as_str().to_string(),
        aggregator_instance: snapshot.aggregator_instance,
        toggles: snapshot
            .toggles
            .iter()
            .map(|t| ToggleInfo {
                property: t.feature.property().to_string(),
                state: t.state.as_str().to_string(),
                value: t.state.value(),
                missing: t.missing,
            })
            .collect(),
    }
}

fn resync_response(report: ResyncReport) -> Response {
    Response::Ok(ResponseData::resync(report.entries))
}

fn set_outcome(result: OutcomeKind, property: &str, value: Option<u32>) -> Response {
    Response::Ok(ResponseData::outcome(SetOutcome { result, property: property.to_string(), value }))
}

pub fn outcome_response(outcome: Outcome, driver: &VpcDriver) -> Response {
    match outcome {
        Outcome::Changed { feature, value } => set_outcome(OutcomeKind::Changed, feature.property(), Some(value)),
        Outcome::AlreadySet { feature, value } => {
            set_outcome(OutcomeKind::AlreadySet, feature.property(), Some(value))
        }
        Outcome::Value { property, value } => set_outcome(OutcomeKind::Value, property, Some(value)),
        Outcome::Done { property } => set_outcome(OutcomeKind::Done, property, None),
        Outcome::Config(entries) => {
            Response::Ok(ResponseData::config(entries, status_from(&driver.snapshot())))
        }
        Outcome::Resynced(report) => resync_response(report),
    }
}
