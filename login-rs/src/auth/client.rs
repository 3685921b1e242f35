//! Authentication service client
//!
//! Maintains one connection to the authentication service and multiplexes
//! all in-flight requests over it, line-oriented:
//!
//! ```text
//! service: MECH <name> [plaintext] ... READY
//! client:  AUTH <id> <mech> secured=<0|1> lip=<ip> rip=<ip> resp=<b64>
//! client:  CONT <id> <b64>           client:  CANCEL <id>
//! service: CONT <id> <b64> | OK <id> user=<u> token=<b64>
//!          | FAIL <id> [reason] | ERROR <id>
//! ```
//!
//! The connection is re-established with a fixed delay after any failure;
//! connectivity transitions are published through a watch channel so the
//! server can resume connections blocked on an unavailable service.

use crate::auth::{AuthBackend, AuthEvent, AuthRequest, AuthService, AuthSession, Mechanism, SaslReply};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long the service may take to finish one request. Must stay above the
/// front-end's login idle timeout so a stalled exchange is reaped there
/// first.
pub const AUTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

enum Op {
    Begin {
        id: u32,
        request: AuthRequest,
        events: mpsc::UnboundedSender<AuthEvent>,
    },
    Reply {
        id: u32,
        reply: SaslReply,
    },
}

struct Pending {
    events: mpsc::UnboundedSender<AuthEvent>,
    started: Instant,
}

/// Handle to the authentication service connection actor.
pub struct AuthClient {
    ops: mpsc::UnboundedSender<Op>,
    connected: watch::Receiver<bool>,
    mechanisms: Arc<Mutex<Vec<Mechanism>>>,
    next_id: AtomicU32,
}

impl AuthClient {
    /// Connect to the service at `addr`, retrying forever in the background.
    pub fn new(addr: String) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let mechanisms = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(run_actor(addr, ops_rx, connected_tx, mechanisms.clone()));

        Self {
            ops: ops_tx,
            connected: connected_rx,
            mechanisms,
            next_id: AtomicU32::new(1),
        }
    }
}

impl AuthService for AuthClient {
    fn mechanisms(&self) -> Vec<Mechanism> {
        self.mechanisms.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    fn begin(&self, request: AuthRequest) -> AuthSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (session, backend) = AuthSession::channel();
        let AuthBackend {
            events,
            mut replies,
        } = backend;

        if self
            .ops
            .send(Op::Begin {
                id,
                request,
                events: events.clone(),
            })
            .is_err()
        {
            let _ = events.send(AuthEvent::InternalError);
            return session;
        }

        // forward the connection's replies into the shared service socket
        let ops = self.ops.clone();
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                let cancel = reply == SaslReply::Cancel;
                if ops.send(Op::Reply { id, reply }).is_err() || cancel {
                    break;
                }
            }
        });

        session
    }
}

async fn run_actor(
    addr: String,
    mut ops: mpsc::UnboundedReceiver<Op>,
    connected: watch::Sender<bool>,
    mechanisms: Arc<Mutex<Vec<Mechanism>>>,
) {
    let mut pending: HashMap<u32, Pending> = HashMap::new();

    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("Connected to auth service at {}", addr);
                let result =
                    run_connection(stream, &mut ops, &connected, &mechanisms, &mut pending).await;
                let _ = connected.send(false);
                fail_pending(&mut pending);
                match result {
                    // all AuthClient handles are gone
                    Ok(()) => return,
                    Err(e) => warn!("Auth service connection lost: {}", e),
                }
            }
            Err(e) => {
                debug!("Auth service unavailable at {}: {}", addr, e);
            }
        }

        // drain requests arriving while disconnected
        let deadline = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                op = ops.recv() => match op {
                    Some(Op::Begin { events, .. }) => {
                        let _ = events.send(AuthEvent::InternalError);
                    }
                    Some(Op::Reply { .. }) => {}
                    None => return,
                },
            }
        }
    }
}

async fn run_connection(
    stream: TcpStream,
    ops: &mut mpsc::UnboundedReceiver<Op>,
    connected: &watch::Sender<bool>,
    mechanisms: &Mutex<Vec<Mechanism>>,
    pending: &mut HashMap<u32, Pending>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    read_hello(&mut lines, mechanisms).await?;
    let _ = connected.send(true);

    let mut sweep = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
    sweep.reset();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line?.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "auth service closed")
                })?;
                handle_server_line(&line, pending);
            }
            op = ops.recv() => match op {
                Some(op) => handle_op(op, &mut write_half, pending).await?,
                None => return Ok(()),
            },
            _ = sweep.tick() => {
                expire_pending(pending, &mut write_half).await?;
            }
        }
    }
}

async fn read_hello(
    lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    mechanisms: &Mutex<Vec<Mechanism>>,
) -> std::io::Result<()> {
    let mut mechs = Vec::new();
    loop {
        let line = lines.next_line().await?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "auth service closed")
        })?;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MECH") => {
                if let Some(name) = parts.next() {
                    let plaintext = parts.any(|p| p == "plaintext");
                    mechs.push(Mechanism::new(name, plaintext));
                }
            }
            Some("READY") => break,
            _ => debug!("Ignoring auth service hello line: {}", line),
        }
    }
    info!(
        "Auth service offers mechanisms: {}",
        mechs
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    );
    *mechanisms.lock().unwrap() = mechs;
    Ok(())
}

fn handle_server_line(line: &str, pending: &mut HashMap<u32, Pending>) {
    let Some((id, event)) = parse_server_line(line) else {
        debug!("Ignoring auth service line: {}", line);
        return;
    };

    let terminal = !matches!(event, AuthEvent::Continue(_));
    if let Some(entry) = pending.get(&id) {
        let _ = entry.events.send(event);
    }
    if terminal {
        pending.remove(&id);
    }
}

async fn handle_op(
    op: Op,
    write_half: &mut OwnedWriteHalf,
    pending: &mut HashMap<u32, Pending>,
) -> std::io::Result<()> {
    match op {
        Op::Begin { id, request, events } => {
            pending.insert(
                id,
                Pending {
                    events,
                    started: Instant::now(),
                },
            );
            let line = format!(
                "AUTH {} {} secured={} lip={} rip={} resp={}\n",
                id,
                request.mechanism,
                u8::from(request.secured),
                request.local_ip,
                request.remote_ip,
                BASE64.encode(&request.initial_response),
            );
            write_half.write_all(line.as_bytes()).await
        }
        Op::Reply { id, reply } => match reply {
            SaslReply::Response(data) => {
                let line = format!("CONT {} {}\n", id, BASE64.encode(&data));
                write_half.write_all(line.as_bytes()).await
            }
            SaslReply::Cancel => {
                if pending.remove(&id).is_some() {
                    let line = format!("CANCEL {}\n", id);
                    write_half.write_all(line.as_bytes()).await
                } else {
                    Ok(())
                }
            }
        },
    }
}

async fn expire_pending(
    pending: &mut HashMap<u32, Pending>,
    write_half: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    let now = Instant::now();
    let expired: Vec<u32> = pending
        .iter()
        .filter(|(_, p)| now.duration_since(p.started) >= AUTH_REQUEST_TIMEOUT)
        .map(|(id, _)| *id)
        .collect();

    for id in expired {
        warn!("Auth request {} timed out", id);
        if let Some(entry) = pending.remove(&id) {
            let _ = entry.events.send(AuthEvent::InternalError);
        }
        let line = format!("CANCEL {}\n", id);
        write_half.write_all(line.as_bytes()).await?;
    }
    Ok(())
}

fn fail_pending(pending: &mut HashMap<u32, Pending>) {
    for (_, entry) in pending.drain() {
        let _ = entry.events.send(AuthEvent::InternalError);
    }
}

/// Parse one per-request line from the service.
fn parse_server_line(line: &str) -> Option<(u32, AuthEvent)> {
    let mut parts = line.splitn(3, ' ');
    let verb = parts.next()?;
    let id: u32 = parts.next()?.parse().ok()?;
    let rest = parts.next().unwrap_or("");

    match verb {
        "CONT" => {
            let payload = BASE64.decode(rest.trim()).ok()?;
            Some((id, AuthEvent::Continue(payload)))
        }
        "OK" => {
            let mut user = None;
            let mut credentials = Vec::new();
            for field in rest.split_whitespace() {
                if let Some(value) = field.strip_prefix("user=") {
                    user = Some(value.to_string());
                } else if let Some(value) = field.strip_prefix("token=") {
                    credentials = BASE64.decode(value).ok()?;
                }
            }
            Some((
                id,
                AuthEvent::Success {
                    user: user?,
                    credentials,
                },
            ))
        }
        "FAIL" => {
            let reason = if rest.trim().is_empty() {
                "Authentication failed".to_string()
            } else {
                rest.trim().to_string()
            };
            Some((id, AuthEvent::Failed(reason)))
        }
        "ERROR" => Some((id, AuthEvent::InternalError)),
        _ => None,
    }
}
