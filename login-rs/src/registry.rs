//! Process-wide registry of pre-login connections
//!
//! Tracks every live connection, enforces the global connection cap by
//! evicting the oldest sessions, sweeps out idle clients once per second
//! and wakes connections that were parked while the authentication
//! service was down.

use crate::auth::client::AUTH_REQUEST_TIMEOUT;
use crate::imap::connection::{ClientHandle, DisconnectReason};
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Disconnect a client after this much time without input.
pub const CLIENT_LOGIN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How many of the oldest connections to drop when the registry is full.
/// Dropping a batch amortizes the full scan.
pub const CLIENT_DESTROY_OLDEST_COUNT: usize = 16;

// A stalled SASL exchange must be reaped here before the auth service
// gives up on the request.
const _: () = assert!(CLIENT_LOGIN_IDLE_TIMEOUT.as_secs() < AUTH_REQUEST_TIMEOUT.as_secs());

pub(crate) struct RegistryShared {
    clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    next_id: AtomicU64,
    max_logging_users: usize,
}

impl RegistryShared {
    /// Called from `ClientHandle::destroy`; membership ends immediately even
    /// though the handle may live on in callbacks.
    pub(crate) fn remove(&self, id: u64) {
        self.clients.lock().unwrap().remove(&id);
    }
}

/// Cloneable handle to the connection set.
#[derive(Clone)]
pub struct ClientRegistry {
    shared: Arc<RegistryShared>,
}

impl ClientRegistry {
    pub fn new(max_logging_users: usize) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_logging_users,
            }),
        }
    }

    /// Admit a new connection, evicting the oldest batch if the cap is hit.
    pub fn register(&self, peer: SocketAddr, local: SocketAddr) -> Arc<ClientHandle> {
        if self.shared.max_logging_users > CLIENT_DESTROY_OLDEST_COUNT
            && self.count() >= self.shared.max_logging_users
        {
            info!(
                "Connection queue full ({} clients), evicting the oldest",
                self.count()
            );
            self.destroy_oldest();
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ClientHandle::new(
            id,
            peer,
            local,
            Arc::downgrade(&self.shared),
        ));
        self.shared
            .clients
            .lock()
            .unwrap()
            .insert(id, handle.clone());
        handle
    }

    pub fn count(&self) -> usize {
        self.shared.clients.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.shared
            .clients
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Quiet teardown of every connection (process shutdown).
    pub fn destroy_all(&self) {
        for handle in self.snapshot() {
            handle.destroy(DisconnectReason::Shutdown);
        }
    }

    /// The auth service came back; wake every connection that was parked
    /// waiting for it so buffered commands get processed.
    pub fn notify_auth_reconnected(&self) {
        for handle in self.snapshot() {
            if handle.input_blocked() {
                debug!("Waking client {} blocked on auth service", handle.id());
                handle.notify_auth_ready();
            }
        }
    }

    pub(crate) fn sweep_once(&self) {
        for handle in self.snapshot() {
            if handle.idle_time() >= CLIENT_LOGIN_IDLE_TIMEOUT {
                handle.destroy(DisconnectReason::Inactivity);
            }
        }
    }

    fn destroy_oldest(&self) {
        let victims = {
            let clients = self.shared.clients.lock().unwrap();
            let mut oldest: BinaryHeap<OldestEntry> = BinaryHeap::new();
            for handle in clients.values() {
                oldest.push(OldestEntry(handle.clone()));
                if oldest.len() > CLIENT_DESTROY_OLDEST_COUNT {
                    // the heap keeps the oldest entries; drop the newest
                    oldest.pop();
                }
            }
            oldest.into_vec()
        };

        for OldestEntry(handle) in victims {
            handle.destroy(DisconnectReason::QueueFull);
        }
    }

    /// Run the idle sweep once per second until aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                registry.sweep_once();
            }
        })
    }
}

/// Max-heap entry ordered by creation time, so the newest connection is on
/// top and popping trims the heap down to the oldest batch.
struct OldestEntry(Arc<ClientHandle>);

impl PartialEq for OldestEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.created() == other.0.created()
    }
}

impl Eq for OldestEntry {}

impl PartialOrd for OldestEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OldestEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.created().cmp(&other.0.created())
    }
}
