//! Authentication service interface
//!
//! The front-end never verifies credentials itself; it relays SASL
//! exchanges to an out-of-process authentication service. This module
//! defines the service-facing types and the [`AuthService`] trait the
//! connection code consumes; [`client`] implements it over a socket.

pub mod client;

use std::net::IpAddr;
use tokio::sync::{mpsc, watch};

pub use client::AuthClient;

/// One SASL mechanism the authentication service offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub name: String,
    /// The exchange reveals the password; hidden on unsecured connections
    /// when plaintext authentication is disabled.
    pub plaintext: bool,
}

impl Mechanism {
    pub fn new(name: &str, plaintext: bool) -> Self {
        Self {
            name: name.to_string(),
            plaintext,
        }
    }
}

/// Parameters for starting one authentication request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub mechanism: String,
    pub initial_response: Vec<u8>,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub secured: bool,
}

/// Server-side progress of an authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// SASL server challenge; relay to the client as a `+` continuation.
    Continue(Vec<u8>),
    /// Credentials accepted. `credentials` is the opaque blob handed to the
    /// post-login process.
    Success { user: String, credentials: Vec<u8> },
    /// Credentials rejected. The reason is for the log, not the client.
    Failed(String),
    /// The service failed; the connection must be dropped.
    InternalError,
}

/// Client-side message sent back into an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslReply {
    Response(Vec<u8>),
    Cancel,
}

/// Front-end half of one running authentication exchange. Dropping the
/// session (or any terminal [`AuthEvent`]) ends the exchange; a drop before
/// completion sends [`SaslReply::Cancel`] so the service aborts its side.
pub struct AuthSession {
    events: mpsc::UnboundedReceiver<AuthEvent>,
    replies: mpsc::UnboundedSender<SaslReply>,
    finished: bool,
}

/// Service half of one exchange; used by [`client::AuthClient`] internally
/// and by test doubles.
pub struct AuthBackend {
    pub events: mpsc::UnboundedSender<AuthEvent>,
    pub replies: mpsc::UnboundedReceiver<SaslReply>,
}

impl AuthSession {
    /// Create a connected session/backend pair.
    pub fn channel() -> (AuthSession, AuthBackend) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        (
            AuthSession {
                events: events_rx,
                replies: replies_tx,
                finished: false,
            },
            AuthBackend {
                events: events_tx,
                replies: replies_rx,
            },
        )
    }

    /// Wait for the next event. A vanished backend is an internal error.
    pub async fn next_event(&mut self) -> AuthEvent {
        let event = match self.events.recv().await {
            Some(event) => event,
            None => AuthEvent::InternalError,
        };
        if !matches!(event, AuthEvent::Continue(_)) {
            self.finished = true;
        }
        event
    }

    /// Send the client's answer to the last challenge.
    pub fn respond(&self, data: Vec<u8>) {
        let _ = self.replies.send(SaslReply::Response(data));
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.replies.send(SaslReply::Cancel);
        }
    }
}

/// What the connection layer needs from the authentication service.
pub trait AuthService: Send + Sync + 'static {
    /// Mechanisms the service announced, in announcement order.
    fn mechanisms(&self) -> Vec<Mechanism>;

    /// Whether the service connection is currently up.
    fn is_connected(&self) -> bool;

    /// Watch for connectivity transitions (used to resume blocked input).
    fn connected_watch(&self) -> watch::Receiver<bool>;

    /// Start an authentication request. Never blocks; a request started
    /// while the service is down fails with [`AuthEvent::InternalError`].
    fn begin(&self, request: AuthRequest) -> AuthSession;
}
