//! Post-login handoff
//!
//! After a successful authentication the front-end asks the master for a
//! post-login slot, then transfers the live stream (plus the credential
//! blob the auth service returned) and destroys its side of the
//! connection.

use crate::imap::connection::ClientStream;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterReply {
    Ok,
    Fail,
}

#[derive(Debug, Clone)]
pub struct MasterRequest {
    pub user: String,
    pub credentials: Vec<u8>,
}

/// Outstanding master request. Dropping the ticket before the reply arrives
/// aborts the request.
pub struct MasterTicket {
    reply: oneshot::Receiver<MasterReply>,
}

impl MasterTicket {
    pub fn new(reply: oneshot::Receiver<MasterReply>) -> Self {
        Self { reply }
    }

    /// Wait for the master's answer; a vanished master is a failure.
    pub async fn wait(self) -> MasterReply {
        self.reply.await.unwrap_or(MasterReply::Fail)
    }
}

/// An authenticated session leaving the front-end.
pub struct LoginHandoff {
    pub stream: ClientStream,
    pub user: String,
    pub credentials: Vec<u8>,
    pub peer: SocketAddr,
    pub secured: bool,
}

/// The post-login process boundary.
pub trait MasterService: Send + Sync + 'static {
    /// Ask for a post-login slot for `request`.
    fn request(&self, request: MasterRequest) -> MasterTicket;

    /// Transfer the connection after an `Ok` reply.
    fn transfer(&self, handoff: LoginHandoff);
}

/// In-process master: accepts every request and forwards handoffs through a
/// channel to whatever consumes them (the post-login task, or a test).
pub struct ChannelMaster {
    handoffs: mpsc::UnboundedSender<LoginHandoff>,
}

impl ChannelMaster {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoginHandoff>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { handoffs: tx }, rx)
    }
}

impl MasterService for ChannelMaster {
    fn request(&self, _request: MasterRequest) -> MasterTicket {
        let (tx, rx) = oneshot::channel();
        let reply = if self.handoffs.is_closed() {
            MasterReply::Fail
        } else {
            MasterReply::Ok
        };
        let _ = tx.send(reply);
        MasterTicket::new(rx)
    }

    fn transfer(&self, handoff: LoginHandoff) {
        // a closed receiver drops the stream, which closes the connection
        let _ = self.handoffs.send(handoff);
    }
}
