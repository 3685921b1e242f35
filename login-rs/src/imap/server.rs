//! Listener and accept loop
//!
//! Accepts TCP connections, registers them, and runs one task per client.
//! Also owns the two background jobs tied to the registry: the one-second
//! idle sweep and the bridge that wakes parked clients when the auth
//! service reconnects.

use crate::auth::AuthService;
use crate::config::Config;
use crate::error::Result;
use crate::imap::connection::{Client, ClientStream};
use crate::master::MasterService;
use crate::registry::ClientRegistry;
use crate::security::TlsProvider;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct LoginServer {
    config: Arc<Config>,
    auth: Arc<dyn AuthService>,
    master: Arc<dyn MasterService>,
    tls: Option<TlsProvider>,
    registry: ClientRegistry,
}

impl LoginServer {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn AuthService>,
        master: Arc<dyn MasterService>,
        tls: Option<TlsProvider>,
    ) -> Self {
        let registry = ClientRegistry::new(config.server.max_logging_users);
        Self {
            config,
            auth,
            master,
            tls,
            registry,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        info!(
            "IMAP login service listening on {}",
            self.config.server.listen_addr
        );
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind an ephemeral port).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let _sweeper = self.registry.spawn_sweeper();
        self.spawn_auth_bridge();

        if self.tls.is_some() {
            info!("STARTTLS support enabled");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let local = match stream.local_addr() {
                        Ok(local) => local,
                        Err(e) => {
                            error!("Failed to read local address: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }

                    let handle = self.registry.register(peer, local);
                    let client = Client::create(
                        ClientStream::Plain(stream),
                        false,
                        handle,
                        self.config.clone(),
                        self.auth.clone(),
                        self.master.clone(),
                        self.tls.clone(),
                    );
                    tokio::spawn(client.run());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Wake every parked connection when the auth service comes back.
    fn spawn_auth_bridge(&self) {
        let mut connected = self.auth.connected_watch();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                if connected.changed().await.is_err() {
                    return;
                }
                if *connected.borrow() {
                    info!("Auth service connected, resuming blocked clients");
                    registry.notify_auth_reconnected();
                }
            }
        });
    }
}
