use login_rs::auth::{AuthEvent, AuthRequest, AuthService, AuthSession, Mechanism, SaslReply};
use login_rs::config::Config;
use login_rs::imap::LoginServer;
use login_rs::master::{ChannelMaster, LoginHandoff};
use login_rs::registry::ClientRegistry;
use login_rs::security::{generate_self_signed_cert, TlsProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Scripted authentication service: verifies PLAIN responses against one
/// fixed password, and can simulate the service being down.
pub struct ScriptedAuth {
    password: &'static str,
    connected: watch::Sender<bool>,
}

impl ScriptedAuth {
    pub fn new(password: &'static str, connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self {
            password,
            connected: tx,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        let _ = self.connected.send(connected);
    }
}

impl AuthService for ScriptedAuth {
    fn mechanisms(&self) -> Vec<Mechanism> {
        vec![Mechanism::new("PLAIN", true)]
    }

    fn is_connected(&self) -> bool {
        *self.connected.subscribe().borrow()
    }

    fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn begin(&self, request: AuthRequest) -> AuthSession {
        let (session, mut backend) = AuthSession::channel();
        let password = self.password;
        tokio::spawn(async move {
            let mut response = request.initial_response;
            if response.is_empty() {
                if backend.events.send(AuthEvent::Continue(Vec::new())).is_err() {
                    return;
                }
                match backend.replies.recv().await {
                    Some(SaslReply::Response(data)) => response = data,
                    _ => return,
                }
            }
            let mut parts = response.split(|&b| b == 0).skip(1);
            let user = parts.next().unwrap_or_default();
            let pass = parts.next().unwrap_or_default();
            let event = if !user.is_empty() && pass == password.as_bytes() {
                AuthEvent::Success {
                    user: String::from_utf8_lossy(user).into_owned(),
                    credentials: b"token".to_vec(),
                }
            } else {
                AuthEvent::Failed("credentials rejected".to_string())
            };
            let _ = backend.events.send(event);
        });
        session
    }
}

pub struct TestOptions {
    pub greeting_capability: bool,
    pub disable_plaintext_auth: bool,
    pub tls: bool,
    pub max_logging_users: usize,
    pub auth_connected: bool,
    pub password: &'static str,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            greeting_capability: true,
            disable_plaintext_auth: true,
            tls: false,
            max_logging_users: 64,
            auth_connected: true,
            password: "s3cret",
        }
    }
}

/// One running login front-end on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub auth: Arc<ScriptedAuth>,
    pub handoffs: mpsc::UnboundedReceiver<LoginHandoff>,
    pub registry: ClientRegistry,
    _certs: Option<tempfile::TempDir>,
}

impl TestServer {
    pub async fn spawn(options: TestOptions) -> Self {
        let mut config = Config::default();
        config.server.greeting = "ready".to_string();
        config.server.greeting_capability = options.greeting_capability;
        config.server.disable_plaintext_auth = options.disable_plaintext_auth;
        config.server.max_logging_users = options.max_logging_users;

        let (tls, certs) = if options.tls {
            let dir = tempfile::tempdir().unwrap();
            let cert = dir.path().join("cert.pem");
            let key = dir.path().join("key.pem");
            generate_self_signed_cert(
                "test.local",
                cert.to_str().unwrap(),
                key.to_str().unwrap(),
            )
            .unwrap();
            let provider = TlsProvider::from_pem_files(&cert, &key).unwrap();
            (Some(provider), Some(dir))
        } else {
            (None, None)
        };

        let auth = Arc::new(ScriptedAuth::new(options.password, options.auth_connected));
        let (master, handoffs) = ChannelMaster::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(LoginServer::new(
            Arc::new(config),
            auth.clone(),
            Arc::new(master),
            tls,
        ));
        let registry = server.registry().clone();

        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            auth,
            handoffs,
            registry,
            _certs: certs,
        }
    }
}
