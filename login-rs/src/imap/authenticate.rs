//! SASL driver: LOGIN and AUTHENTICATE
//!
//! Both commands funnel into the same exchange loop against the
//! authentication service. While an exchange runs the command pump is
//! suspended; client lines are consumed raw (base64 up to LF), not
//! IMAP-parsed.

use crate::auth::{AuthEvent, AuthRequest, Mechanism};
use crate::imap::connection::{Client, ClientStream, CommandOutcome, DisconnectReason};
use crate::imap::parser::Arg;
use crate::master::{LoginHandoff, MasterReply, MasterRequest};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

/// Base capability tokens, always advertised.
pub(crate) const CAPABILITY_STRING: &str = "IMAP4rev1";

/// Disconnect after this many rejected authentication attempts.
const CLIENT_MAX_AUTH_FAILURES: u32 = 3;

/// Mechanisms that may be offered (and used) at the current security
/// level: plaintext mechanisms are withheld from unsecured connections
/// when plaintext authentication is disabled.
pub fn legal_mechanisms(
    secured: bool,
    disable_plaintext_auth: bool,
    mechanisms: &[Mechanism],
) -> Vec<Mechanism> {
    mechanisms
        .iter()
        .filter(|mech| !(mech.plaintext && disable_plaintext_auth && !secured))
        .cloned()
        .collect()
}

/// The full capability line. A pure function of the connection's security
/// state so it can be recomputed at every send.
pub fn capability_string(
    tls: bool,
    secured: bool,
    tls_available: bool,
    disable_plaintext_auth: bool,
    mechanisms: &[Mechanism],
) -> String {
    let mut capability = String::from(CAPABILITY_STRING);
    if tls_available && !tls {
        capability.push_str(" STARTTLS");
    }
    if disable_plaintext_auth && !secured {
        capability.push_str(" LOGINDISABLED");
    }
    for mech in legal_mechanisms(secured, disable_plaintext_auth, mechanisms) {
        capability.push_str(" AUTH=");
        capability.push_str(&mech.name);
    }
    capability
}

impl Client {
    /// `LOGIN <user> <password>` — plaintext credentials wrapped into a
    /// PLAIN exchange.
    pub(crate) async fn cmd_login(&mut self, args: Vec<Arg>) -> CommandOutcome {
        let (user, password) = match (
            args.first().and_then(Arg::as_bytes),
            args.get(1).and_then(Arg::as_bytes),
        ) {
            (Some(user), Some(password)) => (user.to_vec(), password.to_vec()),
            _ => return CommandOutcome::Syntax,
        };

        self.virtual_user = Some(String::from_utf8_lossy(&user).into_owned());

        if !self.secured && self.config.server.disable_plaintext_auth {
            self.send_tagged("NO Plaintext authentication disabled.");
            return CommandOutcome::Handled;
        }

        let mut initial = Vec::with_capacity(user.len() + password.len() + 2);
        initial.push(0);
        initial.extend_from_slice(&user);
        initial.push(0);
        initial.extend_from_slice(&password);

        self.run_sasl("PLAIN", initial).await
    }

    /// `AUTHENTICATE <mechanism> [initial-response]`
    pub(crate) async fn cmd_authenticate(&mut self, args: Vec<Arg>) -> CommandOutcome {
        let Some(mech_name) = args.first().and_then(Arg::as_str) else {
            return CommandOutcome::Syntax;
        };
        let mech_name = mech_name.to_ascii_uppercase();

        let legal = legal_mechanisms(
            self.secured,
            self.config.server.disable_plaintext_auth,
            &self.auth.mechanisms(),
        );
        if !legal.iter().any(|mech| mech.name == mech_name) {
            self.send_tagged("NO Unsupported authentication mechanism.");
            return CommandOutcome::Handled;
        }

        // optional SASL initial response; "=" stands for an empty one
        let initial = match args.get(1) {
            None => Vec::new(),
            Some(arg) => {
                let Some(text) = arg.as_str() else {
                    return CommandOutcome::Syntax;
                };
                if text == "=" {
                    Vec::new()
                } else {
                    match BASE64.decode(text.trim().as_bytes()) {
                        Ok(data) => data,
                        Err(_) => {
                            self.send_tagged("BAD Invalid base64 data");
                            return CommandOutcome::Handled;
                        }
                    }
                }
            }
        };

        self.virtual_user = None;
        self.run_sasl(&mech_name, initial).await
    }

    /// Drive one exchange to completion. The pump stays out of the way
    /// until this returns; raw continuation lines are read here.
    async fn run_sasl(&mut self, mechanism: &str, initial_response: Vec<u8>) -> CommandOutcome {
        // consume the CRLF ending the command line before switching the
        // input to raw mode
        if !self.skip_command_line().await {
            return CommandOutcome::Handled;
        }

        self.authenticating = true;
        // the exchange holds its own reference: callbacks arriving after a
        // disconnect must still find the handle
        let _held = self.handle.clone();

        let mut session = self.auth.begin(AuthRequest {
            mechanism: mechanism.to_string(),
            initial_response,
            local_ip: self.handle.local().ip(),
            remote_ip: self.handle.peer().ip(),
            secured: self.secured,
        });

        let cancel = self.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = session.next_event() => event,
            };

            match event {
                AuthEvent::Continue(payload) => {
                    let line = if payload.is_empty() {
                        "+".to_string()
                    } else {
                        format!("+ {}", BASE64.encode(&payload))
                    };
                    if !self.send_line(&line) || !self.flush_output().await {
                        break;
                    }

                    let Some(reply) = self.read_raw_line().await else {
                        break;
                    };
                    let reply = reply.trim().to_string();

                    if reply == "*" {
                        self.send_tagged("BAD Authentication aborted");
                        break;
                    }
                    match BASE64.decode(reply.as_bytes()) {
                        Ok(data) => session.respond(data),
                        Err(_) => {
                            self.send_tagged("BAD Invalid base64 data");
                            break;
                        }
                    }
                }
                AuthEvent::Success { user, credentials } => {
                    self.virtual_user = Some(user.clone());
                    self.finish_login(user, credentials).await;
                    break;
                }
                AuthEvent::Failed(reason) => {
                    debug!(user = ?self.virtual_user, "Authentication failed: {}", reason);
                    self.auth_failures += 1;
                    // identical wording for unknown user and bad password
                    self.send_tagged("NO Authentication failed.");
                    if self.auth_failures >= CLIENT_MAX_AUTH_FAILURES {
                        self.send_line("* BYE Too many invalid login attempts.");
                        self.handle
                            .destroy(DisconnectReason::TooManyAuthFailures);
                    }
                    break;
                }
                AuthEvent::InternalError => {
                    self.internal_failure();
                    break;
                }
            }
        }

        self.authenticating = false;
        CommandOutcome::Handled
    }

    /// Ask the master for a post-login slot and, on success, move the
    /// stream over to it.
    async fn finish_login(&mut self, user: String, credentials: Vec<u8>) {
        let ticket = self.master.request(MasterRequest {
            user: user.clone(),
            credentials: credentials.clone(),
        });

        let cancel = self.cancel.clone();
        let reply = tokio::select! {
            // dropping the ticket aborts the master request
            _ = cancel.cancelled() => return,
            reply = ticket.wait() => reply,
        };

        match reply {
            MasterReply::Ok => {
                if !self.send_tagged("OK Logged in.") || !self.flush_output().await {
                    return;
                }
                let stream = std::mem::replace(&mut self.stream, ClientStream::Detached);
                info!(peer = %self.handle.peer(), user = %user, "Handing off to post-login process");
                self.master.transfer(LoginHandoff {
                    stream,
                    user: user.clone(),
                    credentials,
                    peer: self.handle.peer(),
                    secured: self.secured,
                });
                self.handle.destroy(DisconnectReason::LoggedIn { user });
            }
            MasterReply::Fail => self.internal_failure(),
        }
    }

    fn internal_failure(&mut self) {
        self.send_line("* BYE Internal login failure. Refer to server log for more information.");
        self.handle.destroy(DisconnectReason::InternalFailure {
            user: self.virtual_user.clone(),
        });
    }

    /// Consume the rest of the command line (through LF) so raw SASL reads
    /// start clean.
    async fn skip_command_line(&mut self) -> bool {
        if !self.skip_line {
            return true;
        }
        if self.read_raw_line().await.is_none() {
            return false;
        }
        self.skip_line = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthService, AuthSession, SaslReply};
    use crate::config::Config;
    use crate::imap::connection::ClientHandle;
    use crate::master::{ChannelMaster, MasterService};
    use crate::registry::ClientRegistry;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::{mpsc, watch};

    fn mechs() -> Vec<Mechanism> {
        vec![
            Mechanism::new("PLAIN", true),
            Mechanism::new("OAUTHBEARER", false),
        ]
    }

    #[test]
    fn test_legal_mechanisms_hide_plaintext_when_unsecured() {
        let legal = legal_mechanisms(false, true, &mechs());
        assert_eq!(legal.len(), 1);
        assert_eq!(legal[0].name, "OAUTHBEARER");

        // secured connections may use everything
        let legal = legal_mechanisms(true, true, &mechs());
        assert_eq!(legal.len(), 2);

        // with plaintext auth allowed, nothing is hidden
        let legal = legal_mechanisms(false, false, &mechs());
        assert_eq!(legal.len(), 2);
    }

    #[test]
    fn test_capability_string_variants() {
        // plaintext, unsecured, TLS available
        assert_eq!(
            capability_string(false, false, true, true, &mechs()),
            "IMAP4rev1 STARTTLS LOGINDISABLED AUTH=OAUTHBEARER"
        );
        // after STARTTLS
        assert_eq!(
            capability_string(true, true, true, true, &mechs()),
            "IMAP4rev1 AUTH=PLAIN AUTH=OAUTHBEARER"
        );
        // no TLS configured, plaintext allowed
        assert_eq!(
            capability_string(false, false, false, false, &mechs()),
            "IMAP4rev1 AUTH=PLAIN AUTH=OAUTHBEARER"
        );
        // loopback without TLS: secured, no LOGINDISABLED
        assert_eq!(
            capability_string(false, true, true, true, &mechs()),
            "IMAP4rev1 STARTTLS AUTH=PLAIN AUTH=OAUTHBEARER"
        );
    }

    /// Scripted auth service for exercising the driver without a socket.
    enum Script {
        /// Accept when the PLAIN response carries this password.
        Plain { password: &'static str },
        /// Always error out.
        Broken,
    }

    struct StubAuth {
        script: Script,
        connected: watch::Sender<bool>,
    }

    impl StubAuth {
        fn new(script: Script) -> Self {
            let (connected, _) = watch::channel(true);
            Self { script, connected }
        }
    }

    impl AuthService for StubAuth {
        fn mechanisms(&self) -> Vec<Mechanism> {
            mechs()
        }

        fn is_connected(&self) -> bool {
            *self.connected.subscribe().borrow()
        }

        fn connected_watch(&self) -> watch::Receiver<bool> {
            self.connected.subscribe()
        }

        fn begin(&self, request: AuthRequest) -> AuthSession {
            let (session, mut backend) = AuthSession::channel();
            let script = match &self.script {
                Script::Plain { password } => Some(*password),
                Script::Broken => None,
            };
            tokio::spawn(async move {
                let Some(password) = script else {
                    let _ = backend.events.send(AuthEvent::InternalError);
                    return;
                };
                let mut response = request.initial_response;
                if response.is_empty() {
                    let _ = backend.events.send(AuthEvent::Continue(Vec::new()));
                    match backend.replies.recv().await {
                        Some(SaslReply::Response(data)) => response = data,
                        _ => return,
                    }
                }
                let mut parts = response.split(|&b| b == 0).skip(1);
                let user = parts.next().unwrap_or_default();
                let pass = parts.next().unwrap_or_default();
                let event = if pass == password.as_bytes() {
                    AuthEvent::Success {
                        user: String::from_utf8_lossy(user).into_owned(),
                        credentials: b"blob".to_vec(),
                    }
                } else {
                    AuthEvent::Failed("wrong password".to_string())
                };
                let _ = backend.events.send(event);
            });
            session
        }
    }

    struct Harness {
        client_side: BufReader<DuplexStream>,
        handoffs: mpsc::UnboundedReceiver<LoginHandoff>,
        handle: Arc<ClientHandle>,
    }

    impl Harness {
        async fn send(&mut self, line: &str) {
            self.client_side
                .get_mut()
                .write_all(line.as_bytes())
                .await
                .unwrap();
        }

        async fn expect(&mut self, want: &str) {
            let mut line = String::new();
            self.client_side.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), want);
        }
    }

    fn spawn_client(peer: &str, script: Script, disable_plaintext_auth: bool) -> Harness {
        let peer: SocketAddr = peer.parse().unwrap();
        let local: SocketAddr = "192.0.2.1:143".parse().unwrap();

        let mut config = Config::default();
        config.server.disable_plaintext_auth = disable_plaintext_auth;
        config.server.greeting = "ready".to_string();

        let registry = ClientRegistry::new(16);
        let handle = registry.register(peer, local);

        let (master, handoffs) = ChannelMaster::new();
        let (server_side, client_side) = tokio::io::duplex(MAX_TEST_BUF);

        let client = Client::create(
            ClientStream::Mem(server_side),
            false,
            handle.clone(),
            Arc::new(config),
            Arc::new(StubAuth::new(script)),
            Arc::new(master) as Arc<dyn MasterService>,
            None,
        );
        tokio::spawn(client.run());

        Harness {
            client_side: BufReader::new(client_side),
            handoffs,
            handle,
        }
    }

    const MAX_TEST_BUF: usize = 16 * 1024;

    #[tokio::test]
    async fn test_plaintext_login_refused_when_unsecured() {
        let mut h = spawn_client("203.0.113.5:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        h.send("a LOGIN alice pw\r\n").await;
        h.expect("a NO Plaintext authentication disabled.").await;

        // the connection survives and keeps serving commands
        h.send("b NOOP\r\n").await;
        h.expect("b OK NOOP completed.").await;
        assert!(!h.handle.is_destroyed());
    }

    #[tokio::test]
    async fn test_login_success_hands_off() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "s3cret" }, true);
        h.expect("* OK ready").await;

        h.send("a LOGIN alice s3cret\r\n").await;
        h.expect("a OK Logged in.").await;

        let handoff = h.handoffs.recv().await.expect("no handoff");
        assert_eq!(handoff.user, "alice");
        assert_eq!(handoff.credentials, b"blob");
        assert!(handoff.secured);
        assert!(h.handle.is_destroyed());
    }

    #[tokio::test]
    async fn test_login_failure_keeps_connection() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "right" }, true);
        h.expect("* OK ready").await;

        h.send("a LOGIN alice wrong\r\n").await;
        h.expect("a NO Authentication failed.").await;
        assert!(!h.handle.is_destroyed());

        h.send("b NOOP\r\n").await;
        h.expect("b OK NOOP completed.").await;
    }

    #[tokio::test]
    async fn test_repeated_failures_disconnect() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "right" }, true);
        h.expect("* OK ready").await;

        h.send("a LOGIN alice wrong\r\n").await;
        h.expect("a NO Authentication failed.").await;
        h.send("b LOGIN alice wrong\r\n").await;
        h.expect("b NO Authentication failed.").await;
        h.send("c LOGIN alice wrong\r\n").await;
        h.expect("c NO Authentication failed.").await;
        h.expect("* BYE Too many invalid login attempts.").await;
        assert!(h.handle.is_destroyed());
    }

    #[tokio::test]
    async fn test_authenticate_challenge_and_cancel() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        h.send("a AUTHENTICATE PLAIN\r\n").await;
        h.expect("+").await;
        h.send("*\r\n").await;
        h.expect("a BAD Authentication aborted").await;

        // pumping resumes after the abort
        h.send("b NOOP\r\n").await;
        h.expect("b OK NOOP completed.").await;
        assert!(!h.handle.is_destroyed());
    }

    #[tokio::test]
    async fn test_authenticate_round_trip() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        h.send("a AUTHENTICATE PLAIN\r\n").await;
        h.expect("+").await;
        let response = BASE64.encode(b"\0bob\0pw");
        h.send(&format!("{}\r\n", response)).await;
        h.expect("a OK Logged in.").await;

        let handoff = h.handoffs.recv().await.expect("no handoff");
        assert_eq!(handoff.user, "bob");
    }

    #[tokio::test]
    async fn test_authenticate_initial_response() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        let initial = BASE64.encode(b"\0carol\0pw");
        h.send(&format!("a AUTHENTICATE PLAIN {}\r\n", initial)).await;
        h.expect("a OK Logged in.").await;
    }

    #[tokio::test]
    async fn test_authenticate_unknown_mechanism() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        h.send("a AUTHENTICATE KERBEROS_V4\r\n").await;
        h.expect("a NO Unsupported authentication mechanism.").await;
        assert!(!h.handle.is_destroyed());
    }

    #[tokio::test]
    async fn test_authenticate_plaintext_mech_blocked_when_unsecured() {
        let mut h = spawn_client("203.0.113.5:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        h.send("a AUTHENTICATE PLAIN\r\n").await;
        h.expect("a NO Unsupported authentication mechanism.").await;
    }

    #[tokio::test]
    async fn test_authenticate_bad_base64() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Plain { password: "pw" }, true);
        h.expect("* OK ready").await;

        h.send("a AUTHENTICATE PLAIN\r\n").await;
        h.expect("+").await;
        h.send("!!!not-base64!!!\r\n").await;
        h.expect("a BAD Invalid base64 data").await;
        assert!(!h.handle.is_destroyed());
    }

    #[tokio::test]
    async fn test_internal_auth_error_drops_connection() {
        let mut h = spawn_client("127.0.0.1:40000", Script::Broken, true);
        h.expect("* OK ready").await;

        h.send("a LOGIN alice pw\r\n").await;
        h.expect("* BYE Internal login failure. Refer to server log for more information.")
            .await;
        assert!(h.handle.is_destroyed());
        assert_eq!(
            h.handle.reason(),
            DisconnectReason::InternalFailure {
                user: Some("alice".to_string())
            }
        );
    }
}
