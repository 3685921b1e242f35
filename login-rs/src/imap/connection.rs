//! Pre-login client connection
//!
//! One [`Client`] owns the socket, the buffered input/output, the parser
//! and the per-connection command state machine. Everything other tasks
//! need to reach — idle bookkeeping, destroy, the auth-reconnect wakeup —
//! lives in the shared [`ClientHandle`].

use crate::auth::AuthService;
use crate::config::Config;
use crate::imap::authenticate::capability_string;
use crate::imap::parser::{Arg, ImapParser};
use crate::master::MasterService;
use crate::registry::RegistryShared;
use crate::security::TlsProvider;
use bytes::{Buf, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Max size of one parameter in a line, and max SASL reply length.
pub(crate) const MAX_INBUF_SIZE: usize = 4096;

/// Max size of the output buffer. If a reply does not fit, the client is
/// disconnected.
pub(crate) const MAX_OUTBUF_SIZE: usize = 4096;

/// Disconnect a client after this many bad commands.
const CLIENT_MAX_BAD_COMMANDS: u32 = 10;

/// How long to keep reading after the final write, so the goodbye line is
/// not lost to a reset while the peer still has unread data in flight.
const CLIENT_LINGER_TIMEOUT: Duration = Duration::from_millis(500);

/// Unified stream type for plain and TLS connections, so a STARTTLS
/// upgrade can swap the transport mid-session.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient during the STARTTLS upgrade, terminal after a post-login
    /// handoff. Never read from or written to.
    Detached,
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Detached => panic!("I/O on detached client stream"),
            #[cfg(test)]
            ClientStream::Mem(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Detached => panic!("I/O on detached client stream"),
            #[cfg(test)]
            ClientStream::Mem(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Detached => panic!("I/O on detached client stream"),
            #[cfg(test)]
            ClientStream::Mem(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Detached => panic!("I/O on detached client stream"),
            #[cfg(test)]
            ClientStream::Mem(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Why a connection ended. Carries both the deferred `* BYE` line (for
/// destroys initiated outside the owning task) and the log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Transport EOF or error; nothing more to say to the client.
    Disconnected,
    InputBufferFull,
    TransmitBufferFull,
    TooManyBadCommands,
    TooManyAuthFailures,
    Inactivity,
    QueueFull,
    /// Client logged out before authenticating.
    AbortedLogin,
    InternalFailure { user: Option<String> },
    TlsInitFailed,
    ProtocolFatal(&'static str),
    /// Successful login; the stream now belongs to the post-login process.
    LoggedIn { user: String },
    /// Process shutdown; quiet.
    Shutdown,
}

impl DisconnectReason {
    /// `* BYE` line owed to the client at teardown. Only destroys initiated
    /// outside the connection task defer their BYE here; inline paths have
    /// already queued theirs.
    fn bye_line(&self) -> Option<&'static str> {
        match self {
            DisconnectReason::Inactivity => Some("* BYE Disconnected for inactivity."),
            DisconnectReason::QueueFull => Some("* BYE Connection queue full."),
            _ => None,
        }
    }

    fn should_log(&self) -> bool {
        !matches!(self, DisconnectReason::Shutdown)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Disconnected => write!(f, "Disconnected"),
            DisconnectReason::InputBufferFull => write!(f, "Disconnected: Input buffer full"),
            DisconnectReason::TransmitBufferFull => write!(f, "Transmit buffer full"),
            DisconnectReason::TooManyBadCommands => {
                write!(f, "Disconnected: Too many invalid commands")
            }
            DisconnectReason::TooManyAuthFailures => {
                write!(f, "Disconnected: Too many invalid login attempts")
            }
            DisconnectReason::Inactivity => write!(f, "Disconnected: Inactivity"),
            DisconnectReason::QueueFull => write!(f, "Disconnected: Connection queue full"),
            DisconnectReason::AbortedLogin => write!(f, "Aborted login"),
            DisconnectReason::InternalFailure { user } => match user {
                Some(user) => write!(f, "Internal login failure: {}", user),
                None => write!(f, "Internal login failure"),
            },
            DisconnectReason::TlsInitFailed => write!(f, "TLS initialization failed"),
            DisconnectReason::ProtocolFatal(msg) => write!(f, "Disconnected: {}", msg),
            DisconnectReason::LoggedIn { user } => write!(f, "Login: {}", user),
            DisconnectReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The channel is believed confidential: TLS is active or the peer is on
/// the loopback network.
pub(crate) fn is_secured(tls: bool, peer: IpAddr) -> bool {
    tls || peer.is_loopback()
}

/// Shared per-connection state. The `Arc` refcount is the connection's
/// lifetime: the registry, the owning task and any in-flight callback each
/// hold a clone, and the memory goes away with the last one.
pub struct ClientHandle {
    id: u64,
    peer: SocketAddr,
    local: SocketAddr,
    created: Instant,
    last_input: Mutex<Instant>,
    tls: AtomicBool,
    destroyed: AtomicBool,
    input_blocked: AtomicBool,
    reason: Mutex<Option<DisconnectReason>>,
    cancel: CancellationToken,
    auth_ready: Notify,
    registry: Weak<RegistryShared>,
}

impl ClientHandle {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        local: SocketAddr,
        registry: Weak<RegistryShared>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer,
            local,
            created: now,
            last_input: Mutex::new(now),
            tls: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            input_blocked: AtomicBool::new(false),
            reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            auth_ready: Notify::new(),
            registry,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    pub(crate) fn touch_input(&self) {
        *self.last_input.lock().unwrap() = Instant::now();
    }

    pub(crate) fn idle_time(&self) -> Duration {
        Instant::now().duration_since(*self.last_input.lock().unwrap())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tls(&self, tls: bool) {
        self.tls.store(tls, Ordering::Relaxed);
    }

    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Relaxed)
    }

    pub(crate) fn set_input_blocked(&self, blocked: bool) {
        self.input_blocked.store(blocked, Ordering::SeqCst);
    }

    pub(crate) fn input_blocked(&self) -> bool {
        self.input_blocked.load(Ordering::SeqCst)
    }

    pub(crate) fn notify_auth_ready(&self) {
        self.auth_ready.notify_one();
    }

    pub(crate) fn auth_ready(&self) -> Notified<'_> {
        self.auth_ready.notified()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn reason(&self) -> DisconnectReason {
        self.reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(DisconnectReason::Disconnected)
    }

    /// End this connection. Idempotent and callable from any task: the
    /// first call records the reason, leaves the registry immediately and
    /// cancels the owning task, which performs the terminal write and
    /// closes the socket. Later calls (and callbacks firing after them)
    /// find `is_destroyed` set and do nothing.
    pub fn destroy(&self, reason: DisconnectReason) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.reason.lock().unwrap() = Some(reason);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.cancel.cancel();
    }
}

/// Result of one parse-and-dispatch step.
pub(crate) enum Pump {
    /// A command completed; another may follow in the buffer.
    Again,
    /// The buffer holds no complete command.
    NeedMore,
    /// The connection is going away.
    Stop,
}

/// How a dispatched command ended.
pub(crate) enum CommandOutcome {
    Handled,
    /// Arguments did not fit the command; counts against the bad-command
    /// budget like an unknown command.
    Syntax,
    Unknown,
}

pub struct Client {
    pub(crate) handle: Arc<ClientHandle>,
    pub(crate) config: Arc<Config>,
    pub(crate) auth: Arc<dyn AuthService>,
    pub(crate) master: Arc<dyn MasterService>,
    tls_provider: Option<TlsProvider>,
    pub(crate) stream: ClientStream,
    pub(crate) cancel: CancellationToken,
    inbuf: BytesMut,
    outbuf: BytesMut,
    parser: ImapParser,
    pub(crate) tls: bool,
    pub(crate) secured: bool,
    cmd_tag: Option<String>,
    cmd_name: Option<String>,
    cmd_finished: bool,
    pub(crate) skip_line: bool,
    bad_counter: u32,
    input_blocked: bool,
    pub(crate) authenticating: bool,
    pub(crate) auth_failures: u32,
    pub(crate) virtual_user: Option<String>,
}

impl Client {
    pub fn create(
        stream: ClientStream,
        tls: bool,
        handle: Arc<ClientHandle>,
        config: Arc<Config>,
        auth: Arc<dyn AuthService>,
        master: Arc<dyn MasterService>,
        tls_provider: Option<TlsProvider>,
    ) -> Self {
        let secured = is_secured(tls, handle.peer().ip());
        handle.set_tls(tls);
        let cancel = handle.cancel_token();
        Self {
            handle,
            config,
            auth,
            master,
            tls_provider,
            stream,
            cancel,
            inbuf: BytesMut::with_capacity(MAX_INBUF_SIZE),
            outbuf: BytesMut::with_capacity(MAX_OUTBUF_SIZE),
            parser: ImapParser::new(),
            tls,
            secured,
            cmd_tag: None,
            cmd_name: None,
            cmd_finished: false,
            skip_line: false,
            bad_counter: 0,
            input_blocked: false,
            authenticating: false,
            auth_failures: 0,
            virtual_user: None,
        }
    }

    pub(crate) fn capability(&self) -> String {
        capability_string(
            self.tls,
            self.secured,
            self.tls_provider.is_some(),
            self.config.server.disable_plaintext_auth,
            &self.auth.mechanisms(),
        )
    }

    /// Drive the connection until it is destroyed or handed off.
    pub async fn run(mut self) {
        info!(peer = %self.handle.peer(), "Client connected");
        self.refresh_title();

        let mut greeting = String::from("* OK ");
        if self.config.server.greeting_capability {
            greeting.push_str(&format!("[CAPABILITY {}] ", self.capability()));
        }
        greeting.push_str(&self.config.server.greeting);

        if self.send_line(&greeting) && self.flush_output().await {
            self.read_loop().await;
        }

        self.teardown().await;
    }

    async fn read_loop(&mut self) {
        let handle = self.handle.clone();
        let cancel = self.cancel.clone();

        loop {
            if handle.is_destroyed() {
                return;
            }

            if self.input_blocked {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = handle.auth_ready() => {
                        debug!("Auth service available, resuming input");
                        self.input_blocked = false;
                        handle.set_input_blocked(false);
                        if !self.process_input().await {
                            return;
                        }
                    }
                }
                continue;
            }

            let space = MAX_INBUF_SIZE - self.inbuf.len();
            if space == 0 {
                self.send_line("* BYE Input buffer full, aborting");
                handle.destroy(DisconnectReason::InputBufferFull);
                return;
            }

            let mut chunk = [0u8; MAX_INBUF_SIZE];
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = self.stream.read(&mut chunk[..space]) => read,
            };

            match read {
                Ok(0) => {
                    handle.destroy(DisconnectReason::Disconnected);
                    return;
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if !self.process_input().await {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Read error: {}", e);
                    handle.destroy(DisconnectReason::Disconnected);
                    return;
                }
            }
        }
    }

    /// Handle freshly buffered input: either park until the auth service is
    /// back, or pump commands out of the buffer. Returns false once the
    /// connection is gone.
    async fn process_input(&mut self) -> bool {
        self.handle.touch_input();

        if !self.auth.is_connected() {
            // flag first: a reconnect notification may race with the flush
            self.input_blocked = true;
            self.handle.set_input_blocked(true);
            if !self.send_line("* OK Waiting for authentication process to respond..")
                || !self.flush_output().await
            {
                return false;
            }
            return true;
        }

        // output is corked for the whole pump so multi-line replies leave
        // in one write
        self.pump().await;
        if self.handle.is_destroyed() {
            return false;
        }
        self.flush_output().await
    }

    async fn pump(&mut self) {
        loop {
            match self.handle_input().await {
                Pump::Again => {
                    if self.handle.is_destroyed() {
                        return;
                    }
                }
                Pump::NeedMore => {
                    if self.parser.take_continuation_request() {
                        self.send_line("+ OK");
                    }
                    return;
                }
                Pump::Stop => return,
            }
        }
    }

    /// One parse-and-dispatch step.
    async fn handle_input(&mut self) -> Pump {
        debug_assert!(!self.authenticating);

        if self.cmd_finished {
            // clear the previous command; the tag had to survive until now
            // for late tagged replies
            self.cmd_tag = None;
            self.cmd_name = None;
            self.parser.reset();

            if self.skip_line {
                if !self.skip_to_lf() {
                    return Pump::NeedMore;
                }
                self.skip_line = false;
            }

            self.cmd_finished = false;
        }

        if self.cmd_tag.is_none() {
            match self.parser.read_word(&mut self.inbuf) {
                Some(word) => self.cmd_tag = Some(word),
                None => return Pump::NeedMore,
            }
        }

        if self.cmd_name.is_none() {
            match self.parser.read_word(&mut self.inbuf) {
                Some(word) => self.cmd_name = Some(word),
                None => return Pump::NeedMore,
            }
        }

        let args = match self.parser.read_args(&mut self.inbuf) {
            Ok(Some(args)) => args,
            Ok(None) => return Pump::NeedMore,
            Err(err) if err.is_fatal() => {
                self.send_line(&format!("* BYE {}", err.message()));
                self.handle
                    .destroy(DisconnectReason::ProtocolFatal(err.message()));
                return Pump::Stop;
            }
            Err(err) => {
                self.cmd_finished = true;
                self.skip_line = true;
                return self.command_failed(Some(err.message()));
            }
        };

        // the terminating CRLF is still unread
        self.skip_line = true;

        let outcome = if self.cmd_tag.as_deref() == Some("") {
            CommandOutcome::Unknown
        } else {
            let name = self
                .cmd_name
                .as_deref()
                .unwrap_or_default()
                .to_ascii_uppercase();
            self.dispatch(&name, args).await
        };

        self.cmd_finished = true;
        match outcome {
            CommandOutcome::Handled => {
                if self.handle.is_destroyed() {
                    Pump::Stop
                } else {
                    Pump::Again
                }
            }
            CommandOutcome::Syntax | CommandOutcome::Unknown => self.command_failed(None),
        }
    }

    /// Count a bad command; past the budget the connection is dropped.
    fn command_failed(&mut self, message: Option<&str>) -> Pump {
        if self.cmd_tag.as_deref() == Some("") {
            self.cmd_tag = Some("*".to_string());
        }

        self.bad_counter += 1;
        if self.bad_counter > CLIENT_MAX_BAD_COMMANDS {
            self.send_line("* BYE Too many invalid IMAP commands.");
            self.handle.destroy(DisconnectReason::TooManyBadCommands);
            return Pump::Stop;
        }

        match message {
            Some(msg) => self.send_tagged(&format!("BAD {}", msg)),
            None => self.send_tagged("BAD Error in IMAP command received by server."),
        };

        if self.handle.is_destroyed() {
            Pump::Stop
        } else {
            Pump::Again
        }
    }

    async fn dispatch(&mut self, name: &str, args: Vec<Arg>) -> CommandOutcome {
        match name {
            "CAPABILITY" => self.cmd_capability(),
            "LOGIN" => self.cmd_login(args).await,
            "AUTHENTICATE" => self.cmd_authenticate(args).await,
            "STARTTLS" => self.cmd_starttls().await,
            "NOOP" => {
                self.send_tagged("OK NOOP completed.");
                CommandOutcome::Handled
            }
            "LOGOUT" => self.cmd_logout(),
            _ => CommandOutcome::Unknown,
        }
    }

    fn cmd_capability(&mut self) -> CommandOutcome {
        let capability = self.capability();
        self.send_line(&format!("* CAPABILITY {}", capability));
        self.send_tagged("OK Capability completed.");
        CommandOutcome::Handled
    }

    fn cmd_logout(&mut self) -> CommandOutcome {
        self.send_line("* BYE Logging out");
        self.send_tagged("OK Logout completed.");
        self.handle.destroy(DisconnectReason::AbortedLogin);
        CommandOutcome::Handled
    }

    async fn cmd_starttls(&mut self) -> CommandOutcome {
        if self.tls {
            self.send_tagged("BAD TLS is already active.");
            return CommandOutcome::Handled;
        }

        let Some(provider) = self.tls_provider.clone() else {
            self.send_tagged("BAD TLS support isn't enabled.");
            return CommandOutcome::Handled;
        };

        // everything queued so far must leave in plaintext before the
        // handshake starts
        self.send_tagged("OK Begin TLS negotiation now.");
        if !self.flush_output().await {
            return CommandOutcome::Handled;
        }

        let stream = std::mem::replace(&mut self.stream, ClientStream::Detached);
        let tcp = match stream {
            ClientStream::Plain(tcp) => tcp,
            other => {
                self.stream = other;
                self.send_line("* BYE TLS initialization failed.");
                let _ = self.flush_output().await;
                self.handle.destroy(DisconnectReason::TlsInitFailed);
                return CommandOutcome::Handled;
            }
        };

        match provider.acceptor().accept(tcp).await {
            Ok(tls_stream) => {
                self.stream = ClientStream::Tls(Box::new(tls_stream));
                self.tls = true;
                self.secured = true;
                self.handle.set_tls(true);

                // the parser does not survive the upgrade; any bytes the
                // client pipelined past STARTTLS are dropped
                self.inbuf.clear();
                self.parser.reset();
                self.skip_line = false;

                info!(peer = %self.handle.peer(), "TLS established");
                self.refresh_title();
                CommandOutcome::Handled
            }
            Err(e) => {
                warn!(peer = %self.handle.peer(), "TLS handshake failed: {}", e);
                self.handle.destroy(DisconnectReason::TlsInitFailed);
                CommandOutcome::Handled
            }
        }
    }

    /// Queue `line` + CRLF. Output is written out when the pump turn ends;
    /// overflowing the output buffer destroys the connection.
    pub(crate) fn send_line(&mut self, line: &str) -> bool {
        if self.handle.is_destroyed() {
            return false;
        }
        if self.outbuf.len() + line.len() + 2 > MAX_OUTBUF_SIZE {
            self.handle.destroy(DisconnectReason::TransmitBufferFull);
            return false;
        }
        self.outbuf.extend_from_slice(line.as_bytes());
        self.outbuf.extend_from_slice(b"\r\n");
        true
    }

    /// Queue a line prefixed with the current command tag.
    pub(crate) fn send_tagged(&mut self, line: &str) -> bool {
        let tag = self.cmd_tag.clone().unwrap_or_else(|| "*".to_string());
        self.send_line(&format!("{} {}", tag, line))
    }

    pub(crate) async fn flush_output(&mut self) -> bool {
        if self.outbuf.is_empty() {
            return !self.handle.is_destroyed();
        }
        let data = self.outbuf.split();
        match self.stream.write_all(&data).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Write error: {}", e);
                self.handle.destroy(DisconnectReason::Disconnected);
                false
            }
        }
    }

    /// Consume buffered input up to and including the next LF.
    fn skip_to_lf(&mut self) -> bool {
        match self.inbuf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.inbuf.advance(pos + 1);
                true
            }
            None => false,
        }
    }

    /// Read one raw line (for SASL responses, which are not IMAP-parsed).
    /// Over-long lines and transport failures destroy the connection.
    pub(crate) async fn read_raw_line(&mut self) -> Option<String> {
        let cancel = self.cancel.clone();
        loop {
            if let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
                let mut line = self.inbuf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                self.handle.touch_input();
                return Some(String::from_utf8_lossy(&line).into_owned());
            }

            let space = MAX_INBUF_SIZE - self.inbuf.len();
            if space == 0 {
                self.send_line("* BYE Input buffer full, aborting");
                self.handle.destroy(DisconnectReason::InputBufferFull);
                return None;
            }

            let mut chunk = [0u8; MAX_INBUF_SIZE];
            let read = tokio::select! {
                _ = cancel.cancelled() => return None,
                read = self.stream.read(&mut chunk[..space]) => read,
            };

            match read {
                Ok(0) => {
                    self.handle.destroy(DisconnectReason::Disconnected);
                    return None;
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!("Read error: {}", e);
                    self.handle.destroy(DisconnectReason::Disconnected);
                    return None;
                }
            }
        }
    }

    fn refresh_title(&self) {
        if !self.config.server.verbose_proctitle || !self.config.server.process_per_connection {
            return;
        }
        let ip = self.handle.peer().ip();
        let title = if self.tls {
            format!("[{} TLS]", ip)
        } else {
            format!("[{}]", ip)
        };
        debug!(%title, "Session title");
    }

    /// Terminal sequence: write anything still owed (including a deferred
    /// BYE), close the socket, log the reason once.
    async fn teardown(&mut self) {
        let reason = self.handle.reason();

        let detached = matches!(self.stream, ClientStream::Detached);
        if !detached {
            let mut data = self.outbuf.split();
            if let Some(bye) = reason.bye_line() {
                data.extend_from_slice(bye.as_bytes());
                data.extend_from_slice(b"\r\n");
            }
            if !data.is_empty() {
                let _ = self.stream.write_all(&data).await;
            }
            let _ = self.stream.shutdown().await;

            // lingering close
            let mut scratch = [0u8; 512];
            let _ = tokio::time::timeout(CLIENT_LINGER_TIMEOUT, async {
                loop {
                    match self.stream.read(&mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
        }

        if reason.should_log() {
            match &self.virtual_user {
                Some(user) => info!(peer = %self.handle.peer(), user = %user, "{}", reason),
                None => info!(peer = %self.handle.peer(), "{}", reason),
            }
        }
    }
}
