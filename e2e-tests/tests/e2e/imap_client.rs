use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Plain-or-TLS client connection.
pub enum ClientConn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientConn::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientConn::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientConn::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientConn::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientConn::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ClientConn::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientConn::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientConn::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Certificate checks are pointless against the test server's self-signed
/// certificate.
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Minimal line-oriented IMAP test client.
pub struct ImapTestClient {
    conn: BufReader<ClientConn>,
}

impl ImapTestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            conn: BufReader::new(ClientConn::Plain(stream)),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.conn
            .get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.conn.get_mut().write_all(data).await.unwrap();
    }

    /// Read one line, CRLF stripped. `None` on EOF.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.conn.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_string()),
            Err(_) => None,
        }
    }

    pub async fn expect(&mut self, want: &str) {
        let line = self.read_line().await.expect("connection closed");
        assert_eq!(line, want);
    }

    pub async fn expect_prefix(&mut self, prefix: &str) -> String {
        let line = self.read_line().await.expect("connection closed");
        assert!(
            line.starts_with(prefix),
            "expected line starting with {:?}, got {:?}",
            prefix,
            line
        );
        line
    }

    pub async fn expect_eof(&mut self) {
        assert_eq!(self.read_line().await, None, "expected EOF");
    }

    /// Run the client side of the TLS handshake. The caller has already
    /// sent STARTTLS and read the `OK Begin TLS negotiation now.` line.
    pub async fn upgrade_tls(self) -> Self {
        let conn = self.conn.into_inner();
        let tcp = match conn {
            ClientConn::Plain(tcp) => tcp,
            ClientConn::Tls(_) => panic!("already TLS"),
        };

        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCert));

        let connector = TlsConnector::from(Arc::new(config));
        let domain = rustls::ServerName::try_from("test.local").unwrap();
        let tls = connector.connect(domain, tcp).await.unwrap();

        Self {
            conn: BufReader::new(ClientConn::Tls(Box::new(tls))),
        }
    }
}
