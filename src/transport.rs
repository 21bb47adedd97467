//! Transport socket: a line-oriented byte stream over plain or TLS TCP.
//!
//! The lifecycle is monotonic: `Connecting → Open → Closing → Closed`,
//! or `Connecting → Closed` directly when the connect fails. No state is
//! ever revisited, `send` only succeeds while `Open`, and every error
//! surfaces as a transition to `Closed` with an attached cause.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("invalid target {0:?}")]
    BadTarget(String),
    #[error("connect to {target} failed: {cause}")]
    Connect { target: String, cause: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Where to connect. The scheme selects TLS and the default port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub fn new(host: &str, port: u16, tls: bool) -> Self {
        Target {
            host: host.to_string(),
            port,
            tls,
        }
    }

    /// Parse a URL-like target: `ircs://host[:port]`, `irc://host[:port]`,
    /// or a bare `host[:port]` (plaintext). Defaults to 6697 for TLS and
    /// 6667 otherwise.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let (tls, rest) = if let Some(rest) = raw.strip_prefix("ircs://") {
            (true, rest)
        } else if let Some(rest) = raw.strip_prefix("irc://") {
            (false, rest)
        } else {
            (false, raw)
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| TransportError::BadTarget(raw.to_string()))?;
                (host, port)
            }
            None => (rest, if tls { 6697 } else { 6667 }),
        };
        if host.is_empty() {
            return Err(TransportError::BadTarget(raw.to_string()));
        }
        Ok(Target::new(host, port, tls))
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

trait Stream: tokio::io::AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Reads CRLF-terminated lines off the transport's receive half.
pub struct LineReader {
    inner: BufReader<ReadHalf<Box<dyn Stream>>>,
    buf: Vec<u8>,
}

impl LineReader {
    /// Next line with the terminator stripped; `None` on clean EOF.
    ///
    /// Safe to use inside `select!`: `read_until` appends partially-read
    /// bytes to `buf`, so a cancelled call resumes where it stopped.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// The owned send half plus the lifecycle state machine.
pub struct Transport {
    state: TransportState,
    writer: Option<WriteHalf<Box<dyn Stream>>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    /// A transport that has not yet connected.
    pub fn new() -> Self {
        Transport {
            state: TransportState::Connecting,
            writer: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Establish the stream. On success the transport is `Open` and the
    /// receive half is handed back; on failure the transport is `Closed`.
    pub async fn open(&mut self, target: &Target) -> Result<LineReader, TransportError> {
        if self.state != TransportState::Connecting {
            return Err(TransportError::NotConnected);
        }
        match establish(target).await {
            Ok(stream) => {
                let (read, write) = tokio::io::split(stream);
                self.writer = Some(write);
                self.state = TransportState::Open;
                Ok(LineReader {
                    inner: BufReader::new(read),
                    buf: Vec::new(),
                })
            }
            Err(e) => {
                self.state = TransportState::Closed;
                Err(e)
            }
        }
    }

    /// Send one line, appending the CRLF terminator if absent.
    pub async fn send(&mut self, line: &str) -> Result<(), TransportError> {
        if self.state != TransportState::Open {
            return Err(TransportError::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                writer.write_all(b"\r\n").await?;
            }
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            // A mid-stream write error is a close with a cause.
            self.state = TransportState::Closed;
            self.writer = None;
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Shut the transport down. Idempotent; the final state is always
    /// `Closed`.
    pub async fn close(&mut self) {
        match self.state {
            TransportState::Open => {
                self.state = TransportState::Closing;
                if let Some(mut writer) = self.writer.take() {
                    let _ = writer.shutdown().await;
                }
                self.state = TransportState::Closed;
            }
            TransportState::Connecting | TransportState::Closing => {
                self.writer = None;
                self.state = TransportState::Closed;
            }
            TransportState::Closed => {}
        }
    }
}

async fn establish(target: &Target) -> Result<Box<dyn Stream>, TransportError> {
    let addr = target.addr();
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|e| TransportError::Connect {
            target: addr.clone(),
            cause: e.to_string(),
        })?;
    if !target.tls {
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(Arc::new(tls_config()));
    let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
        .map_err(|_| TransportError::BadTarget(target.host.clone()))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Connect {
            target: addr,
            cause: format!("TLS handshake: {e}"),
        })?;
    Ok(Box::new(stream))
}

fn tls_config() -> rustls::ClientConfig {
    // rustls needs an explicit provider selection when several are linked.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
