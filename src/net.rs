//! Framed line I/O over a plaintext or TLS-wrapped blocking TCP socket
//!
//! `Transport` is the single read/write path for one IMAP session: a
//! `BufReader` for line-oriented reads plus direct writes to the underlying
//! stream. TLS upgrade (`STARTTLS`) replaces the transport in place.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};

use crate::errors::{MailwatchError, MailwatchResult};
use crate::model::TlsMode;

/// A line-buffered read/write wrapper around a socket.
struct Framed<S: Read + Write> {
    reader: BufReader<S>,
}

impl<S: Read + Write> Framed<S> {
    fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut out = String::with_capacity(line.len() + 2);
        out.push_str(line);
        out.push_str("\r\n");
        self.reader.get_mut().write_all(out.as_bytes())
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Rebuild the buffered reader around the same underlying stream,
    /// discarding any partially-buffered (always empty, here) state. Needed
    /// after a socket timeout on a TLS stream: the buffered reader is not
    /// safe to keep reading from once a read has timed out.
    fn reset(self) -> Self {
        Self::new(self.reader.into_inner())
    }
}

/// Either a plaintext or TLS-wrapped transport for one IMAP session.
pub enum Transport {
    Plain(Framed<TcpStream>),
    Tls(Framed<TlsStream<TcpStream>>),
    /// Transient placeholder used only for the instant of an in-place swap
    /// (STARTTLS upgrade, post-timeout reader reset). Never observed by a
    /// caller; reading or writing it is a logic error, reported as an error
    /// rather than a panic.
    Closed,
}

impl Transport {
    pub fn write_line(&mut self, line: &str) -> MailwatchResult<()> {
        let result = match self {
            Transport::Plain(f) => f.write_line(line),
            Transport::Tls(f) => f.write_line(line),
            Transport::Closed => {
                return Err(MailwatchError::Internal(
                    "write on closed transport".to_owned(),
                ));
            }
        };
        result.map_err(MailwatchError::from)
    }

    pub fn read_line(&mut self) -> MailwatchResult<String> {
        let result = match self {
            Transport::Plain(f) => f.read_line(),
            Transport::Tls(f) => f.read_line(),
            Transport::Closed => {
                return Err(MailwatchError::Internal(
                    "read on closed transport".to_owned(),
                ));
            }
        };
        result.map_err(MailwatchError::from)
    }

    pub fn reset_after_timeout(self) -> Self {
        match self {
            Transport::Plain(f) => Transport::Plain(f.reset()),
            Transport::Tls(f) => Transport::Tls(f.reset()),
            Transport::Closed => Transport::Closed,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Upgrade a plaintext transport in place via `STARTTLS`. Fails if the
    /// transport is already TLS-wrapped.
    pub fn upgrade_to_tls(self, host: &str) -> MailwatchResult<Self> {
        match self {
            Transport::Plain(framed) => {
                let tcp = framed.reader.into_inner();
                let connector = build_tls_connector()?;
                let tls = connector.connect(host, tcp).map_err(|e| {
                    MailwatchError::Network(format!("TLS handshake failed: {e}"))
                })?;
                Ok(Transport::Tls(Framed::new(tls)))
            }
            Transport::Tls(_) => Err(MailwatchError::protocol(
                "STARTTLS on an already-wrapped socket",
            )),
            Transport::Closed => Err(MailwatchError::Internal(
                "STARTTLS on closed transport".to_owned(),
            )),
        }
    }
}

fn build_tls_connector() -> MailwatchResult<TlsConnector> {
    TlsConnector::new().map_err(MailwatchError::from)
}

/// Open a TCP connection and, for `TlsMode::Imaps`, wrap it in TLS
/// immediately. `STARTTLS` mode returns a plaintext transport; the caller
/// upgrades it after checking the `STARTTLS` capability.
pub fn dial(host: &str, port: u16, tls_mode: TlsMode) -> MailwatchResult<Transport> {
    let tcp = TcpStream::connect((host, port))
        .map_err(|e| MailwatchError::Network(format!("connect to {host}:{port} failed: {e}")))?;
    tcp.set_nodelay(true).ok();
    match tls_mode {
        TlsMode::Imaps => {
            let connector = build_tls_connector()?;
            let tls = connector
                .connect(host, tcp)
                .map_err(|e| MailwatchError::Network(format!("TLS handshake failed: {e}")))?;
            Ok(Transport::Tls(Framed::new(tls)))
        }
        TlsMode::StartTls => Ok(Transport::Plain(Framed::new(tcp))),
    }
}

/// Returns a handle to the raw socket for out-of-band timeout/shutdown
/// control, independent of whatever buffered wrapper currently owns it.
pub fn raw_handle(transport: &Transport) -> io::Result<TcpStream> {
    match transport {
        Transport::Plain(f) => f.reader.get_ref().try_clone(),
        Transport::Tls(f) => f.reader.get_ref().get_ref().try_clone(),
        Transport::Closed => Err(io::Error::other("no socket for closed transport")),
    }
}

pub fn set_read_timeout(socket: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    socket.set_read_timeout(timeout)
}

#[cfg(test)]
impl Transport {
    /// Wrap an already-connected plaintext socket directly, bypassing
    /// `dial`. Used by pool/idle/imap tests that drive a session against a
    /// loopback socket instead of a live IMAP server.
    pub(crate) fn plain_for_test(stream: TcpStream) -> Self {
        Transport::Plain(Framed::new(stream))
    }
}

/// A connected loopback `TcpStream` pair, for tests that need two live ends
/// of a real socket without a live IMAP server.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (TcpStream, TcpStream) {
    use std::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("loopback listener has a local addr");
    let client = TcpStream::connect(addr).expect("connect to loopback listener");
    let (server, _) = listener.accept().expect("accept loopback connection");
    (client, server)
}
