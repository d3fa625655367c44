//! IMAP client bindings
//!
//! A minimal framed line client implementing just enough of RFC 3501 to
//! support connection setup, mailbox enumeration, `IDLE`, and cooperative
//! shutdown. Deliberately does not parse FETCH responses: this crate never
//! fetches message bodies.

use std::collections::HashSet;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::trace;

use crate::errors::{MailwatchError, MailwatchResult};
use crate::model::{ConnKey, TlsMode};
use crate::net::{self, Transport};

/// A parsed server line: tag (`*`, `+`, or a response tag), verb/status,
/// and trailing text. Fewer than two whitespace-separated fields is a
/// protocol abort (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct ServerLine {
    pub tag: String,
    pub verb: String,
    pub rest: String,
}

/// A long-lived IMAP session: TCP/TLS transport plus IDLE bookkeeping.
///
/// Exclusively owned by one watcher thread while held `busy` by the
/// connection pool. `terminating` is the only field another thread (the
/// pool, during `close`) is allowed to touch concurrently.
pub struct ImapSession {
    pub key: ConnKey,
    transport: Mutex<Transport>,
    /// Raw socket clone, independent of the transport's buffering, used
    /// purely to force a read timeout / shutdown from another thread.
    raw: TcpStream,
    capabilities: Mutex<HashSet<String>>,
    tag_counter: AtomicU32,
    pub idling: AtomicBool,
    pub terminating: AtomicBool,
}

impl ImapSession {
    /// Connect, read the greeting, optionally STARTTLS, fetch capabilities.
    /// `user` is recorded on the session's pool key up front — `login` only
    /// sends the command, it never mutates the session.
    pub fn connect(host: &str, port: u16, user: &str, tls_mode: TlsMode) -> MailwatchResult<Self> {
        let mut transport = net::dial(host, port, tls_mode)?;
        let raw = net::raw_handle(&transport).map_err(MailwatchError::from)?;

        let greeting = transport.read_line()?;
        let greeting = parse_line(&greeting)?;
        if greeting.verb.eq_ignore_ascii_case("BYE") {
            return Err(MailwatchError::protocol(format!(
                "server refused connection: {}",
                greeting.rest
            )));
        }

        if tls_mode == TlsMode::StartTls {
            let caps = plaintext_capabilities(&mut transport)?;
            if !caps.contains("STARTTLS") {
                return Err(MailwatchError::protocol(
                    "STARTTLS requested but not advertised by server",
                ));
            }
            transport = upgrade_starttls(transport, host)?;
        }

        let session = ImapSession {
            key: ConnKey {
                host: host.to_owned(),
                port,
                user: user.to_owned(),
            },
            transport: Mutex::new(transport),
            raw,
            capabilities: Mutex::new(HashSet::new()),
            tag_counter: AtomicU32::new(0),
            idling: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
        };

        session.refresh_capabilities()?;
        Ok(session)
    }

    pub fn login(&self, password: &SecretString) -> MailwatchResult<()> {
        let tag = self.new_tag();
        // send_line itself redacts everything after " LOGIN " before tracing.
        self.send_line(&format!(
            "{tag} LOGIN {} {}",
            quote(&self.key.user),
            quote(password.expose_secret())
        ))?;
        self.expect_tagged_ok(&tag, "LOGIN").map_err(|e| match e {
            MailwatchError::Protocol { message, .. } => {
                MailwatchError::Credential(format!("authentication failed: {message}"))
            }
            other => other,
        })
    }

    pub fn capability(&self) -> MailwatchResult<HashSet<String>> {
        self.refresh_capabilities()?;
        Ok(self.capabilities.lock().unwrap().clone())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.lock().unwrap().contains(name)
    }

    fn refresh_capabilities(&self) -> MailwatchResult<()> {
        let tag = self.new_tag();
        self.send_line(&format!("{tag} CAPABILITY"))?;
        let mut caps = HashSet::new();
        loop {
            let line = self.recv_line()?;
            if line.tag == "*" && line.verb.eq_ignore_ascii_case("CAPABILITY") {
                caps.extend(line.rest.split_whitespace().map(|s| s.to_uppercase()));
            } else if line.tag == tag {
                if !line.verb.eq_ignore_ascii_case("OK") {
                    return Err(MailwatchError::protocol(format!(
                        "CAPABILITY failed: {} {}",
                        line.verb, line.rest
                    )));
                }
                break;
            }
        }
        *self.capabilities.lock().unwrap() = caps;
        Ok(())
    }

    /// Raw `LIST ""  "*"` — returns each untagged `* LIST ...` line's
    /// trailing text, unparsed (the resolver parses the grammar).
    pub fn list(&self) -> MailwatchResult<Vec<String>> {
        let tag = self.new_tag();
        self.send_line(&format!("{tag} LIST \"\" \"*\""))?;
        let mut lines = Vec::new();
        loop {
            let line = self.recv_line()?;
            if line.tag == "*" && line.verb.eq_ignore_ascii_case("LIST") {
                lines.push(line.rest);
            } else if line.tag == tag {
                if !line.verb.eq_ignore_ascii_case("OK") {
                    return Err(MailwatchError::protocol(format!(
                        "LIST failed: {} {}",
                        line.verb, line.rest
                    )));
                }
                break;
            }
        }
        Ok(lines)
    }

    /// Raw `NAMESPACE` — returns the first untagged `* NAMESPACE ...` line's
    /// trailing text, unparsed, or `None` if the server doesn't support it.
    pub fn namespace(&self) -> MailwatchResult<Option<String>> {
        if !self.has_capability("NAMESPACE") {
            return Ok(None);
        }
        let tag = self.new_tag();
        self.send_line(&format!("{tag} NAMESPACE"))?;
        let mut result = None;
        loop {
            let line = self.recv_line()?;
            if line.tag == "*" && line.verb.eq_ignore_ascii_case("NAMESPACE") {
                result = Some(line.rest);
            } else if line.tag == tag {
                if !line.verb.eq_ignore_ascii_case("OK") {
                    return Err(MailwatchError::protocol(format!(
                        "NAMESPACE failed: {} {}",
                        line.verb, line.rest
                    )));
                }
                break;
            }
        }
        Ok(result)
    }

    /// `SELECT`/`EXAMINE` a mailbox. `readonly` picks `EXAMINE`.
    pub fn select(&self, mailbox: &str, readonly: bool) -> MailwatchResult<()> {
        let verb = if readonly { "EXAMINE" } else { "SELECT" };
        let tag = self.new_tag();
        self.send_line(&format!("{tag} {verb} {}", quote(mailbox)))?;
        loop {
            let line = self.recv_line()?;
            if line.tag == tag {
                if line.verb.eq_ignore_ascii_case("OK") {
                    return Ok(());
                }
                return Err(MailwatchError::protocol(format!(
                    "{verb} failed: {} {}",
                    line.verb, line.rest
                )));
            }
            // untagged FLAGS/EXISTS/RECENT/OK responses are ignored here
        }
    }

    pub fn logout(&self) -> MailwatchResult<()> {
        let tag = self.new_tag();
        self.send_line(&format!("{tag} LOGOUT"))?;
        // No response read: close() races shutdown with an in-flight reader.
        Ok(())
    }

    /// Idempotent best-effort shutdown used by the connection pool. Errors
    /// are logged by the caller and always swallowed here.
    pub fn shutdown_socket(&self) {
        let _ = self.raw.shutdown(std::net::Shutdown::Both);
    }

    pub fn set_socket_timeout(&self, timeout: Option<Duration>) -> MailwatchResult<()> {
        net::set_read_timeout(&self.raw, timeout).map_err(MailwatchError::from)
    }

    pub fn new_tag(&self) -> String {
        let n = self.tag_counter.fetch_add(1, Ordering::SeqCst);
        format!("A{n:04}")
    }

    /// Send one line, checking `terminating` first (cooperative stop).
    pub fn send_line(&self, line: &str) -> MailwatchResult<()> {
        if self.terminating.load(Ordering::SeqCst) {
            return Err(terminated_error());
        }
        trace!(line = %redact_for_trace(line), "send_line");
        self.transport.lock().unwrap().write_line(line)
    }

    /// Receive and parse one line, checking `terminating` first.
    pub fn recv_line(&self) -> MailwatchResult<ServerLine> {
        if self.terminating.load(Ordering::SeqCst) {
            return Err(terminated_error());
        }
        let raw = self.transport.lock().unwrap().read_line()?;
        trace!(line = %redact_for_trace(&raw), "recv_line");
        parse_line(&raw)
    }

    /// Recreate the buffered reader around the same socket. Required after
    /// a read timeout on a TLS transport (spec.md §4.3's "Timeout note").
    pub fn reset_transport_after_timeout(&self) {
        let mut guard = self.transport.lock().unwrap();
        let taken = std::mem::replace(&mut *guard, Transport::Closed);
        *guard = taken.reset_after_timeout();
    }

    pub fn is_tls(&self) -> bool {
        self.transport.lock().unwrap().is_tls()
    }

    fn expect_tagged_ok(&self, tag: &str, what: &str) -> MailwatchResult<()> {
        loop {
            let line = self.recv_line()?;
            if line.tag == tag {
                if line.verb.eq_ignore_ascii_case("OK") {
                    return Ok(());
                }
                return Err(MailwatchError::protocol(format!(
                    "{what} failed: {} {}",
                    line.verb, line.rest
                )));
            }
        }
    }
}

/// Fetch capabilities over a still-plaintext transport, before any session
/// object exists to own them. Used only to decide whether `STARTTLS` is
/// safe to send (spec.md §4.1).
fn plaintext_capabilities(transport: &mut Transport) -> MailwatchResult<HashSet<String>> {
    let tag = "A0000";
    transport.write_line(&format!("{tag} CAPABILITY"))?;
    let mut caps = HashSet::new();
    loop {
        let line = parse_line(&transport.read_line()?)?;
        if line.tag == "*" && line.verb.eq_ignore_ascii_case("CAPABILITY") {
            caps.extend(line.rest.split_whitespace().map(|s| s.to_uppercase()));
        } else if line.tag == tag {
            if !line.verb.eq_ignore_ascii_case("OK") {
                return Err(MailwatchError::protocol(format!(
                    "CAPABILITY failed: {} {}",
                    line.verb, line.rest
                )));
            }
            break;
        }
    }
    Ok(caps)
}

fn upgrade_starttls(mut transport: Transport, host: &str) -> MailwatchResult<Transport> {
    let tag_line = |n: u32| format!("A{n:04}");
    let tag = tag_line(0);
    transport.write_line(&format!("{tag} STARTTLS"))?;
    loop {
        let line = parse_line(&transport.read_line()?)?;
        if line.tag == tag {
            if !line.verb.eq_ignore_ascii_case("OK") {
                return Err(MailwatchError::protocol(format!(
                    "STARTTLS failed: {} {}",
                    line.verb, line.rest
                )));
            }
            break;
        }
    }
    transport.upgrade_to_tls(host)
}

/// `Internal` rather than a dedicated variant: this is control flow for
/// `supervisor::watch_errors`, which checks `session.terminating` directly
/// rather than matching on the error kind.
fn terminated_error() -> MailwatchError {
    MailwatchError::Internal("session terminating".to_owned())
}

/// Truncate a traced line after the literal ` LOGIN ` marker, dropping the
/// user/password fields that follow it.
fn redact_for_trace(line: &str) -> std::borrow::Cow<'_, str> {
    match line.find(" LOGIN ") {
        Some(idx) => {
            let marker_end = idx + " LOGIN ".len();
            std::borrow::Cow::Owned(format!("{}<redacted>", &line[..marker_end]))
        }
        None => std::borrow::Cow::Borrowed(line),
    }
}

fn parse_line(line: &str) -> MailwatchResult<ServerLine> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let tag = parts.next().unwrap_or("").to_owned();
    let verb = parts
        .next()
        .ok_or_else(|| MailwatchError::protocol(format!("unexpected response: {line}")))?
        .to_owned();
    let rest = parts.next().unwrap_or("").to_owned();
    Ok(ServerLine { tag, verb, rest })
}

/// Quote a string for use as an IMAP quoted string, matching what
/// `mbsync`/upstream `mbwatch` send for simple ASCII mailbox names, users
/// and passwords (no embedded literals needed in practice).
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Test-only constructor that skips `connect`'s greeting/capability/TLS
/// negotiation against a real server, used by pool/idle tests that only
/// need a session wired to a loopback socket with known capabilities.
#[cfg(test)]
impl ImapSession {
    pub(crate) fn for_test(stream: TcpStream, key: ConnKey, capabilities: HashSet<String>) -> Self {
        let raw = stream.try_clone().expect("clone test socket");
        ImapSession {
            key,
            transport: Mutex::new(Transport::plain_for_test(stream)),
            raw,
            capabilities: Mutex::new(capabilities),
            tag_counter: AtomicU32::new(0),
            idling: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_splits_tag_verb_rest() {
        let line = parse_line("* 1 EXISTS").unwrap();
        assert_eq!(line.tag, "*");
        assert_eq!(line.verb, "1");
        assert_eq!(line.rest, "EXISTS");
    }

    #[test]
    fn parse_line_requires_at_least_two_fields() {
        assert!(parse_line("justonefield").is_err());
    }

    #[test]
    fn quote_escapes_backslash_and_quote() {
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn redact_for_trace_truncates_after_login_marker() {
        let line = "A0001 LOGIN alice \"hunter2\"";
        assert_eq!(redact_for_trace(line), "A0001 LOGIN <redacted>");
    }

    #[test]
    fn redact_for_trace_passes_through_lines_without_login() {
        let line = "A0002 SELECT \"INBOX\"";
        assert_eq!(redact_for_trace(line), line);
    }

    #[test]
    fn plaintext_capabilities_parses_untagged_lines() {
        let (mut client, mut server) = crate::net::loopback_pair();
        let server_thread = std::thread::spawn(move || {
            use std::io::{BufRead, BufReader, Write};
            let mut reader = BufReader::new(server.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            write!(server, "* CAPABILITY IMAP4rev1 IDLE STARTTLS\r\n").unwrap();
            write!(server, "A0000 OK CAPABILITY completed\r\n").unwrap();
        });

        let mut transport = Transport::plain_for_test(client.try_clone().unwrap());
        let caps = plaintext_capabilities(&mut transport).unwrap();
        server_thread.join().unwrap();
        let _ = client.shutdown(std::net::Shutdown::Both);

        assert!(caps.contains("STARTTLS"));
        assert!(caps.contains("IDLE"));
    }
}
