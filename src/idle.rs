//! IMAP IDLE state machine
//!
//! Runs one mailbox's IDLE loop until the session is marked terminating or
//! an unrecoverable protocol error occurs: `SELECT` read-only, arm a
//! `T_REFRESH` socket timeout, `IDLE`, wait for the continuation, wait for
//! `EXISTS` or timeout, `DONE`, drain to the tagged completion, fire the
//! callback, repeat (spec.md §4.3).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::errors::{MailwatchError, MailwatchResult};
use crate::imap::ImapSession;

/// Below typical IMAP 30-minute idle disconnect cutoffs.
pub const T_REFRESH: Duration = Duration::from_secs(29 * 60);

/// Run the IDLE loop for `mailbox` on `session`, calling `on_exists` once
/// per IDLE iteration that observed at least one `EXISTS`. Returns `Ok(())`
/// both on a clean cooperative stop and (degenerate case) if the loop was
/// never entered because the session was already terminating.
pub fn watch(
    session: &Arc<ImapSession>,
    mailbox: &str,
    mut on_exists: impl FnMut(),
) -> MailwatchResult<()> {
    if !session.has_capability("IDLE") {
        return Err(MailwatchError::protocol("IDLE is not supported by server"));
    }

    match run(session, mailbox, T_REFRESH, &mut on_exists) {
        Ok(()) => Ok(()),
        Err(e) => {
            if session.terminating.load(Ordering::SeqCst) {
                debug!(mailbox, "IDLE stopped cooperatively");
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

fn run(
    session: &Arc<ImapSession>,
    mailbox: &str,
    refresh: Duration,
    on_exists: &mut impl FnMut(),
) -> MailwatchResult<()> {
    session.select(mailbox, true)?;

    loop {
        session.set_socket_timeout(Some(refresh))?;

        let tag = session.new_tag();
        session.send_line(&format!("{tag} IDLE"))?;
        session.idling.store(true, Ordering::SeqCst);

        // Step 4: wait for the '+' continuation. A stray EXISTS may arrive
        // on the way and is remembered so step 5 can be skipped.
        let mut fired = false;
        loop {
            let line = session.recv_line()?;
            if line.tag == "+" {
                break;
            }
            if line.tag == tag {
                // Rejected before any continuation was granted.
                return Err(MailwatchError::protocol("idle is not allowed"));
            }
            if line.tag != "*" {
                return Err(MailwatchError::protocol(format!(
                    "unexpected response waiting for IDLE continuation: {} {} {}",
                    line.tag, line.verb, line.rest
                )));
            }
            if line.verb.eq_ignore_ascii_case("NO") || line.verb.eq_ignore_ascii_case("BAD") {
                return Err(MailwatchError::protocol("idle is not allowed"));
            }
            if line.verb.parse::<u64>().is_ok() && line.rest.eq_ignore_ascii_case("EXISTS") {
                fired = true;
            }
        }

        // Step 5: wait for EXISTS or a refresh timeout, unless already fired.
        if !fired {
            loop {
                match session.recv_line() {
                    Ok(line) => {
                        if line.verb.parse::<u64>().is_ok()
                            && line.rest.eq_ignore_ascii_case("EXISTS")
                        {
                            fired = true;
                            break;
                        }
                        trace!(tag = %line.tag, verb = %line.verb, "idle: absorbed untagged line");
                    }
                    Err(MailwatchError::Network(_)) => {
                        // Socket timeout: re-arm without firing.
                        if session.is_tls() {
                            session.reset_transport_after_timeout();
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        session.send_line("DONE")?;
        session.idling.store(false, Ordering::SeqCst);

        // Step 7: drain until the outstanding tag completes.
        loop {
            let line = session.recv_line()?;
            if line.tag == tag {
                if line.verb.eq_ignore_ascii_case("OK") {
                    break;
                }
                return Err(MailwatchError::protocol(format!(
                    "idle failed: {} {} {}",
                    line.tag, line.verb, line.rest
                )));
            }
        }

        if fired {
            on_exists();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnKey;
    use std::collections::HashSet;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn mock_session() -> (Arc<ImapSession>, std::net::TcpStream) {
        let (client, server) = crate::net::loopback_pair();
        let mut caps = HashSet::new();
        caps.insert("IDLE".to_owned());
        let key = ConnKey {
            host: "127.0.0.1".to_owned(),
            port: 0,
            user: "test".to_owned(),
        };
        let session = Arc::new(ImapSession::for_test(client, key, caps));
        (session, server)
    }

    /// An `EXISTS` observed before `DONE` fires the callback exactly once;
    /// the callback then marks the session terminating, and the next loop
    /// iteration's `send_line` sees the flag and stops cleanly — covering
    /// both the fire law and cooperative stop in one round trip.
    #[test]
    fn exists_before_done_fires_once_then_stops_cooperatively() {
        let (session, mut server) = mock_session();

        let server_thread = thread::spawn(move || {
            let mut reader = BufReader::new(server.try_clone().unwrap());
            let mut line = String::new();

            reader.read_line(&mut line).unwrap(); // EXAMINE "INBOX"
            let tag = line.split_whitespace().next().unwrap().to_owned();
            write!(server, "{tag} OK [READ-ONLY] EXAMINE completed\r\n").unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap(); // IDLE
            let idle_tag = line.split_whitespace().next().unwrap().to_owned();
            write!(server, "+ idling\r\n").unwrap();
            write!(server, "* 1 EXISTS\r\n").unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim(), "DONE");
            write!(server, "{idle_tag} OK IDLE terminated\r\n").unwrap();
        });

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let session_clone = session.clone();
        let result = watch(&session, "INBOX", move || {
            fired_clone.store(true, Ordering::SeqCst);
            session_clone.terminating.store(true, Ordering::SeqCst);
        });

        server_thread.join().unwrap();
        assert!(result.is_ok());
        assert!(fired.load(Ordering::SeqCst));
    }

    /// A refresh timeout with no `EXISTS` re-arms IDLE without firing.
    #[test]
    fn timeout_without_exists_rearms_without_firing() {
        let (session, mut server) = mock_session();

        let server_thread = thread::spawn(move || {
            let mut reader = BufReader::new(server.try_clone().unwrap());
            let mut line = String::new();

            reader.read_line(&mut line).unwrap(); // EXAMINE "INBOX"
            let tag = line.split_whitespace().next().unwrap().to_owned();
            write!(server, "{tag} OK [READ-ONLY] EXAMINE completed\r\n").unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap(); // IDLE
            let idle_tag = line.split_whitespace().next().unwrap().to_owned();
            write!(server, "+ idling\r\n").unwrap();
            // Say nothing further: the client's read times out and sends
            // DONE on its own.

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim(), "DONE");
            write!(server, "{idle_tag} OK IDLE terminated\r\n").unwrap();
            // Dropping `server` here closes the connection, so the next
            // loop iteration fails fast instead of waiting out a second
            // refresh interval.
        });

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let result = run(&session, "INBOX", Duration::from_millis(200), &mut || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        server_thread.join().unwrap();
        assert!(result.is_err());
        assert!(!fired.load(Ordering::SeqCst));
    }
}
