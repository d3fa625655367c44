//! Store, Channel and mailbox-selection data model
//!
//! Populated once at startup from the parsed config, mutated only during
//! the enumeration step, then treated as read-only for the rest of the
//! process lifetime.

use std::collections::HashMap;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::errors::{MailwatchError, MailwatchResult};
use crate::password::PasswordSource;

/// TLS mode for an IMAP store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Open TLS immediately on connect.
    Imaps,
    /// Connect in plaintext, then upgrade via the `STARTTLS` command.
    StartTls,
}

/// Connection parameters and enumerated state for a remote IMAP account.
#[derive(Debug, Clone)]
pub struct ImapStore {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// How to obtain the password: literal, `passcmd`, or interactive prompt.
    pub pass_source: PasswordSource,
    /// Resolved by `password::resolve_store_passwords`, which runs only over
    /// the stores a selected channel actually references — an unrelated,
    /// unselected account is never prompted for a password it doesn't need.
    pub pass: Option<SecretString>,
    pub tls_mode: TlsMode,
    /// Path prefix stripped from/prepended to mailbox names; defaults to the
    /// server's namespace prefix once populated.
    pub path_prefix: String,
    /// Overrides the server-reported hierarchy delimiter when set in config.
    pub path_delimiter_override: Option<char>,
    /// Filled in by `resolver::enumerate_stores`.
    pub delimiter: Option<char>,
    /// Filled in by `resolver::enumerate_stores`: post-prefix-stripped names.
    pub mailboxes: Vec<String>,
}

impl ImapStore {
    /// The resolved password, or an internal error if this store is used
    /// before `password::resolve_store_passwords` has run over it.
    pub fn password(&self) -> MailwatchResult<&SecretString> {
        self.pass.as_ref().ok_or_else(|| {
            MailwatchError::Internal(format!(
                "store '{}': password was never resolved",
                self.name
            ))
        })
    }
}

/// Filesystem root and enumerated state for a local Maildir store.
#[derive(Debug, Clone)]
pub struct MaildirStore {
    pub name: String,
    pub path: PathBuf,
    /// Distinguished path that maps to the logical name `INBOX`.
    pub inbox: Option<PathBuf>,
    /// Delimiter used to flatten nested Maildir names; default `/`.
    pub flatten: char,
    /// Filled in by `resolver::enumerate_stores`.
    pub mailboxes: Vec<String>,
}

/// Either side of a channel: a remote IMAP account or a local Maildir root.
#[derive(Debug, Clone)]
pub enum Store {
    Imap(ImapStore),
    Maildir(MaildirStore),
}

impl Store {
    pub fn name(&self) -> &str {
        match self {
            Store::Imap(s) => &s.name,
            Store::Maildir(s) => &s.name,
        }
    }

    pub fn delimiter(&self) -> char {
        match self {
            Store::Imap(s) => s.delimiter.expect("store not yet populated"),
            Store::Maildir(s) => s.flatten,
        }
    }

    pub fn mailboxes(&self) -> &[String] {
        match self {
            Store::Imap(s) => &s.mailboxes,
            Store::Maildir(s) => &s.mailboxes,
        }
    }

    pub fn is_imap(&self) -> bool {
        matches!(self, Store::Imap(_))
    }
}

/// A compiled mailbox glob pattern: `*` matches any run, `%` matches a run
/// without the delimiter, and a leading `!` negates the match.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub negated: bool,
    pub regex: regex::Regex,
    pub source: String,
}

/// How a channel selects the mailboxes it synchronizes.
#[derive(Debug, Clone)]
pub enum Selection {
    /// `boxes = [...]`: an explicit list of logical mailbox names.
    Explicit(Vec<String>),
    /// `patterns P1 P2 ...`: globs evaluated in reverse declaration order.
    Patterns(Vec<CompiledPattern>),
    /// Neither: the single box named by the prefix, or `INBOX` if empty.
    None,
}

/// A named master/slave pair of endpoints plus a selection clause.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub master_store: String,
    pub master_box_prefix: String,
    pub slave_store: String,
    pub slave_box_prefix: String,
    pub selection: Selection,
}

impl Channel {
    /// True when the selection clause is `patterns` — this is the only case
    /// in which `SyncTask` carries per-mailbox names rather than the whole
    /// channel (spec.md §4.6).
    pub fn is_patterns(&self) -> bool {
        matches!(self.selection, Selection::Patterns(_))
    }
}

/// An endpoint tuple: which store, which logical mailbox name, and its
/// concrete path (IMAP: the store-delimited name as passed to `SELECT`;
/// Maildir: the filesystem path of the mailbox directory).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub store: String,
    pub mailbox: String,
    pub path: String,
}

/// The bidirectional sync map: every endpoint maps to its partner endpoint
/// plus the channel name that produced the pairing.
#[derive(Debug, Clone, Default)]
pub struct SyncMap {
    pub entries: HashMap<Endpoint, (Endpoint, String)>,
}

impl SyncMap {
    pub fn partner(&self, ep: &Endpoint) -> Option<&(Endpoint, String)> {
        self.entries.get(ep)
    }

    pub fn channel_of(&self, ep: &Endpoint) -> Option<&str> {
        self.entries.get(ep).map(|(_, ch)| ch.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Endpoint, &(Endpoint, String))> {
        self.entries.iter()
    }
}

/// Connection pool key: an IMAP session is long-lived and shared by
/// `(host, port, user)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}
