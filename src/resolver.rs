//! Channel/store resolver
//!
//! Populates stores with their enumerated mailboxes and delimiter, then
//! builds the bidirectional sync map over concrete mailbox names
//! (spec.md §4.4).

use std::collections::HashMap;

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{MailwatchError, MailwatchResult};
use crate::model::{
    Channel, CompiledPattern, Endpoint, ImapStore, MaildirStore, Selection, Store, SyncMap,
};
use crate::pool::ConnectionPool;

/// `(<attrs>) "<delim>" "<name>"`, trailing name optionally unquoted.
fn list_line_re() -> Regex {
    Regex::new(r#"^\((?P<attrs>[^)]*)\)\s+"(?P<delim>[^"]*)"\s+"?(?P<name>.+?)"?$"#).unwrap()
}

/// `NIL` or `(("<prefix>" (NIL|"<delim>")) ...)`.
fn namespace_re() -> Regex {
    Regex::new(r#"^\(\("(?P<prefix>[^"]*)"\s+(NIL|"(?P<delim>.)")\)"#).unwrap()
}

/// Populate every store with `mailboxes[]` and `delimiter`.
pub fn enumerate_stores(stores: &mut HashMap<String, Store>, pool: &ConnectionPool) -> MailwatchResult<()> {
    for store in stores.values_mut() {
        match store {
            Store::Imap(imap_store) => enumerate_imap_store(imap_store, pool)?,
            Store::Maildir(maildir_store) => enumerate_maildir_store(maildir_store)?,
        }
    }
    Ok(())
}

fn enumerate_imap_store(store: &mut ImapStore, pool: &ConnectionPool) -> MailwatchResult<()> {
    let session = pool.get_or_create(
        &store.host,
        &store.user,
        store.password()?,
        store.port,
        store.tls_mode,
    )?;

    let mut prefix = store.path_prefix.clone();
    let mut delimiter = store.path_delimiter_override;

    if let Some(ns_line) = session.namespace()? {
        if let Some(caps) = namespace_re().captures(&ns_line) {
            let ns_prefix = caps.name("prefix").map(|m| m.as_str().to_owned());
            let ns_delim = caps.name("delim").and_then(|m| m.as_str().chars().next());
            if delimiter.is_none() {
                delimiter = store.path_delimiter_override.or(ns_delim);
            }
            if prefix.is_empty() {
                prefix = ns_prefix.unwrap_or_default();
            }
        }
    }

    let list_lines = session.list()?;
    let list_re = list_line_re();
    let mut mailboxes = Vec::new();
    for line in &list_lines {
        let caps = list_re
            .captures(line)
            .ok_or_else(|| MailwatchError::protocol(format!("unexpected LIST response: {line}")))?;
        let attrs = &caps["attrs"];
        if attrs.contains("\\Noselect") {
            continue;
        }
        if delimiter.is_none() {
            delimiter = caps.name("delim").and_then(|m| m.as_str().chars().next());
        }
        let name = &caps["name"];
        if let Some(stripped) = name.strip_prefix(&prefix) {
            mailboxes.push(stripped.to_owned());
        }
    }

    pool.release(&session);

    store.path_prefix = prefix;
    store.delimiter = Some(delimiter.unwrap_or('/'));
    store.mailboxes = mailboxes;
    debug!(store = %store.name, mailboxes = ?store.mailboxes, "enumerated IMAP store");
    Ok(())
}

fn enumerate_maildir_store(store: &mut MaildirStore) -> MailwatchResult<()> {
    let mut mailboxes = Vec::new();
    for entry in WalkDir::new(&store.path).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let has_new = entry.path().join("new").is_dir();
        if !has_new {
            continue;
        }
        let box_name = if Some(entry.path()) == store.inbox.as_deref() {
            "INBOX".to_owned()
        } else {
            entry
                .path()
                .strip_prefix(&store.path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/")
        };
        mailboxes.push(box_name);
    }
    store.mailboxes = mailboxes;
    debug!(store = %store.name, mailboxes = ?store.mailboxes, "enumerated Maildir store");
    Ok(())
}

/// Transform a mailbox pattern to a compiled regex: `*` -> any run, `%` ->
/// run without the delimiter, a leading `!` negates the match. Anchored to
/// the end only (matching upstream, which anchors just `$`).
pub fn compile_pattern(pattern: &str, delimiter: char) -> CompiledPattern {
    let negated = pattern.starts_with('!');
    let body = if negated { &pattern[1..] } else { pattern };
    let escaped = regex::escape(body);
    let escaped_delim = regex::escape(&delimiter.to_string());
    let translated = escaped
        .replace(r"\*", ".*")
        .replace(r"\%", &format!("[^{escaped_delim}]"));
    let source = format!("{translated}$");
    let regex = Regex::new(&source).expect("pattern compiles to a valid regex");
    CompiledPattern {
        negated,
        regex,
        source: pattern.to_owned(),
    }
}

/// Replace all `delim` with `/` and strip a leading `prefix`. `prefix` is
/// given in the store's native delimiter form (e.g. `INBOX.`), so it is
/// normalized the same way as `mailbox` before the comparison.
pub fn normalized_box(mailbox: &str, prefix: &str, delim: char) -> String {
    let slashed = mailbox.replace(delim, "/");
    let slashed_prefix = prefix.replace(delim, "/");
    slashed
        .strip_prefix(slashed_prefix.as_str())
        .map(str::to_owned)
        .unwrap_or(slashed)
}

/// Prepend `prefix` and replace all `/` with `delim`.
pub fn store_box(mailbox: &str, prefix: &str, delim: char) -> String {
    format!("{prefix}{mailbox}").replace('/', &delim.to_string())
}

/// Evaluate compiled patterns in *reverse* declaration order; the first
/// match (last pattern in source order) decides inclusion via its negation
/// flag. `None` means no pattern matched at all (excluded).
fn pattern_decision(patterns: &[CompiledPattern], candidate: &str) -> Option<bool> {
    for pat in patterns.iter().rev() {
        if pat.regex.is_match(candidate) {
            return Some(!pat.negated);
        }
    }
    None
}

/// Build the bidirectional sync map for all channels.
pub fn build_syncmap(
    channels: &[Channel],
    stores: &HashMap<String, Store>,
) -> MailwatchResult<SyncMap> {
    let mut map = SyncMap::default();

    for channel in channels {
        // logical box name -> up to two (store, mailbox, path) tuples
        let mut pairs: HashMap<String, Vec<Endpoint>> = HashMap::new();

        for (store_name, prefix) in [
            (&channel.master_store, &channel.master_box_prefix),
            (&channel.slave_store, &channel.slave_box_prefix),
        ] {
            let store = stores.get(store_name).ok_or_else(|| {
                MailwatchError::Config(format!("channel '{}': unknown store '{store_name}'", channel.name))
            })?;
            let delim = store.delimiter();

            match &channel.selection {
                Selection::Explicit(boxes) => {
                    for logical in boxes {
                        let sbox = store_box(logical, prefix, delim);
                        if !store.mailboxes().iter().any(|m| m == &sbox) {
                            return Err(MailwatchError::Config(format!(
                                "mailbox '{logical}' not found in store '{store_name}'"
                            )));
                        }
                        let path = endpoint_path(store, &sbox);
                        pairs.entry(logical.clone()).or_default().push(Endpoint {
                            store: store_name.clone(),
                            mailbox: logical.clone(),
                            path,
                        });
                    }
                }
                Selection::Patterns(patterns) => {
                    for sbox in store.mailboxes() {
                        let logical = normalized_box(sbox, prefix, delim);
                        if let Some(true) = pattern_decision(patterns, &logical) {
                            let path = endpoint_path(store, sbox);
                            pairs.entry(logical.clone()).or_default().push(Endpoint {
                                store: store_name.clone(),
                                mailbox: logical,
                                path,
                            });
                        }
                    }
                }
                Selection::None => {
                    let logical = if prefix.is_empty() { "INBOX".to_owned() } else { prefix.clone() };
                    let sbox = store_box(&logical, "", delim);
                    let path = endpoint_path(store, &sbox);
                    pairs.entry(String::new()).or_default().push(Endpoint {
                        store: store_name.clone(),
                        mailbox: logical,
                        path,
                    });
                }
            }
        }

        for (logical, endpoints) in pairs {
            if endpoints.len() != 2 {
                let who = endpoints
                    .first()
                    .map(|e| format!("{}:{}", e.store, e.mailbox))
                    .unwrap_or(logical);
                return Err(MailwatchError::Config(format!(
                    "no matching mailbox for '{who}' in channel '{}'",
                    channel.name
                )));
            }
            let mut it = endpoints.into_iter();
            let a = it.next().unwrap();
            let b = it.next().unwrap();
            map.entries.insert(a.clone(), (b.clone(), channel.name.clone()));
            map.entries.insert(b, (a, channel.name.clone()));
        }
    }

    Ok(map)
}

fn endpoint_path(store: &Store, store_box_name: &str) -> String {
    match store {
        Store::Imap(_) => store_box_name.to_owned(),
        Store::Maildir(m) => {
            if store_box_name == "INBOX" {
                m.inbox
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|| m.path.join("INBOX").to_string_lossy().into_owned())
            } else {
                m.path.join(store_box_name).to_string_lossy().into_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TlsMode;
    use crate::password::PasswordSource;
    use secrecy::SecretString;
    use std::path::PathBuf;

    fn imap_store(name: &str, prefix: &str, delim: char, mailboxes: &[&str]) -> Store {
        Store::Imap(ImapStore {
            name: name.to_owned(),
            host: "imap.example.com".to_owned(),
            port: 993,
            user: "alice".to_owned(),
            pass_source: PasswordSource::Literal("x".to_owned()),
            pass: Some(SecretString::from("x".to_owned())),
            tls_mode: TlsMode::Imaps,
            path_prefix: prefix.to_owned(),
            path_delimiter_override: None,
            delimiter: Some(delim),
            mailboxes: mailboxes.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn maildir_store(name: &str, mailboxes: &[&str]) -> Store {
        Store::Maildir(MaildirStore {
            name: name.to_owned(),
            path: PathBuf::from(format!("/tmp/{name}")),
            inbox: None,
            flatten: '/',
            mailboxes: mailboxes.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// spec.md §8 Scenario #1: patterns, negation, delimiter. Master prefix
    /// `INBOX.`, slave prefix `""`, patterns `* !*Trash*`; `Work.Trash` must
    /// be excluded while `Work` and `Personal` survive on both sides.
    #[test]
    fn build_syncmap_applies_patterns_with_negation_across_a_delimiter() {
        // "INBOX." itself (the bare hierarchy container) is never present
        // here: enumerate_stores would have already dropped it as \Noselect.
        let master = imap_store(
            "remote",
            "",
            '.',
            &["INBOX.Work", "INBOX.Work.Trash", "INBOX.Personal"],
        );
        let slave = maildir_store("local", &["Work", "Personal"]);

        let mut stores = HashMap::new();
        stores.insert("remote".to_owned(), master);
        stores.insert("local".to_owned(), slave);

        let patterns = vec![compile_pattern("*", '/'), compile_pattern("!*Trash*", '/')];
        let channel = Channel {
            name: "work".to_owned(),
            master_store: "remote".to_owned(),
            master_box_prefix: "INBOX.".to_owned(),
            slave_store: "local".to_owned(),
            slave_box_prefix: String::new(),
            selection: Selection::Patterns(patterns),
        };

        let syncmap = build_syncmap(&[channel], &stores).unwrap();

        let mut synced: Vec<&str> = syncmap
            .iter()
            .filter(|(ep, _)| ep.store == "remote")
            .map(|(ep, _)| ep.mailbox.as_str())
            .collect();
        synced.sort_unstable();
        assert_eq!(synced, vec!["Personal", "Work"]);

        for name in ["Personal", "Work"] {
            let master_ep = Endpoint {
                store: "remote".to_owned(),
                mailbox: name.to_owned(),
                path: format!("INBOX.{name}"),
            };
            let (partner, ch) = syncmap.partner(&master_ep).expect("master endpoint synced");
            assert_eq!(partner.store, "local");
            assert_eq!(partner.mailbox, name);
            assert_eq!(ch, "work");
        }
    }

    /// spec.md §8 Scenario #2: explicit box list across an IMAP master
    /// (delim `.`) and a flattened Maildir slave.
    #[test]
    fn build_syncmap_resolves_an_explicit_box_list() {
        let master = imap_store("remote", "", '.', &["Inbox", "Archive"]);
        let slave = maildir_store("local", &["Inbox", "Archive"]);

        let mut stores = HashMap::new();
        stores.insert("remote".to_owned(), master);
        stores.insert("local".to_owned(), slave);

        let channel = Channel {
            name: "work".to_owned(),
            master_store: "remote".to_owned(),
            master_box_prefix: String::new(),
            slave_store: "local".to_owned(),
            slave_box_prefix: String::new(),
            selection: Selection::Explicit(vec!["Inbox".to_owned(), "Archive".to_owned()]),
        };

        let syncmap = build_syncmap(&[channel], &stores).unwrap();

        for name in ["Inbox", "Archive"] {
            let master_ep = Endpoint {
                store: "remote".to_owned(),
                mailbox: name.to_owned(),
                path: name.to_owned(),
            };
            let (partner, ch) = syncmap.partner(&master_ep).expect("master endpoint synced");
            assert_eq!(partner.store, "local");
            assert_eq!(partner.path, format!("/tmp/local/{name}"));
            assert_eq!(ch, "work");
        }
    }

    /// A box named in the explicit list but missing from one side's
    /// enumerated mailboxes is a startup error (spec.md §8 Scenario #2).
    #[test]
    fn build_syncmap_rejects_an_explicit_box_missing_on_one_side() {
        let master = imap_store("remote", "", '.', &["Inbox"]);
        let slave = maildir_store("local", &["Inbox"]);

        let mut stores = HashMap::new();
        stores.insert("remote".to_owned(), master);
        stores.insert("local".to_owned(), slave);

        let channel = Channel {
            name: "work".to_owned(),
            master_store: "remote".to_owned(),
            master_box_prefix: String::new(),
            slave_store: "local".to_owned(),
            slave_box_prefix: String::new(),
            selection: Selection::Explicit(vec!["Inbox".to_owned(), "Archive".to_owned()]),
        };

        assert!(build_syncmap(&[channel], &stores).is_err());
    }

    #[test]
    fn star_matches_any_run() {
        let pat = compile_pattern("*", '/');
        assert!(pat.regex.is_match("Work"));
        assert!(pat.regex.is_match("Work/Trash"));
        assert!(!pat.negated);
    }

    #[test]
    fn percent_excludes_delimiter() {
        let pat = compile_pattern("%", '/');
        assert!(pat.regex.is_match("Work"));
        assert!(!pat.regex.is_match("Work/Trash"));
    }

    #[test]
    fn negation_flag_is_parsed() {
        let pat = compile_pattern("!*Trash*", '/');
        assert!(pat.negated);
        assert!(pat.regex.is_match("Work/Trash"));
    }

    #[test]
    fn later_pattern_overrides_earlier_one() {
        let patterns = vec![compile_pattern("*", '/'), compile_pattern("!*Trash*", '/')];
        assert_eq!(pattern_decision(&patterns, "Work"), Some(true));
        assert_eq!(pattern_decision(&patterns, "Work/Trash"), Some(false));
    }

    #[test]
    fn normalized_box_strips_prefix_and_delimiter() {
        assert_eq!(normalized_box("INBOX.Work", "INBOX.", '.'), "Work");
    }

    #[test]
    fn store_box_prepends_prefix_and_rejoins_delimiter() {
        assert_eq!(store_box("Work/Trash", "INBOX.", '.'), "INBOX.Work.Trash");
    }
}
