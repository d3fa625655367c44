//! `.mbsyncrc`-style configuration parser
//!
//! A flat, line-oriented grammar: `option value...` pairs, with `imapstore`,
//! `maildirstore` and `channel` opening a named, stateful section that
//! subsequent lines populate until the next section-opening line (spec.md
//! §6.1). Values are tokenized with shell quoting rules, matching upstream's
//! use of `shlex.split`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{MailwatchError, MailwatchResult};
use crate::model::{Channel, ImapStore, MaildirStore, Selection, Store, TlsMode};
use crate::password::PasswordSource;
use crate::resolver::compile_pattern;

#[derive(Debug, Clone, Default)]
struct RawSection {
    name: String,
    values: HashMap<String, String>,
    master: Option<(String, String)>,
    slave: Option<(String, String)>,
    patterns: Vec<String>,
}

#[derive(Debug, Default)]
struct RawConfig {
    imapstores: Vec<RawSection>,
    maildirstores: Vec<RawSection>,
    channels: Vec<RawSection>,
    groups: HashMap<String, Vec<String>>,
}

/// Fully parsed and resolved configuration: stores (passwords already
/// fetched) and channels, ready for `resolver::enumerate_stores`.
pub struct ParsedConfig {
    pub stores: HashMap<String, Store>,
    pub channels: Vec<Channel>,
    pub groups: HashMap<String, Vec<String>>,
}

pub fn load(path: &Path) -> MailwatchResult<ParsedConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| MailwatchError::Config(format!("reading {}: {e}", path.display())))?;
    let raw = parse_raw(&text)?;
    build(raw)
}

/// Expand a leading `~` the way the shell would, without relying on `$HOME`
/// lookup beyond what `dirs` already does.
pub fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

fn parse_raw(text: &str) -> MailwatchResult<RawConfig> {
    let mut config = RawConfig::default();

    enum Current {
        None,
        ImapStore(usize),
        MaildirStore(usize),
        Channel(usize),
    }
    let mut current = Current::None;

    for (idx, raw_line) in text.lines().enumerate() {
        let lno = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (option, rest) = line
            .split_once(char::is_whitespace)
            .map(|(o, r)| (o, r.trim_start()))
            .ok_or_else(|| {
                MailwatchError::Config(format!("line {lno}: option '{line}' doesn't have any value"))
            })?;
        let option = option.to_ascii_lowercase();
        let values = shell_words::split(rest)
            .map_err(|e| MailwatchError::Config(format!("line {lno}: {rest}: {e}")))?;
        let first = values.first().cloned().ok_or_else(|| {
            MailwatchError::Config(format!("line {lno}: option '{option}' doesn't have any value"))
        })?;

        match option.as_str() {
            "imapstore" => {
                current = Current::ImapStore(find_or_insert(&mut config.imapstores, &first));
            }
            "maildirstore" => {
                current = Current::MaildirStore(find_or_insert(&mut config.maildirstores, &first));
            }
            "channel" => {
                current = Current::Channel(find_or_insert(&mut config.channels, &first));
            }
            "master" | "slave" => {
                let parts: Vec<&str> = first.split(':').collect();
                if parts.len() != 3 || !parts[0].is_empty() {
                    return Err(MailwatchError::Config(format!(
                        "line {lno}: {option} value must be in format :store:[mailbox]"
                    )));
                }
                let (sname, sbox) = (parts[1].to_owned(), parts[2].to_owned());
                // The referenced store must already be declared: order in the
                // file matters, exactly as upstream requires, so this is
                // checked here during the forward pass rather than once the
                // whole file has been read.
                let known = config.imapstores.iter().any(|s| s.name == sname)
                    || config.maildirstores.iter().any(|s| s.name == sname);
                if !known {
                    return Err(MailwatchError::Config(format!(
                        "line {lno}: {option} references store '{sname}', which must be declared before the channel that references it"
                    )));
                }
                let section = match &current {
                    Current::Channel(i) => &mut config.channels[*i],
                    _ => {
                        return Err(MailwatchError::Config(format!(
                            "line {lno}: '{option}' outside a channel section"
                        )));
                    }
                };
                if option == "master" {
                    section.master = Some((sname, sbox));
                } else {
                    section.slave = Some((sname, sbox));
                }
            }
            "patterns" => {
                let section = match &current {
                    Current::Channel(i) => &mut config.channels[*i],
                    _ => {
                        return Err(MailwatchError::Config(format!(
                            "line {lno}: 'patterns' outside a channel section"
                        )));
                    }
                };
                section.patterns = values;
            }
            "group" => {
                let mut it = values.into_iter();
                let gname = it.next().unwrap();
                config.groups.entry(gname).or_default().extend(it);
            }
            _ => {
                let section = match &current {
                    Current::ImapStore(i) => &mut config.imapstores[*i],
                    Current::MaildirStore(i) => &mut config.maildirstores[*i],
                    Current::Channel(i) => &mut config.channels[*i],
                    Current::None => {
                        return Err(MailwatchError::Config(format!(
                            "line {lno}: '{option}' outside any section"
                        )));
                    }
                };
                let value = match first.as_str() {
                    "yes" => "true".to_owned(),
                    "no" => "false".to_owned(),
                    _ => first,
                };
                section.values.insert(option, value);
            }
        }
    }

    Ok(config)
}

fn find_or_insert(sections: &mut Vec<RawSection>, name: &str) -> usize {
    if let Some(pos) = sections.iter().position(|s| s.name == name) {
        return pos;
    }
    sections.push(RawSection {
        name: name.to_owned(),
        ..Default::default()
    });
    sections.len() - 1
}

fn build(raw: RawConfig) -> MailwatchResult<ParsedConfig> {
    let mut stores = HashMap::new();

    for section in &raw.imapstores {
        let store = build_imap_store(section)?;
        stores.insert(section.name.clone(), Store::Imap(store));
    }
    for section in &raw.maildirstores {
        let store = build_maildir_store(section)?;
        stores.insert(section.name.clone(), Store::Maildir(store));
    }

    let mut channels = Vec::with_capacity(raw.channels.len());
    for section in &raw.channels {
        channels.push(build_channel(section)?);
    }

    Ok(ParsedConfig {
        stores,
        channels,
        groups: raw.groups,
    })
}

fn build_imap_store(section: &RawSection) -> MailwatchResult<ImapStore> {
    let v = &section.values;
    let host = required(v, &section.name, "host")?;
    let user = required(v, &section.name, "user")?;
    let port: u16 = v
        .get("port")
        .map(|p| p.parse())
        .transpose()
        .map_err(|_| MailwatchError::Config(format!("store '{}': invalid port", section.name)))?
        .unwrap_or(if v.get("useimaps").map(String::as_str) == Some("false") {
            143
        } else {
            993
        });
    let tls_mode = if v.get("useimaps").map(String::as_str) == Some("false") {
        TlsMode::StartTls
    } else {
        TlsMode::Imaps
    };

    let pass_source = if let Some(p) = v.get("pass") {
        PasswordSource::Literal(p.clone())
    } else if let Some(cmd) = v.get("passcmd") {
        PasswordSource::Command(cmd.clone())
    } else {
        PasswordSource::Prompt
    };

    let path_delimiter_override = v.get("pathdelimiter").and_then(|s| s.chars().next());
    let path_prefix = v.get("path").cloned().unwrap_or_default();

    debug!(store = %section.name, host, "configured IMAP store");
    Ok(ImapStore {
        name: section.name.clone(),
        host,
        port,
        user,
        pass_source,
        pass: None,
        tls_mode,
        path_prefix,
        path_delimiter_override,
        delimiter: None,
        mailboxes: Vec::new(),
    })
}

fn build_maildir_store(section: &RawSection) -> MailwatchResult<MaildirStore> {
    let v = &section.values;
    let path_raw = required(v, &section.name, "path")?;
    let path = expand_tilde(&path_raw);
    let inbox = v.get("inbox").map(|s| expand_tilde(s));
    let flatten = v
        .get("flatten")
        .and_then(|s| s.chars().next())
        .unwrap_or('/');

    Ok(MaildirStore {
        name: section.name.clone(),
        path,
        inbox,
        flatten,
        mailboxes: Vec::new(),
    })
}

fn build_channel(section: &RawSection) -> MailwatchResult<Channel> {
    let (master_store, master_box_prefix) = resolve_side(section, &section.master, "master")?;
    let (slave_store, slave_box_prefix) = resolve_side(section, &section.slave, "slave")?;

    let selection = if !section.patterns.is_empty() {
        let patterns = section
            .patterns
            .iter()
            .map(|p| compile_pattern(p, '/'))
            .collect();
        Selection::Patterns(patterns)
    } else {
        Selection::None
    };

    Ok(Channel {
        name: section.name.clone(),
        master_store,
        master_box_prefix,
        slave_store,
        slave_box_prefix,
        selection,
    })
}

/// The referenced store's existence was already checked line-by-line during
/// `parse_raw`'s forward pass; this just unpacks the `master`/`slave` tuple.
fn resolve_side(
    section: &RawSection,
    side: &Option<(String, String)>,
    which: &str,
) -> MailwatchResult<(String, String)> {
    side.clone().ok_or_else(|| {
        MailwatchError::Config(format!("channel '{}': missing '{which}'", section.name))
    })
}

fn required(values: &HashMap<String, String>, section_name: &str, key: &str) -> MailwatchResult<String> {
    values
        .get(key)
        .cloned()
        .ok_or_else(|| MailwatchError::Config(format!("store '{section_name}': missing '{key}'")))
}
