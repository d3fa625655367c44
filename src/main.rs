//! mailwatch: IMAP IDLE and Maildir watcher
//!
//! Watches one or more IMAP mailboxes via the `IDLE` extension and one or
//! more local Maildirs via polling, running an external sync command
//! whenever either side changes.
//!
//! # Architecture
//!
//! - [`cli`]: Command-line argument parsing
//! - [`config`]: `.mbsyncrc`-style configuration file parser
//! - [`password`]: Password resolution (literal, `passcmd`, interactive prompt)
//! - [`model`]: Store, channel and mailbox-selection data model
//! - [`net`]: Framed line I/O over plaintext/TLS sockets
//! - [`imap`]: Minimal blocking IMAP client
//! - [`pool`]: Long-lived IMAP connection pool
//! - [`idle`]: The `IDLE` state machine
//! - [`resolver`]: Mailbox enumeration and sync-map construction
//! - [`supervisor`]: Watcher thread lifecycle and reconnect/backoff policy
//! - [`dispatcher`]: Task queue draining and sync command invocation
//! - [`errors`]: Application error model

mod cli;
mod config;
mod dispatcher;
mod errors;
mod idle;
mod imap;
mod model;
mod net;
mod password;
mod pool;
mod resolver;
mod supervisor;

use password::resolve_store_passwords;

use std::collections::{HashMap, HashSet};
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::ParsedConfig;
use errors::MailwatchError;
use model::{Channel, Selection};
use pool::ConnectionPool;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.targets.is_empty() && !cli.all {
        tracing::error!("no channel specified, try 'mailwatch --help'");
        return ExitCode::from(1);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::from(1)
        }
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "mailwatch=debug"
    } else if cli.quiet {
        "mailwatch=error"
    } else if cli.verbose {
        "mailwatch=trace"
    } else {
        "mailwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<(), MailwatchError> {
    let config_path = config::expand_tilde(&cli.config);
    let parsed: ParsedConfig = config::load(&config_path)?;

    let channels = select_channels(cli, &parsed)?;
    tracing::debug!(channels = ?channels.iter().map(|c| &c.name).collect::<Vec<_>>(), "selected channels");

    let mut stores = parsed.stores;
    let used: HashSet<String> = channels
        .iter()
        .flat_map(|c| [c.master_store.clone(), c.slave_store.clone()])
        .collect();
    stores.retain(|name, _| used.contains(name));

    // Only ask for a password (literal lookup, passcmd, or interactive
    // prompt) for a store that a selected channel actually reaches.
    resolve_store_passwords(&mut stores)?;

    let pool = Arc::new(ConnectionPool::new());
    resolver::enumerate_stores(&mut stores, &pool)?;

    let syncmap = resolver::build_syncmap(&channels, &stores)?;
    tracing::debug!(pairs = syncmap.iter().count(), "built sync map");

    if cli.list {
        for (ep, (partner, channel)) in syncmap.iter() {
            println!(
                "{channel}\t{}:{}\t{}:{}",
                ep.store, ep.mailbox, partner.store, partner.mailbox
            );
        }
        pool.close_all();
        return Ok(());
    }

    let channels_by_name: HashMap<String, Channel> =
        channels.into_iter().map(|c| (c.name.clone(), c)).collect();

    let (tx, rx) = mpsc::channel();
    supervisor::start_watching(&tx, &syncmap, &stores, &pool, supervisor::T_POLL);

    let _ = tx.send(dispatcher::make_sync_all_task(&syncmap, &stores));

    let result = dispatcher::task_loop(&rx, &syncmap, &channels_by_name, &stores, &cli.command);
    pool.close_all();
    result
}

/// Resolve CLI positional args (groups, channels, `channel:box,box` targets)
/// and `--all` into the final channel list, later-wins on duplicates so a
/// `channel:box,box` override always takes effect even if also named by
/// `--all` or a group.
fn select_channels(cli: &Cli, parsed: &ParsedConfig) -> Result<Vec<Channel>, MailwatchError> {
    let mut selected: Vec<Channel> = Vec::new();

    let mut upsert = |channel: Channel, selected: &mut Vec<Channel>| {
        if let Some(existing) = selected.iter_mut().find(|c| c.name == channel.name) {
            *existing = channel;
        } else {
            selected.push(channel);
        }
    };

    if cli.all {
        for channel in &parsed.channels {
            upsert(channel.clone(), &mut selected);
        }
    }

    for arg in &cli.targets {
        if let Some(members) = parsed.groups.get(arg) {
            for name in members {
                let channel = parsed.channels.iter().find(|c| &c.name == name).ok_or_else(|| {
                    MailwatchError::Config(format!(
                        "group '{arg}' references unknown channel '{name}'"
                    ))
                })?;
                upsert(channel.clone(), &mut selected);
            }
            continue;
        }

        let (name, boxes) = cli::parse_target(arg);
        let mut channel = parsed
            .channels
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| MailwatchError::Config(format!("unknown group or channel '{name}'")))?;
        if !boxes.is_empty() {
            channel.selection = Selection::Explicit(boxes);
        }
        upsert(channel, &mut selected);
    }

    Ok(selected)
}
