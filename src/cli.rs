//! Command-line argument parsing

use clap::Parser;

/// Watches IMAP mailboxes via IDLE and local Maildirs via polling, running a
/// sync command whenever either side changes.
#[derive(Debug, Parser)]
#[command(name = "mailwatch", version, about, long_about = None)]
pub struct Cli {
    /// Syncing command to run on change (default: mbsync)
    #[arg(short = 'e', long = "command", default_value = "mbsync")]
    pub command: String,

    /// Operate on all defined channels
    #[arg(short = 'a', long = "all")]
    pub all: bool,

    /// List mailboxes instead of watching them
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// Read an alternate config file
    #[arg(short = 'c', long = "config", default_value = "~/.mbsyncrc")]
    pub config: String,

    /// Print debugging messages
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,

    /// Verbose mode (log network traffic)
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// Print only errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// `GROUP`, `CHANNEL`, or `CHANNEL:box,box,...`
    pub targets: Vec<String>,
}

/// Split a positional `CHANNEL` or `CHANNEL:box,box,...` argument. A target
/// that names a group rather than a channel is resolved by the caller
/// against the config's group table before falling back to this.
pub fn parse_target(arg: &str) -> (String, Vec<String>) {
    match arg.split_once(':') {
        Some((channel, boxes)) => (
            channel.to_owned(),
            boxes.split(',').map(str::to_owned).collect(),
        ),
        None => (arg.to_owned(), Vec::new()),
    }
}
