//! Process arguments and the grammar of operator console lines.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::export::ExportFormat;

#[derive(Debug, Parser)]
#[command(name = "watchlink", version, about = "Collect telemetry from wearable watches")]
pub struct Args {
    /// JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// SQLite database file
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Address watches connect to, e.g. 0.0.0.0:8888
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum ConsoleCommand {
    /// List known watches
    Devices,
    /// Give a watch a display name
    Rename {
        uid: String,
        #[arg(required = true, num_args = 1..)]
        name: Vec<String>,
    },
    /// Read a remote parameter
    Get { uid: String, param: String },
    /// Write a remote parameter
    Set {
        uid: String,
        param: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Stream readings until the next input line
    Live {
        /// Also store every reading
        #[arg(long)]
        store: bool,
        /// Comma separated watch uids
        uids: String,
        /// Push interval in milliseconds
        #[arg(allow_hyphen_values = true)]
        interval_ms: i64,
    },
    /// Export reading histories (all watches when no uid is given)
    Export {
        #[arg(long, value_enum)]
        format: ExportFormat,
        /// Write to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        uids: Vec<String>,
    },
    /// Show recent log lines
    Logs {
        /// How many lines to show
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    /// Leave the console
    #[command(alias = "exit")]
    Quit,
}

/// Split a `live` selection such as `abc123,def456`; empty items are ignored.
pub fn split_uids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse one console line. Blank lines parse to `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, clap::Error> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(None);
    }
    ConsoleLine::try_parse_from(tokens).map(|parsed| Some(parsed.command))
}
