//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Relay files from publicly shared cloud storage to chat users.
///
/// Reads requests from stdin, one per line, as
/// `<requester_id> <resource_key> <path>`. The path may contain spaces.
/// After stdin closes, waits for every outstanding request, then exits.
#[derive(Parser, Debug)]
#[command(name = "disk-relay")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// JSON configuration file [default: config.json, if present]
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of concurrent workers (1-64), overrides the config file
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Maximum bytes per delivered part, overrides the config file
    #[arg(long, value_name = "BYTES", value_parser = clap::value_parser!(u64).range(1..))]
    pub volume_size: Option<u64>,
}
