//! Command-line interface for pqmsg.
//!
//! Operational helpers around the library: a local demo conversation, ping
//! inbox inspection and the stuck-claim watchdog.

pub mod args;
pub mod commands;

use crate::Result;
use std::process;

pub use args::Command;

/// Main entry point for the CLI application
pub fn run() -> Result<()> {
    let command = match args::parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error parsing arguments: {}", e);
            process::exit(1);
        }
    };

    let result = match command {
        Command::Demo { messages } => commands::demo(messages),
        Command::InboxStats { data_dir } => commands::inbox_stats(data_dir.as_deref()),
        Command::Watchdog { data_dir, once } => commands::watchdog(data_dir.as_deref(), once),
        Command::Config => commands::show_config(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    Ok(())
}
