//! Command-line argument parsing for pqmsg.

use crate::Result;
use std::env;
use std::path::PathBuf;
use std::process;

/// Command-line interface commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// In-memory conversation between two local peers
    Demo { messages: usize },
    /// Ping inbox pressure of a data directory
    InboxStats { data_dir: Option<PathBuf> },
    /// Reclaim stuck downloads in a data directory
    Watchdog { data_dir: Option<PathBuf>, once: bool },
    /// Effective configuration after environment overrides
    Config,
}

/// Parse command line arguments into a Command
pub fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match parse_command(&args[1..]) {
        Ok(command) => Ok(command),
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(1);
        }
    }
}

/// Parses everything after the program name.
pub fn parse_command(args: &[String]) -> std::result::Result<Command, String> {
    let Some((name, rest)) = args.split_first() else {
        return Err("missing command".to_string());
    };

    match name.as_str() {
        "demo" => {
            let messages = match rest.first() {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| format!("demo: '{}' is not a message count", raw))?,
                None => 60,
            };
            Ok(Command::Demo { messages })
        }

        "inbox-stats" => Ok(Command::InboxStats {
            data_dir: rest.first().map(PathBuf::from),
        }),

        "watchdog" => {
            let mut data_dir = None;
            let mut once = false;
            for arg in rest {
                match arg.as_str() {
                    "--once" => once = true,
                    flag if flag.starts_with("--") => {
                        return Err(format!("watchdog: unknown flag '{}'", flag));
                    }
                    path => data_dir = Some(PathBuf::from(path)),
                }
            }
            Ok(Command::Watchdog { data_dir, once })
        }

        "config" => Ok(Command::Config),

        other => Err(format!("Unknown command '{}'", other)),
    }
}

/// Print usage information
pub fn print_usage() {
    println!("pqmsg - post-quantum messaging core");
    println!("===================================");
    println!();
    println!("Usage: pqmsg <command> [args...]");
    println!();
    println!("Commands:");
    println!("  demo [messages]                 Run a local two-peer conversation");
    println!("  inbox-stats [data_dir]          Show ping inbox pressure");
    println!("  watchdog [data_dir] [--once]    Reclaim stuck downloads");
    println!("  config                          Print the effective configuration");
    println!();
    println!("The data directory defaults to PQMSG_DATA_DIR or ./pqmsg_data.");
    println!("Logging is controlled with RUST_LOG (default: pqmsg=info).");
}
