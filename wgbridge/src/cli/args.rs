use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{validate_interface_name, Flavor, LogLevel, MTU_RANGE};

#[derive(Parser, Debug)]
#[command(name = "wgbridge", about = "Userspace WireGuard / AmneziaWG interface manager", version)]
pub struct Cli {
    /// Increase verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an interface and serve it from a background worker
    Add(AddArgs),

    /// Stop the worker serving an interface
    Down {
        /// Interface name
        interface: String,

        /// Flavor of the worker to stop
        #[arg(long, value_enum, default_value_t = Flavor::Wg)]
        flavor: Flavor,
    },

    /// Show running workers
    Status {
        /// Interface to query in detail (lists all workers if omitted)
        interface: Option<String>,
    },

    /// Generate a new private key
    Genkey,

    /// Derive public key from private key (reads from stdin)
    Pubkey,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Interface name, e.g. wg0
    #[arg(short, long, value_parser = parse_interface_name)]
    pub interface: String,

    /// Interface MTU
    #[arg(short, long, value_parser = parse_mtu)]
    pub mtu: Option<u32>,

    #[arg(long, value_enum, default_value_t = Flavor::Wg)]
    pub flavor: Flavor,

    /// Directory for the worker's `<interface>.log`
    #[arg(short, long)]
    pub log_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Error)]
    pub log_level: LogLevel,

    /// Write device logs as JSON lines
    #[arg(long)]
    pub json: bool,
}

fn parse_interface_name(value: &str) -> Result<String, String> {
    validate_interface_name(value)
        .map(|_| value.to_string())
        .map_err(|reason| reason.to_string())
}

fn parse_mtu(value: &str) -> Result<u32, String> {
    let mtu: u32 = value.parse().map_err(|_| format!("invalid MTU: {}", value))?;
    if !MTU_RANGE.contains(&mtu) {
        return Err(format!(
            "MTU must be between {} and {}",
            MTU_RANGE.start(),
            MTU_RANGE.end()
        ));
    }
    Ok(mtu)
}

impl Cli {
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("wgbridge").chain(args.iter().copied()))
    }

    #[test]
    fn test_add_defaults() {
        let cli = parse(&["add", "-i", "wg0"]).unwrap();
        let Commands::Add(add) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(add.interface, "wg0");
        assert_eq!(add.mtu, None);
        assert_eq!(add.flavor, Flavor::Wg);
        assert_eq!(add.log_level, LogLevel::Error);
        assert!(!add.json);
    }

    #[test]
    fn test_add_full() {
        let cli = parse(&[
            "-vv", "add", "-i", "awg0", "-m", "1280", "--flavor", "awg", "-l", "/tmp",
            "--log-level", "debug", "--json",
        ])
        .unwrap();
        assert_eq!(cli.log_level(), tracing::Level::DEBUG);
        let Commands::Add(add) = cli.command else {
            panic!("expected add");
        };
        assert_eq!(add.mtu, Some(1280));
        assert_eq!(add.flavor, Flavor::Awg);
        assert_eq!(add.log_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(add.log_level, LogLevel::Verbose);
        assert!(add.json);
    }

    #[test]
    fn test_add_rejects_bad_input() {
        assert!(parse(&["add"]).is_err());
        assert!(parse(&["add", "-i", "wg-0"]).is_err());
        assert!(parse(&["add", "-i", "averyveryverylongname"]).is_err());
        assert!(parse(&["add", "-i", "wg0", "-m", "499"]).is_err());
        assert!(parse(&["add", "-i", "wg0", "-m", "1501"]).is_err());
        assert!(parse(&["add", "-i", "wg0", "--flavor", "ovpn"]).is_err());
    }

    #[test]
    fn test_other_commands() {
        assert!(matches!(
            parse(&["down", "wg0"]).unwrap().command,
            Commands::Down { flavor: Flavor::Wg, .. }
        ));
        assert!(matches!(
            parse(&["status"]).unwrap().command,
            Commands::Status { interface: None }
        ));
        assert!(matches!(parse(&["genkey"]).unwrap().command, Commands::Genkey));
    }
}
