//! usb2000 CLI: calibration and spectrum acquisition for USB2000-family
//! spectrometers.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

mod cli;

#[derive(Parser)]
#[command(
    name = "usb2000-cli",
    version,
    about = "Calibration and spectrum acquisition for Ocean Optics USB2000-family spectrometers"
)]
struct Args {
    /// Output as JSON (for devices, info, spectrum, config)
    #[arg(long, global = true)]
    json: bool,

    /// Use this config file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: cli::Command,
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(args.verbose)),
    )
    .format_timestamp(None)
    .format_target(false)
    .init();

    if let Err(e) = cli::run(args.command, args.json, args.config.as_deref()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_filter() {
        assert_eq!(log_filter(0), "warn");
        assert_eq!(log_filter(1), "debug");
        assert_eq!(log_filter(5), "trace");
    }

    #[test]
    fn args_parse_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["usb2000-cli", "config", "--json", "-vv"]).unwrap();
        assert!(args.json);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn args_reject_unknown_subcommand() {
        assert!(Args::try_parse_from(["usb2000-cli", "mute"]).is_err());
    }
}
