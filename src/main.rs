use std::path::PathBuf;

use clap::{Parser, Subcommand};
use solo::config::Config;
use solo::error::Result;
use solo::output::Format;
use solo::paths::PlatformPaths;

#[derive(Parser)]
#[command(
    name = "solo",
    version,
    about = "Single-instance coordinator for desktop applications"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Directory holding lock files and solo.json
    #[arg(long, global = true, value_name = "DIR")]
    config_home: Option<PathBuf>,
    /// Directory holding application data and resources
    #[arg(long, global = true, value_name = "DIR")]
    data_home: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an instance, or hand the arguments to the one already running
    Run {
        /// Tool module to start instead of the main application
        #[arg(long)]
        module: Option<String>,
        /// Answer `exit` with `invalid`, like peers that predate it
        #[arg(long, hide = true)]
        legacy: bool,
        /// Arguments forwarded to a running instance
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Send a raw request to a running instance and print the reply
    Send {
        /// Tool module whose instance should receive the request
        #[arg(long)]
        module: Option<String>,
        /// Request command (getappname, close, exit, or a module name)
        command: String,
        /// Request arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List lock files, their records and whether each port is live
    Status,
    /// Remove records of dead instances from every lock file
    Cleanup,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn run(cli: Cli, format: Format) -> Result<()> {
    let paths = PlatformPaths::resolve(cli.config_home, cli.data_home)?;
    let config = Config::load(&paths);

    match cli.command {
        Commands::Run {
            module,
            legacy,
            args,
        } => solo::commands::run::run(&paths, &config, module, legacy, args, format),
        Commands::Send {
            module,
            command,
            args,
        } => solo::commands::send::run(&paths, &config, module, command, args, format),
        Commands::Status => solo::commands::status::run(&paths, &config, format),
        Commands::Cleanup => solo::commands::cleanup::run(&paths, &config, format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_trailing_arguments() {
        let cli = Cli::try_parse_from([
            "solo",
            "run",
            "--module",
            "profile-info",
            "a.icc",
            "--flag",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { module, args, .. } => {
                assert_eq!(module.as_deref(), Some("profile-info"));
                assert_eq!(args, vec!["a.icc".to_string(), "--flag".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn verbosity_maps_to_log_level() {
        assert_eq!(log_level(0), "warn");
        assert_eq!(log_level(1), "info");
        assert_eq!(log_level(3), "debug");
    }
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level(cli.verbose)),
    )
    .init();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            Format::Pretty => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
