//! `skybridge` – GCS worker bridge.
//!
//! Started by the ground-control host as a child process.  It:
//!
//! 1. Loads `~/.skybridge/config.toml` (or the file given with `--config`),
//!    applying `SKYBRIDGE_*` environment overrides.
//! 2. Builds the enabled workers, each with its own task supervisor.
//! 3. Serves JSON requests on stdin and writes replies and host messages on
//!    stdout until stdin closes or **Ctrl-C** arrives, then stops every
//!    script that has not reported an outcome yet.  Launched nodes keep
//!    running.
//!
//! Logs and the banner go to stderr.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};

use skybridge_middleware::EventBus;
use skybridge_runtime::{ExitReason, HostLoop};
use skybridge_workers::WorkerRegistry;

#[derive(Debug, Parser)]
#[command(name = "skybridge", version, about = "GCS worker bridge")]
struct Args {
    /// Config file (default ~/.skybridge/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let _telemetry = skybridge_runtime::init_tracing("skybridge");
    print_banner();

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let cfg = match config::load_or_default(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.init_config {
        return match config::save_to(&cfg, &path) {
            Ok(()) => {
                eprintln!(
                    "  {} Config saved to {}",
                    "✓".green().bold(),
                    path.display().to_string().bold()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", "Error saving config".red(), e);
                ExitCode::FAILURE
            }
        };
    }

    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
    }
    if !cfg.scripts_dir.is_dir() {
        warn!(scripts_dir = %cfg.scripts_dir.display(), "scripts directory does not exist");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cfg)) {
        Ok(reason) => {
            info!(?reason, "skybridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "skybridge stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(cfg: config::Config) -> Result<ExitReason, String> {
    let bus = EventBus::new(cfg.bus_capacity);
    let ctx = cfg.worker_context(bus.clone());
    let registry = WorkerRegistry::with_builtin(&ctx, &cfg.workers).map_err(|e| e.to_string())?;
    info!(
        scripts_dir = %cfg.scripts_dir.display(),
        shell = %cfg.shell,
        workers = ?registry.worker_ids(),
        "workers ready"
    );

    let host = HostLoop::new(registry, bus);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C; waiting for stdin to close");
            std::future::pending::<()>().await;
        }
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – stopping running scripts …".yellow().bold());
    };

    host.run(stdin, tokio::io::stdout(), ctrl_c)
        .await
        .map_err(|e| e.to_string())
}

fn print_banner() {
    eprintln!();
    eprintln!("{}", r#"   ____ __        ___      _    __         "#.bold().cyan());
    eprintln!("{}", r#"  / __// /__ __ __/ _ )____(_)__/ /__ ____ "#.bold().cyan());
    eprintln!("{}", r#" _\ \ /  '_// // / _  / __/ / _  / _ `/ -_)"#.bold().cyan());
    eprintln!("{}", r#"/___//_/\_\ \_, /____/_/ /_/\_,_/\_, /\__/ "#.bold().cyan());
    eprintln!("{}", r#"           /___/               /___/       "#.bold().cyan());
    eprintln!();
    eprintln!(
        "  {} {}",
        "SkyBridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    eprintln!("  GCS worker bridge");
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("skybridge").chain(args.iter().copied()))
    }

    #[test]
    fn command_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn no_arguments_use_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.config, None);
        assert!(!args.init_config);
    }

    #[test]
    fn config_flag_takes_a_path() {
        let args = parse(&["--config", "/etc/skybridge.toml", "--init-config"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/skybridge.toml")));
        assert!(args.init_config);

        let short = parse(&["-c", "local.toml"]).unwrap();
        assert_eq!(short.config, Some(PathBuf::from("local.toml")));
    }

    #[test]
    fn config_flag_without_path_is_an_error() {
        let err = parse(&["--config"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn unknown_argument_is_an_error() {
        let err = parse(&["--verbose"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn help_is_handled_by_clap() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
