mod config;
mod endpoint;
mod pipe;
mod privilege;
mod reap;
mod session;
mod signals;
mod spawn;

use clap::Parser;
use session::SessionOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};

/// Runs a single application fullscreen for the lifetime of a display
/// session: a fresh display socket is bound, the application is spawned
/// against it, and the whole session ends when the application exits.
#[derive(Parser, Debug)]
#[command(name = "vitrine", version, about)]
pub struct Cli {
    /// Config file path (default: vitrine.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra logging (descriptor lifecycle, loop wakeups)
    #[arg(short, long)]
    verbose: bool,

    /// Application to run, with its arguments
    #[arg(
        value_name = "APPLICATION",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    debug!(?cli, "parsed CLI arguments");

    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from("vitrine.toml"), false),
    };
    let config = match config::load(&config_path, explicit) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime_dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            error!("XDG_RUNTIME_DIR is not set in the environment");
            return ExitCode::FAILURE;
        }
    };

    let opts = SessionOptions {
        command: cli.command,
        runtime_dir,
        socket_name: config.display.socket.clone(),
        client_env: config.client.env_pairs(),
    };
    let code = session::run(&opts);
    ExitCode::from(code as u8)
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_collects_application_argv() {
        let cli = Cli::try_parse_from(["vitrine", "firefox", "--kiosk", "https://example.org"])
            .unwrap();
        assert_eq!(cli.command, vec!["firefox", "--kiosk", "https://example.org"]);
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_requires_an_application() {
        assert!(Cli::try_parse_from(["vitrine"]).is_err());
    }

    #[test]
    fn test_cli_own_flags_before_application() {
        let cli = Cli::try_parse_from(["vitrine", "-v", "-c", "kiosk.toml", "mpv", "--fs"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("kiosk.toml")));
        assert_eq!(cli.command, vec!["mpv", "--fs"]);
    }
}
