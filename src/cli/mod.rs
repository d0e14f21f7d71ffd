// CLI module - Flag parsing, logging setup and runtime startup

use crate::config::Config;
use crate::error::{PipelogError, Result};
use crate::process::Supervisor;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the diagnostic log filter
const LOG_FILTER_ENV: &str = "PIPELOG_LOG";

/// Run a command, capturing its stdout and stderr into log files that are
/// reopened on a signal
#[derive(Parser, Debug)]
#[command(name = "pipelog")]
#[command(version, about, long_about = None)]
#[command(override_usage = "pipelog [OPTIONS] -o <PATH> -e <PATH> -- <COMMAND>...")]
pub struct Cli {
    /// Log stdout to <PATH>
    #[arg(short = 'o', value_name = "PATH")]
    stdout_log: Option<PathBuf>,

    /// Log stderr to <PATH>
    #[arg(short = 'e', value_name = "PATH")]
    stderr_log: Option<PathBuf>,

    /// Trap <SIG#> instead of SIGHUP (1)
    #[arg(short = 's', value_name = "SIG#")]
    signal: Option<i32>,

    /// Forward the signal to the child process
    #[arg(short = 'f')]
    forward: bool,

    /// Read settings from a TOML or JSON file; flags take precedence
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Command to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    /// Run the CLI application and return the process exit code
    pub fn run() -> Result<i32> {
        let cli = Cli::parse();
        let supervisor = Supervisor::new(cli.into_config()?)?;

        init_logging();

        // Capture, signal wake-ups and reaping all run on this thread
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PipelogError::SetupError(format!("failed to start runtime: {}", e)))?;

        runtime.block_on(supervisor.run())
    }

    /// Merge the flags over the optional configuration file
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(path) = self.stdout_log {
            config.stdout_log = Some(path);
        }
        if let Some(path) = self.stderr_log {
            config.stderr_log = Some(path);
        }
        if let Some(signal) = self.signal {
            config.signal = signal;
        }
        if self.forward {
            config.forward_signal = true;
        }

        let mut command = self.command.into_iter();
        if let Some(program) = command.next() {
            config.command = Some(program);
            config.args = command.collect();
        }

        Ok(config)
    }
}

/// Install the diagnostic subscriber on the supervisor's own stderr
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
