use anyhow::Result;
use clap::Parser;
use ortho_core::console;
use ortho_runner::dispatch::script_error;
use ortho_runner::executor::ScriptFailed;
use ortho_runner::{dispatch, DispatchOutcome, Workspace, CONFIG_ENV, CONFIG_FILE};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "ortho",
    version,
    about = "Experiment-driven simulation supervisor",
    after_help = "Usage: ortho <target> [arg ...] [key=value ...]; with no target, list the exposed commands."
)]
struct Cli {
    /// Working directory of the experiment
    #[arg(short = 'C', long = "dir", default_value = ".")]
    dir: PathBuf,
    /// Config document, relative to the working directory
    #[arg(long, env = CONFIG_ENV, default_value = CONFIG_FILE)]
    config: PathBuf,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    tokens: Vec<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    if let Err(err) = ortho_core::interrupt::install() {
        warn!(%err, "cannot install the interrupt handler");
    }
    let cli = Cli::parse();
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            // Step failures were already reported when they were recorded.
            if err.downcast_ref::<ScriptFailed>().is_none() {
                let traceback = script_error(&err)
                    .map(|e| e.traceback_lines())
                    .unwrap_or_default();
                console::error_report(&traceback, &format!("{:#}", err));
            }
            std::process::exit(1);
        }
    }
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let ws = Workspace::new(cli.dir).with_config(cli.config);
    debug!(root = %ws.root.display(), config = %ws.config_path.display(), "dispatching");
    Ok(match dispatch(&ws, &cli.tokens)? {
        DispatchOutcome::Listed(_) => None,
        DispatchOutcome::Completed(payload) => payload,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{{\"error\":\"failed to serialize result\"}}"),
    }
}
