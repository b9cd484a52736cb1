use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use form_oracle::types::Trace;
use form_oracle::{OracleConfig, OracleResult, Stage, load_spec};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "form-oracle")]
#[command(about = "Replay a form interaction spec in a real browser and print the ground truth as JSON")]
#[command(version)]
struct Cli {
    /// Path to the JSON spec
    spec: PathBuf,

    /// Show the browser window
    #[arg(long, env = "FORM_ORACLE_HEADED")]
    headed: bool,

    /// Browser executable to launch
    #[arg(long, env = "FORM_ORACLE_CHROME")]
    chrome: Option<PathBuf>,

    /// Disable the Chrome sandbox (needed in most containers)
    #[arg(long, env = "FORM_ORACLE_NO_SANDBOX")]
    no_sandbox: bool,

    /// How long a graceful browser close may take before it is killed
    #[arg(long, env = "FORM_ORACLE_SHUTDOWN_GRACE_MS", default_value_t = 500)]
    shutdown_grace_ms: u64,

    /// Budget for the whole run; derived from the step and capture timeouts when unset
    #[arg(long, env = "FORM_ORACLE_RUN_TIMEOUT_MS")]
    run_timeout_ms: Option<u64>,
}

impl Cli {
    fn config(&self) -> OracleConfig {
        OracleConfig {
            headless: !self.headed,
            sandbox: !self.no_sandbox,
            chrome_path: self.chrome.clone(),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            run_timeout: self
                .run_timeout_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            ..Default::default()
        }
    }
}

fn init_tracing() {
    // stdout carries the result document, so logs go to stderr
    let filter = EnvFilter::try_from_env("FORM_ORACLE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn emit(result: &OracleResult) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, result).context("serializing result")?;
    writeln!(stdout).context("writing result")?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let result = match load_spec(&cli.spec) {
        Ok(raw) => form_oracle::run(raw, &cli.config()).await,
        Err(err) => {
            error!(path = %cli.spec.display(), error = %err, "could not read spec");
            OracleResult::failure(Trace::new(), &err, Stage::Validation)
        }
    };

    if let Err(e) = emit(&result) {
        error!(error = %e, "failed to write result");
        return ExitCode::FAILURE;
    }
    ExitCode::from(result.exit_code())
}
