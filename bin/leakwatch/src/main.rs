mod commands;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "leakwatch")]
#[command(about = "Run a QUnit suite in Chrome and report objects that outlive their test", long_about = None)]
#[command(version)]
pub struct Cli {
    /// URL of the test page
    pub url: String,

    /// Config file (defaults to ~/.leakwatch/config.json when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Attach to a browser already listening on this debugging port
    #[arg(long)]
    pub port: Option<u16>,

    /// Chrome/Chromium executable
    #[arg(long)]
    pub browser: Option<String>,

    /// Constructor name to watch; repeat for several (overrides config)
    #[arg(short, long = "watch")]
    pub watch: Vec<String>,

    /// Snapshot node type the watched names belong to
    #[arg(long)]
    pub node_type: Option<String>,

    /// End the run at the first boundary that finds a leak
    #[arg(long)]
    pub stop_on_first_leak: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Show at most this many links of each retaining path (0 = all)
    #[arg(long)]
    pub max_path_length: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match commands::run::run(&cli).await {
        Ok(outcome) if outcome.success => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            if let Some(err @ leakwatch_core::Error::ScriptEvaluation { .. }) =
                e.downcast_ref::<leakwatch_core::Error>()
            {
                let exception = err.exception_text().unwrap_or_default();
                error!(exception = %exception, "{}", err);
            } else {
                error!("{:#}", e);
            }
            ExitCode::from(2)
        }
    }
}
