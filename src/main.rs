mod cli;
mod console;
mod engine;
mod model;
mod orchestrator;
mod text_summary;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr; RUST_LOG overrides `--log-level` when set.
fn init_tracing(level: &str) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    init_tracing(&args.log_level);

    match cli::run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}
