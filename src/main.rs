use anyhow::Result;
use clap::Parser;
use scbench::{cli::Cli, controller};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; RUST_LOG wins over --debug
fn init_tracing(debug: bool) {
    let default_level = if debug { Level::TRACE } else { Level::WARN };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = controller::BenchConfig::from_cli(args)?;
    controller::install_signal_handlers()?;
    let summary = controller::run(config)?;

    // Exit like the measured program did
    match summary.exit_status {
        Some(code) if code != 0 => std::process::exit(code),
        _ => Ok(()),
    }
}
