use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use infrac::{run, Cli, FAILURE_EXIT};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over the flags when set
    let level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug) // Show target module in debug mode
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(FAILURE_EXIT)
        }
    }
}
