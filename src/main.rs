mod cli;

use clap::Parser;
use cli::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::run(cli) {
        tracing::error!(error = %e, retryable = e.is_retryable(), "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
