use clap::Parser;

use pagepulse::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli::init_logging(&cli.log_level, cli.debug);

    if let Err(err) = cli::run(cli).await {
        tracing::error!(error = %format!("{err:#}"), "command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
