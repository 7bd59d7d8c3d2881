use anyhow::{Context, Result};
use clap::Parser;

use jobctl::cli::{self, Cli};
use jobctl::config::Settings;
use jobctl::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    cli::apply_overrides(&args, &mut settings);
    logging::init(&settings.log_filter, args.log_json)?;

    let outcome = cli::run(args, settings).await?;
    if !outcome.is_success() {
        // The reason was already printed with the run's events.
        std::process::exit(1);
    }
    Ok(())
}
