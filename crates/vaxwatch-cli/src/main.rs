use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod report;
mod run;

use run::{RunArgs, ScopeArg, SiteArg};

#[derive(Debug, Parser)]
#[command(name = "vaxwatch")]
#[command(about = "Vaccine appointment availability scraper")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check every location of one site family and report the results
    Run {
        /// Site family to check
        #[arg(long, value_enum)]
        site: SiteArg,

        /// Portal credential scope; ignored for the slot API
        #[arg(long, value_enum, default_value = "seattle")]
        scope: ScopeArg,

        /// Only check stores with `store_number % segments == segment`
        #[arg(long, default_value_t = 0)]
        segment: u32,

        /// Number of segments the slot-API locations are split into (0 = no split)
        #[arg(long, default_value_t = 0)]
        segments: u32,

        /// List the selected locations without scraping anything
        #[arg(long)]
        dry_run: bool,

        /// Keep running, starting a new round every SECS seconds
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run {
            site,
            scope,
            segment,
            segments,
            dry_run,
            interval,
        }) => {
            let config = vaxwatch_core::load_app_config()?;
            let env_filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
            tracing_subscriber::fmt().with_env_filter(env_filter).init();

            let args = RunArgs {
                site: site.into(),
                scope,
                segment,
                segments,
                dry_run,
                interval: interval.map(Duration::from_secs),
            };
            run::run_command(&config, &args).await?;
        }
        None => Cli::command().print_help()?,
    }

    Ok(())
}
