//! carvex - Disk image carving and deleted-file recovery
//!
//! Signature carving over raw images, and metadata-driven recovery of
//! deleted files from ext2/3/4 and FAT volumes, both with streaming
//! deduplication.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use carvex::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    // Initialize logging
    let verbose = cli.verbose || config.general.verbose;
    let directive = if verbose { "carvex=debug" } else { "carvex=info" };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    if cli.log_json || config.general.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(false)
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Carve(args) => cli::run_carve(args, &config, cli.json).await?,
        Commands::Recover(args) => cli::run_recover(args, &config, cli.json).await?,
        Commands::Hash(args) => cli::run_hash(args, &config, cli.json).await?,
        Commands::Strings(args) => cli::run_strings(args, &config, cli.json).await?,
        Commands::Signatures => cli::print_signatures(cli.json)?,
        Commands::Config(args) => cli::run_config(args)?,
    }

    Ok(())
}
