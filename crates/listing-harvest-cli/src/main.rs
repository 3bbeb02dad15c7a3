//! listing-harvest: entry point.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use listing_harvest::ListingStore;
use listing_harvest_cli::config::{load_config, resolve_output_path, DEFAULT_TARGETS};
use listing_harvest_cli::run::{run, RunOptions};

#[derive(Parser)]
#[command(
    name = "listing-harvest",
    about = "Harvest paginated listing results into a deduplicated CSV store",
    version
)]
struct Cli {
    /// Path to a JSON harvest config.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every make/model in the targets file.
    Run {
        /// CSV with Make and Model columns.
        #[arg(short, long, default_value = DEFAULT_TARGETS)]
        targets: PathBuf,

        /// Listing store CSV. Also reads LISTING_HARVEST_OUTPUT.
        #[arg(short, long)]
        output: Option<String>,

        /// Override the load-more click limit per target.
        #[arg(long)]
        max_pages: Option<u64>,

        /// Show the browser window.
        #[arg(long)]
        headed: bool,

        /// Write the session summary as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Summarize the listing store.
    Stats {
        /// Listing store CSV. Also reads LISTING_HARVEST_OUTPUT.
        #[arg(short, long)]
        output: Option<String>,

        /// Print the rows whose vin column matches.
        #[arg(long)]
        vin: Option<String>,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove exact duplicate rows from the listing store.
    Dedupe {
        /// Listing store CSV. Also reads LISTING_HARVEST_OUTPUT.
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   listing-harvest completions bash > ~/.local/share/bash-completion/completions/listing-harvest
    ///   listing-harvest completions zsh > ~/.zfunc/_listing-harvest
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            targets,
            output,
            max_pages,
            headed,
            report,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(max_pages) = max_pages {
                config.max_pages = max_pages;
            }
            let output_path = PathBuf::from(resolve_output_path(output.as_deref()));

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, stopping after the current epoch");
                    on_signal.cancel();
                }
            });

            let summary = run(
                RunOptions {
                    targets_path: targets,
                    output_path,
                    config,
                    headed,
                },
                cancel,
            )
            .await?;

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
                tracing::info!("Wrote session summary to {}", path.display());
            }
        }

        Commands::Stats { output, vin, json } => {
            let store = ListingStore::open(resolve_output_path(output.as_deref()))?;

            if let Some(vin) = vin {
                let rows = store.rows_where("vin", &vin);
                if rows.is_empty() {
                    println!("No listing with vin {vin}");
                } else {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                return Ok(());
            }

            let stats = store.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Store:   {}", store.path().display());
                println!("Rows:    {}", stats.rows);
                println!("Columns: {}", stats.columns.join(", "));
                for (model, count) in &stats.per_model {
                    println!("  {model}: {count}");
                }
            }
        }

        Commands::Dedupe { output } => {
            let mut store = ListingStore::open(resolve_output_path(output.as_deref()))?;
            let before = store.len();
            let removed = store.compact()?;
            if removed > 0 {
                println!("Removed {removed} duplicate rows; {} remain (was {before}).", store.len());
            } else {
                println!("No duplicate rows in {}.", store.path().display());
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "listing-harvest", &mut std::io::stdout());
        }
    }

    Ok(())
}
