mod config;
mod loader;
mod models;
mod pipeline;
mod reconcile;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::loader::load_symbols;
use crate::models::{Interval, Schema, Target};
use crate::pipeline::{Pipeline, RunPaths};
use crate::utils::fmt_count;

#[derive(Parser)]
#[command(name = "history-scraper", about = "Historical OHLCV table scraper", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

/// Which symbols to fetch and over what range.
#[derive(Args)]
struct TargetArgs {
    /// Comma-separated symbols, e.g. AAPL,MSFT,^GSPC
    #[arg(short, long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// CSV file with a `Symbol` column (e.g. a previous failed_tickers.csv)
    #[arg(short = 'f', long)]
    tickers_file: Option<PathBuf>,

    /// Range start, YYYY-MM-DD (default: Jan 1 this year)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Range end, YYYY-MM-DD (default: today)
    #[arg(long)]
    end: Option<NaiveDate>,

    #[arg(short, long, value_enum)]
    interval: Option<Interval>,

    #[arg(long, value_enum)]
    schema: Option<Schema>,

    /// Dataset output path (default: <data_dir>/<dataset_file>)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every symbol in turn with retries; write dataset + failed list
    Scrape {
        #[command(flatten)]
        targets: TargetArgs,

        /// Failed-symbol list path (default: <data_dir>/<failed_file>)
        #[arg(long)]
        failed_out: Option<PathBuf>,
    },

    /// Fetch all symbols concurrently, one attempt each
    Quick {
        #[command(flatten)]
        targets: TargetArgs,
    },

    /// Merge datasets in precedence order (first input wins on duplicates)
    Reconcile {
        #[arg(short, long, num_args = 2.., required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short, long)]
        out: PathBuf,
    },

    /// Print the history URL for a symbol
    Url {
        symbol: String,

        #[arg(long)]
        start: Option<NaiveDate>,

        #[arg(long)]
        end: Option<NaiveDate>,

        #[arg(short, long, value_enum)]
        interval: Option<Interval>,
    },
}

impl TargetArgs {
    /// Fold CLI overrides into config and collect the symbol list.
    fn apply(&self, config: &mut AppConfig) -> Result<Vec<String>> {
        if self.start.is_some() {
            config.pipeline.start = self.start;
        }
        if self.end.is_some() {
            config.pipeline.end = self.end;
        }
        if let Some(interval) = self.interval {
            config.pipeline.interval = interval;
        }
        if let Some(schema) = self.schema {
            config.pipeline.schema = schema;
        }

        let mut symbols: Vec<String> = self
            .symbols
            .iter()
            .map(|s| models::normalise_symbol(s))
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(path) = &self.tickers_file {
            symbols.extend(load_symbols(path)?);
        }
        anyhow::ensure!(!symbols.is_empty(), "No symbols given (use --symbols or --tickers-file)");
        Ok(symbols)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "history_scraper=info,warn",
        1 => "history_scraper=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command {
        Command::Scrape { targets, failed_out } => {
            let symbols = targets.apply(&mut config)?;
            let paths = RunPaths {
                dataset: targets.out.clone().unwrap_or_else(|| config.output.dataset_path()),
                failed: failed_out.unwrap_or_else(|| config.output.failed_path()),
                report: config.output.report_path(),
            };

            let report = Pipeline::new(config).scrape(&symbols, &paths).await?;

            println!("─────────────────────────────────");
            println!("  Total time : {:.2}s", report.elapsed_secs);
            println!("  Succeeded  : {}", fmt_count(report.succeeded));
            println!("  Failed     : {}", fmt_count(report.failed.len()));
            println!("  Rows       : {}", fmt_count(report.rows_written));
            println!("  Saved to   : {}", report.dataset_path.display());
            if let Some(path) = &report.failed_path {
                println!("  Failed list: {}", path.display());
            }
            println!("─────────────────────────────────");
        }

        Command::Quick { targets } => {
            let symbols = targets.apply(&mut config)?;
            let out = targets.out.clone().unwrap_or_else(|| config.output.dataset_path());
            let rows = Pipeline::new(config).quick(&symbols, &out).await?;
            println!("Saved {} rows to {}", fmt_count(rows), out.display());
        }

        Command::Reconcile { inputs, out } => {
            let stats = reconcile::reconcile_files(&inputs, &out)?;
            println!("─────────────────────────────────");
            println!("  Input rows : {}", fmt_count(stats.input_rows));
            println!("  Output rows: {}", fmt_count(stats.output_rows));
            println!("  Duplicates : {}", fmt_count(stats.duplicates));
            println!("  Saved to   : {}", out.display());
            println!("─────────────────────────────────");
        }

        Command::Url { symbol, start, end, interval } => {
            config.pipeline.start = start.or(config.pipeline.start);
            config.pipeline.end = end.or(config.pipeline.end);
            let (start, end) = config.pipeline.date_range()?;
            let target = Target::new(
                symbol,
                start,
                end,
                interval.unwrap_or(config.pipeline.interval),
            );
            let url = scraper::history_url(&config.scraper.base_url, &target)?;
            info!("{}", target);
            println!("{}", url);
        }
    }

    Ok(())
}
