mod classify;
mod config;
mod convert;
mod dataset;
mod decisions;
mod fetch;
mod rows;
mod stats;
mod text_store;
mod utils;
mod workbook;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::classify::prompt::{Prompt, PromptTemplate};
use crate::classify::service::{CompletionService, OpenAiService};
use crate::classify::Classifier;
use crate::config::{ClassifierConfig, ReprocessPolicy, Settings};
use crate::convert::TableFormat;
use crate::dataset::Dataset;
use crate::decisions::DecisionStore;
use crate::fetch::{PageFetcher, ScrapeOptions};
use crate::rows::RowSet;
use crate::text_store::TextStore;
use crate::utils::format_duration;

#[derive(Parser)]
#[command(
    name = "fsi_filter",
    version,
    about = "Scrape listed websites, classify them with a language model and keep the matches"
)]
struct Cli {
    /// Settings file (default: ./fsi_filter.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert JSON/NDJSON exports into <name>_results tables
    Convert {
        /// Directory with .json/.jsonl/.ndjson files
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Output table format
        #[arg(short, long, value_enum, default_value_t = TableFormat::Csv)]
        format: TableFormat,
    },
    /// Fetch every row URL and store its visible text
    Scrape {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        text_dir: Option<PathBuf>,
        /// Max pages to fetch (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Re-fetch pages that already have a text file
        #[arg(long)]
        force: bool,
    },
    /// Send scraped text to the model and record a decision per row
    Classify {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        text_dir: Option<PathBuf>,
        #[arg(short, long)]
        decisions: Option<PathBuf>,
        /// Max rows to classify (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Which rows to send again when decisions already exist
        #[arg(short, long, value_enum)]
        reprocess: Option<ReprocessPolicy>,
        #[arg(short, long)]
        model: Option<String>,
        /// Instruction template replacing the bundled one
        #[arg(short, long)]
        prompt_file: Option<PathBuf>,
    },
    /// Join rows with their Include decisions into one table
    Build {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short, long)]
        decisions: Option<PathBuf>,
        /// Combined table; a .xlsx path writes a workbook, anything else CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Also write the table as JSON
        #[arg(short, long)]
        json: Option<PathBuf>,
    },
    /// Count table rows per file and per folder
    Count {
        /// Folders to scan (default: the input directory)
        dirs: Vec<PathBuf>,
        /// Write entry_counts_detailed.csv and entry_counts_summary.csv here
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },
    /// Send one short request to confirm the API key and endpoint work
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let result = match cli.command {
        Commands::Convert { input, format } => {
            let dir = input.unwrap_or(settings.paths.input_dir);
            let stats = convert::convert_dir(&dir, format)?;
            println!(
                "Converted {} file(s) ({} rows), {} failed.",
                stats.converted, stats.rows, stats.failed
            );
            Ok(())
        }
        Commands::Scrape {
            input,
            text_dir,
            limit,
            force,
        } => {
            let input = input.unwrap_or(settings.paths.input_dir);
            let text_dir = text_dir.unwrap_or(settings.paths.text_dir);
            let tables = rows::load_tables(&input)?;
            let planned = RowSet::from_tables(tables.iter().cloned());
            if planned.is_empty() {
                println!("No URLs found in {}.", input.display());
                return Ok(());
            }
            let unique = planned.len();

            println!("Scraping {} URL(s) into {}...", unique, text_dir.display());
            let fetcher = PageFetcher::new(&settings.scrape)?;
            let pb = progress_bar(unique as u64)?;
            let stats = fetch::scrape_tables(
                &fetcher,
                &tables,
                &text_dir,
                ScrapeOptions { limit, force },
                &pb,
            )
            .await?;
            pb.finish_and_clear();
            println!(
                "Done: {} URLs ({} ok, {} errors, {} already scraped).",
                stats.total, stats.ok, stats.errors, stats.skipped
            );
            Ok(())
        }
        Commands::Classify {
            input,
            text_dir,
            decisions,
            limit,
            reprocess,
            model,
            prompt_file,
        } => {
            let api_key = config::api_key_from_env()?;
            let cfg = &mut settings.classifier;
            if let Some(r) = reprocess {
                cfg.reprocess = r;
            }
            if let Some(m) = model {
                cfg.model = m;
            }
            if prompt_file.is_some() {
                cfg.prompt_file = prompt_file;
            }

            let rows = RowSet::load_dir(&input.unwrap_or(settings.paths.input_dir))?;
            let texts = TextStore::open(&text_dir.unwrap_or(settings.paths.text_dir))?;
            let mut store = DecisionStore::open(&decisions.unwrap_or(settings.paths.decisions))?;

            let template = PromptTemplate::load(cfg.prompt_file.as_deref(), cfg.max_chars)?;
            let service = OpenAiService::new(api_key, cfg)?;
            let classifier = Classifier::new(service, template, cfg);

            println!(
                "Classifying {} row(s) with {} ({} scraped texts in {})...",
                rows.len(),
                classifier.service().model(),
                texts.len(),
                texts.root().display()
            );
            let pb = progress_bar(rows.len() as u64)?;
            let stats = classifier.run(&rows, &texts, &mut store, limit, &pb).await?;
            pb.finish_and_clear();
            stats.print();
            println!("Decisions saved to {}", store.path().display());
            Ok(())
        }
        Commands::Build {
            input,
            decisions,
            output,
            json,
        } => {
            let rows = RowSet::load_dir(&input.unwrap_or(settings.paths.input_dir))?;
            let store = DecisionStore::open(&decisions.unwrap_or(settings.paths.decisions))?;
            if store.is_empty() {
                warn!("No decisions in {}; run `classify` first", store.path().display());
            }
            let counts = store.counts();
            info!(
                "Decisions on file: {} include, {} exclude, {} unknown",
                counts.include, counts.exclude, counts.unknown
            );

            let dataset = Dataset::build(&rows, &store, &settings.output);
            let output = output.unwrap_or(settings.paths.output);
            dataset.write(&output)?;
            if let Some(path) = json.or(settings.paths.output_json) {
                dataset.write_json(&path)?;
            }
            if dataset.is_empty() {
                println!("No rows were decided Include; wrote the header only.");
            }
            println!(
                "Included {} of {} row(s) -> {}",
                dataset.len(),
                rows.len(),
                output.display()
            );
            if !dataset.orphans.is_empty() {
                println!(
                    "Ignored {} decision(s) with no matching input row.",
                    dataset.orphans.len()
                );
            }
            Ok(())
        }
        Commands::Count { dirs, out_dir } => {
            let dirs = if dirs.is_empty() {
                vec![settings.paths.input_dir]
            } else {
                dirs
            };
            let counts = stats::count_rows(&dirs)?;
            let summary = stats::summarise(&counts);
            stats::print_counts(&counts, &summary);
            if let Some(out) = out_dir {
                stats::write_counts(&out, &counts, &summary)?;
                println!("\nSaved counts to {}", out.display());
            }
            Ok(())
        }
        Commands::Check => {
            let api_key = config::api_key_from_env()?;
            let cfg = ClassifierConfig {
                temperature: 0.0,
                json_mode: false,
                ..settings.classifier
            };
            let service = OpenAiService::new(api_key, &cfg)?;
            let prompt = Prompt {
                system: "You are concise and precise, using British English.".to_string(),
                user: "In one sentence, tell me you received my API call.".to_string(),
            };
            let reply = service
                .complete(&prompt)
                .await
                .with_context(|| format!("Request to {} failed", cfg.base_url))?;
            println!("{} replied: {}", service.model(), reply.trim());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn progress_bar(len: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {wide_msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}
