//! Run settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file (`fsi_filter.toml` in the working directory, or `--config <path>`),
//! then `FSI_`-prefixed environment variables (`__` separates sections, e.g.
//! `FSI_CLASSIFIER__MODEL=gpt-4o`). Command-line flags are applied on top by
//! `main`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "fsi_filter";
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathsConfig,
    pub classifier: ClassifierConfig,
    pub scrape: ScrapeConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the input tables (csv/json/ndjson).
    pub input_dir: PathBuf,
    /// Root of the text store written by `scrape`.
    pub text_dir: PathBuf,
    /// Decision store CSV.
    pub decisions: PathBuf,
    /// Combined output table.
    pub output: PathBuf,
    pub output_json: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("data/to-process"),
            text_dir: PathBuf::from("data/to-process/_scraped_text"),
            decisions: PathBuf::from("data/fsi_filter_results.csv"),
            output: PathBuf::from("data/FSI_included_combined.csv"),
            output_json: None,
        }
    }
}

/// Which rows a `classify` run sends to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReprocessPolicy {
    /// Every row, overwriting earlier decisions.
    All,
    /// Only rows without a stored decision.
    Missing,
    /// Rows without a decision, plus rows whose decision is Unknown.
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub model: String,
    pub base_url: String,
    /// Documents are head-truncated to this many characters before prompting.
    pub max_chars: usize,
    /// Pause before each remote call after the first.
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub temperature: f32,
    /// Ask the endpoint for a JSON object response.
    pub json_mode: bool,
    pub reprocess: ReprocessPolicy,
    /// Replaces the bundled instruction template.
    pub prompt_file: Option<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_chars: 12_000,
            delay_ms: 200,
            timeout_secs: 60,
            temperature: 0.1,
            json_mode: true,
            reprocess: ReprocessPolicy::All,
            prompt_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub timeout_secs: u64,
    pub pause_min_ms: u64,
    pub pause_max_ms: u64,
    pub user_agent: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            pause_min_ms: 1000,
            pause_max_ms: 2000,
            user_agent: concat!(
                "Mozilla/5.0 (compatible; fsi_filter/",
                env!("CARGO_PKG_VERSION"),
                "; research crawler)"
            )
            .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Columns placed first in the output, created blank when a table lacks them.
    pub leading_columns: Vec<String>,
    pub source_column: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let leading = [
            "City",
            "Country",
            "Name",
            "URL",
            "Facebook URL",
            "Twitter URL",
            "Instagram URL",
            "Food Sharing Activities",
            "How it is Shared",
            "Date Checked",
            "Comments",
            "Lat",
            "Lon",
        ];
        Self {
            leading_columns: leading.iter().map(|s| s.to_string()).collect(),
            source_column: "Source File".to_string(),
        }
    }
}

impl Settings {
    /// Load settings; an explicit `path` must exist, the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("FSI")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("output.leading_columns"),
            )
            .build()?
            .try_deserialize()
    }
}

/// Read the completion API credential once, at startup.
pub fn api_key_from_env() -> Result<String> {
    match std::env::var(API_KEY_VAR) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => bail!(
            "{} is not set. Export it or add `{}=sk-...` to a .env file in the working directory",
            API_KEY_VAR,
            API_KEY_VAR
        ),
    }
}
