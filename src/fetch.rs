use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use indicatif::ProgressBar;
use rand::Rng;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, info, warn};

use crate::config::ScrapeConfig;
use crate::rows::{RowId, Table};
use crate::text_store::{read_summary, write_summary, SummaryRow, TextStore, SUMMARY_FILE};

const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "canvas", "nav", "footer", "aside",
];
const MAX_REDIRECTS: usize = 10;

/// Scrape stats returned after completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    pub total: usize,
    pub ok: usize,
    pub errors: usize,
    /// Already on disk and not re-fetched.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeOptions {
    pub limit: Option<usize>,
    pub force: bool,
}

/// Result of one GET. `text` is only set on a 2xx response.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub final_url: Option<String>,
    pub status: Option<u16>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub error: Option<String>,
}

pub struct PageFetcher {
    client: reqwest::Client,
    pause_ms: (u64, u64),
}

impl PageFetcher {
    pub fn new(config: &ScrapeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("Failed to create HTTP client")?;
        let (lo, hi) = (config.pause_min_ms, config.pause_max_ms);
        Ok(Self {
            client,
            pause_ms: (lo.min(hi), lo.max(hi)),
        })
    }

    pub async fn fetch(&self, url: &str) -> Page {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                return Page {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let status = response.status();
        let mut page = Page {
            final_url: Some(response.url().to_string()),
            status: Some(status.as_u16()),
            ..Default::default()
        };
        if !status.is_success() {
            page.error = Some(format!("HTTP {}", status));
            return page;
        }

        match response.text().await {
            Ok(html) => {
                let doc = Html::parse_document(&html);
                page.title = extract_title(&doc);
                page.text = Some(visible_text(&doc));
            }
            Err(e) => page.error = Some(format!("Failed to read body: {}", e)),
        }
        page
    }

    async fn pause(&self) {
        let (lo, hi) = self.pause_ms;
        if hi == 0 {
            return;
        }
        let ms = rand::rng().random_range(lo..=hi);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Fetch every row URL of `tables` into `<text_dir>/<group>/<id>.txt` and keep
/// one `scrape_summary.csv` per group up to date.
pub async fn scrape_tables(
    fetcher: &PageFetcher,
    tables: &[Table],
    text_dir: &Path,
    opts: ScrapeOptions,
    pb: &ProgressBar,
) -> Result<ScrapeStats> {
    let mut stats = ScrapeStats::default();
    let mut seen: HashSet<RowId> = HashSet::new();
    let mut fetched = 0usize;

    for table in tables {
        let (rows, _) = table.rows();
        let group = table.group();
        if rows.is_empty() {
            info!("[{}] No URLs found.", group);
            continue;
        }
        info!("[{}] {} URL(s).", group, rows.len());

        let out_dir = text_dir.join(&group);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;
        let summary_path = out_dir.join(SUMMARY_FILE);
        let mut summary: IndexMap<String, SummaryRow> = if summary_path.exists() {
            read_summary(&summary_path)?
                .into_iter()
                .map(|r| (r.url.clone(), r))
                .collect()
        } else {
            IndexMap::new()
        };

        for row in &rows {
            if !seen.insert(row.id.clone()) {
                continue;
            }
            stats.total += 1;
            pb.inc(1);

            let txt_path = TextStore::path_for(text_dir, &group, &row.id);
            if txt_path.exists() && !opts.force {
                stats.skipped += 1;
                continue;
            }
            if opts.limit.is_some_and(|n| fetched >= n) {
                continue;
            }
            if fetched > 0 {
                fetcher.pause().await;
            }
            fetched += 1;

            pb.set_message(row.url.clone());
            debug!("GET {}", row.url);
            let page = fetcher.fetch(&row.url).await;
            let text_file = match (&page.text, &page.error) {
                (Some(text), None) => {
                    write_text(&txt_path, text)?;
                    stats.ok += 1;
                    Some(txt_path.display().to_string())
                }
                _ => {
                    stats.errors += 1;
                    if txt_path.exists() {
                        fs::remove_file(&txt_path)
                            .with_context(|| format!("Failed to remove {}", txt_path.display()))?;
                        debug!("Removed stale {}", txt_path.display());
                    }
                    warn!(
                        "[{}] {}: {}",
                        group,
                        row.url,
                        page.error.as_deref().unwrap_or("no body")
                    );
                    None
                }
            };

            summary.insert(
                row.url.clone(),
                SummaryRow {
                    row: row.index,
                    url: row.url.clone(),
                    final_url: page.final_url,
                    status: page.status,
                    error: page.error,
                    title: page.title,
                    text_file,
                    scraped_at: Some(Utc::now()),
                },
            );
        }

        let summary: Vec<SummaryRow> = summary.into_values().collect();
        write_summary(&summary_path, &summary)?;
        debug!("Saved {}", summary_path.display());
    }

    Ok(stats)
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

/// Visible text of a page, one text run per line.
fn visible_text(doc: &Html) -> String {
    let mut parts = Vec::new();
    collect_text(doc.root_element(), &mut parts);
    collapse_blank_lines(&parts.join("\n"))
}

fn collect_text(el: ElementRef<'_>, out: &mut Vec<String>) {
    if SKIPPED_TAGS.contains(&el.value().name()) {
        return;
    }
    for child in el.children() {
        match child.value() {
            Node::Text(t) => {
                let s = t.trim();
                if !s.is_empty() {
                    out.push(s.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}

fn collapse_blank_lines(text: &str) -> String {
    static BLANKS: OnceLock<Regex> = OnceLock::new();
    let re = BLANKS.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    re.replace_all(text, "\n\n").into_owned()
}

fn extract_title(doc: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}
