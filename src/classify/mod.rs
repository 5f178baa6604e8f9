pub mod parse;
pub mod prompt;
pub mod service;

use std::time::Duration;

use anyhow::Result;
use indicatif::ProgressBar;
use tracing::{debug, info, warn};

use crate::config::{ClassifierConfig, ReprocessPolicy};
use crate::decisions::{Decision, DecisionRecord, DecisionStore};
use crate::rows::{RowId, RowSet};
use crate::text_store::{FetchStatus, ScrapedText, TextStore};
use parse::parse_response;
use prompt::PromptTemplate;
use service::CompletionService;

pub const NO_TEXT: &str = "no text available";

/// Counters for one `classify` run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassifyStats {
    pub rows: usize,
    pub included: usize,
    pub excluded: usize,
    pub unknown: usize,
    /// Rows left alone by the reprocess policy.
    pub kept: usize,
    /// Rows never scraped; recorded as Unknown.
    pub no_entry: usize,
    pub remote_calls: usize,
}

impl ClassifyStats {
    pub fn print(&self) {
        println!(
            "Classified {} rows: {} include, {} exclude, {} unknown ({} remote calls).",
            self.included + self.excluded + self.unknown,
            self.included,
            self.excluded,
            self.unknown,
            self.remote_calls
        );
        if self.kept > 0 {
            println!("Skipped {} already decided.", self.kept);
        }
        if self.no_entry > 0 {
            println!("{} row(s) were never scraped and are marked unknown.", self.no_entry);
        }
    }
}

pub struct Classifier<S> {
    service: S,
    template: PromptTemplate,
    delay: Duration,
    reprocess: ReprocessPolicy,
}

impl<S: CompletionService> Classifier<S> {
    pub fn new(service: S, template: PromptTemplate, config: &ClassifierConfig) -> Self {
        Self {
            service,
            template,
            delay: Duration::from_millis(config.delay_ms),
            reprocess: config.reprocess,
        }
    }

    /// Decide one document. Never fails: every problem becomes an Unknown record.
    pub async fn classify(&self, text: &ScrapedText) -> DecisionRecord {
        let model = self.service.model();
        match &text.status {
            FetchStatus::Available => {}
            FetchStatus::Failed(err) => {
                return DecisionRecord::unknown(
                    text.id.clone(),
                    format!("{} (fetch failed: {})", NO_TEXT, err),
                    model,
                )
            }
            FetchStatus::Empty | FetchStatus::Missing => {
                return DecisionRecord::unknown(text.id.clone(), NO_TEXT, model)
            }
        }

        let prompt = self.template.render(&text.content);
        let raw = match self.service.complete(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{}: request failed ({}): {}", text.id, e.kind(), e);
                return DecisionRecord::unknown(
                    text.id.clone(),
                    format!("request failed ({}): {}", e.kind(), e),
                    model,
                );
            }
        };

        let parsed = parse_response(&raw);
        if parsed.decision == Decision::Unknown {
            warn!("{}: could not read a decision from the response", text.id);
        }
        DecisionRecord {
            id: text.id.clone(),
            decision: parsed.decision,
            confidence: parsed.confidence,
            rationale: parsed.rationale,
            organisation_name: parsed.organisation_name,
            organisation_type: parsed.organisation_type,
            evidence: parsed.evidence.join(" | "),
            is_ongoing: parsed.is_ongoing,
            site_owner_is_initiative: parsed.site_owner_is_initiative,
            notes: parsed.notes,
            model: model.to_string(),
            raw_response: raw,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn wants(&self, id: &RowId, store: &DecisionStore) -> bool {
        match (self.reprocess, store.get(id)) {
            (ReprocessPolicy::All, _) | (_, None) => true,
            (ReprocessPolicy::Missing, Some(_)) => false,
            (ReprocessPolicy::Unknown, Some(prev)) => prev.decision == Decision::Unknown,
        }
    }

    /// Classify rows in order, one remote call at a time, writing each
    /// decision to `store` as soon as it is made. Only store I/O errors abort.
    pub async fn run(
        &self,
        rows: &RowSet,
        texts: &TextStore,
        store: &mut DecisionStore,
        limit: Option<usize>,
        progress: &ProgressBar,
    ) -> Result<ClassifyStats> {
        let mut stats = ClassifyStats::default();
        let wanted: Vec<_> = rows
            .iter()
            .filter(|row| self.wants(&row.id, store))
            .collect();
        stats.kept = rows.len() - wanted.len();
        let todo: Vec<_> = wanted
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        progress.set_length(todo.len() as u64);

        for row in todo {
            stats.rows += 1;
            let text = match texts.lookup(&row.id) {
                Ok(text) => text,
                Err(e) => {
                    warn!("{}: {:#}", row.id, e);
                    let record = DecisionRecord::unknown(
                        row.id.clone(),
                        format!("{} (unreadable text: {:#})", NO_TEXT, e),
                        self.service.model(),
                    );
                    stats.unknown += 1;
                    store.upsert(record)?;
                    progress.inc(1);
                    continue;
                }
            };
            if text.status == FetchStatus::Missing {
                debug!("{} ({} row {}) was never scraped", row.id, row.source, row.index);
                stats.no_entry += 1;
            }

            if text.is_available() {
                if stats.remote_calls > 0 && !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                stats.remote_calls += 1;
            }

            let record = self.classify(&text).await;
            debug!("{} -> {}", record.id, record.decision);
            match record.decision {
                Decision::Include => stats.included += 1,
                Decision::Exclude => stats.excluded += 1,
                Decision::Unknown => stats.unknown += 1,
            }
            store.upsert(record)?;
            progress.inc(1);
        }

        store.compact()?;
        info!(
            "Classified {} row(s): {} include, {} exclude, {} unknown",
            stats.included + stats.excluded + stats.unknown,
            stats.included,
            stats.excluded,
            stats.unknown
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::prompt::Prompt;
    use super::service::ServiceError;
    use super::*;
    use crate::rows::Table;

    /// Replies keyed by a marker found in the prompt text.
    struct ScriptedService {
        replies: HashMap<&'static str, Result<String, ServiceError>>,
        calls: AtomicUsize,
    }

    impl ScriptedService {
        fn new(replies: Vec<(&'static str, Result<String, ServiceError>)>) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedService {
        async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .iter()
                .find(|(marker, _)| prompt.user.contains(*marker))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| Ok("no idea".to_string()))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn rows(urls: &[(&str, &str)]) -> RowSet {
        RowSet::from_tables(vec![Table {
            name: "City_results.csv".into(),
            stem: "City_results".into(),
            headers: vec!["Name".into(), "URL".into()],
            records: urls
                .iter()
                .map(|(n, u)| vec![n.to_string(), u.to_string()])
                .collect(),
        }])
    }

    fn write_text(root: &Path, url: &str, text: &str) {
        let path = TextStore::path_for(root, "City", &RowId::from_url(url));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn classifier(
        replies: Vec<(&'static str, Result<String, ServiceError>)>,
        reprocess: ReprocessPolicy,
    ) -> Classifier<ScriptedService> {
        let config = ClassifierConfig {
            delay_ms: 0,
            reprocess,
            ..Default::default()
        };
        Classifier::new(
            ScriptedService::new(replies),
            PromptTemplate::new("Classify.", 1000),
            &config,
        )
    }

    fn decision(store: &DecisionStore, url: &str) -> Decision {
        store.get(&RowId::from_url(url)).unwrap().decision
    }

    #[tokio::test]
    async fn include_empty_exclude_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = ("https://a.ie", "https://b.ie", "https://c.ie");
        write_text(dir.path(), a, "bank regulator supervising lenders");
        write_text(dir.path(), b, "");
        write_text(dir.path(), c, "retail shoe store with seasonal sales");

        let clf = classifier(
            vec![
                ("bank regulator", Ok("INCLUDE: meets criterion".into())),
                ("retail shoe store", Ok("EXCLUDE: not financial".into())),
            ],
            ReprocessPolicy::All,
        );
        let rows = rows(&[("A", a), ("B", b), ("C", c)]);
        let texts = TextStore::open(dir.path()).unwrap();
        let mut store = DecisionStore::open(&dir.path().join("decisions.csv")).unwrap();

        let stats = clf
            .run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(clf.service().calls(), 2);
        assert_eq!(stats.remote_calls, 2);
        assert_eq!(decision(&store, a), Decision::Include);
        assert_eq!(decision(&store, b), Decision::Unknown);
        assert_eq!(decision(&store, c), Decision::Exclude);
        assert_eq!(store.get(&RowId::from_url(b)).unwrap().rationale, NO_TEXT);
        assert_eq!(store.get(&RowId::from_url(a)).unwrap().rationale, "meets criterion");
        assert_eq!(
            store.get(&RowId::from_url(c)).unwrap().raw_response,
            "EXCLUDE: not financial"
        );
    }

    #[tokio::test]
    async fn failed_or_empty_text_never_reaches_the_service() {
        let clf = classifier(vec![], ReprocessPolicy::All);

        let empty = ScrapedText {
            id: RowId::new("x"),
            content: String::new(),
            status: FetchStatus::Empty,
        };
        let failed = ScrapedText {
            id: RowId::new("y"),
            content: String::new(),
            status: FetchStatus::Failed("HTTP 404".into()),
        };
        let r1 = clf.classify(&empty).await;
        let r2 = clf.classify(&failed).await;

        assert_eq!(clf.service().calls(), 0);
        assert_eq!(r1.decision, Decision::Unknown);
        assert_eq!(r2.decision, Decision::Unknown);
        assert!(r2.rationale.starts_with(NO_TEXT));
        assert!(r2.rationale.contains("HTTP 404"));
    }

    #[tokio::test]
    async fn timeout_is_recorded_and_the_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (d, e) = ("https://d.ie", "https://e.ie");
        write_text(dir.path(), d, "slow page");
        write_text(dir.path(), e, "community fridge open daily");

        let clf = classifier(
            vec![
                ("slow page", Err(ServiceError::Timeout("operation timed out".into()))),
                (
                    "community fridge",
                    Ok("{\"decision\":\"include\",\"confidence\":4,\"is_ongoing\":true,\"notes\":\"run by volunteers\"}".into()),
                ),
            ],
            ReprocessPolicy::All,
        );
        let rows = rows(&[("D", d), ("E", e)]);
        let texts = TextStore::open(dir.path()).unwrap();
        let mut store = DecisionStore::open(&dir.path().join("decisions.csv")).unwrap();

        let stats = clf
            .run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(clf.service().calls(), 2);
        let rec = store.get(&RowId::from_url(d)).unwrap();
        assert_eq!(rec.decision, Decision::Unknown);
        assert!(rec.rationale.contains("timeout"));
        assert_eq!(decision(&store, e), Decision::Include);
        let fridge = store.get(&RowId::from_url(e)).unwrap();
        assert_eq!(fridge.confidence, Some(4));
        assert_eq!(fridge.is_ongoing, Some(true));
        assert_eq!(fridge.site_owner_is_initiative, None);
        assert_eq!(fridge.notes, "run by volunteers");
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.included, 1);
    }

    #[tokio::test]
    async fn unparseable_reply_keeps_raw_text() {
        let clf = classifier(vec![("page", Ok("Hard to say.".into()))], ReprocessPolicy::All);
        let text = ScrapedText {
            id: RowId::new("z"),
            content: "page".into(),
            status: FetchStatus::Available,
        };
        let rec = clf.classify(&text).await;
        assert_eq!(rec.decision, Decision::Unknown);
        assert_eq!(rec.raw_response, "Hard to say.");
    }

    #[tokio::test]
    async fn rerun_with_same_replies_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = ("https://a.ie", "https://b.ie");
        write_text(dir.path(), a, "food bank");
        write_text(dir.path(), b, "shoe shop");
        let clf = classifier(
            vec![
                ("food bank", Ok("INCLUDE - runs a pantry".into())),
                ("shoe shop", Ok("EXCLUDE - commerce".into())),
            ],
            ReprocessPolicy::All,
        );
        let rows = rows(&[("A", a), ("B", b)]);
        let texts = TextStore::open(dir.path()).unwrap();
        let path = dir.path().join("decisions.csv");

        let mut store = DecisionStore::open(&path).unwrap();
        clf.run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();
        let first = fs::read_to_string(&path).unwrap();

        let mut store = DecisionStore::open(&path).unwrap();
        clf.run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();
        let second = fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(clf.service().calls(), 4);
        assert_eq!(store.get(&RowId::from_url(a)).unwrap().rationale, "runs a pantry");
    }

    #[tokio::test]
    async fn reprocess_policies_select_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = ("https://a.ie", "https://b.ie", "https://c.ie");
        write_text(dir.path(), a, "food bank");
        write_text(dir.path(), b, "flaky");
        write_text(dir.path(), c, "garden");
        let rows = rows(&[("A", a), ("B", b), ("C", c)]);
        let texts = TextStore::open(dir.path()).unwrap();
        let path = dir.path().join("decisions.csv");

        let mut store = DecisionStore::open(&path).unwrap();
        store
            .upsert(DecisionRecord::unknown(RowId::from_url(b), "request failed (timeout)", "m"))
            .unwrap();
        store
            .upsert(DecisionRecord {
                decision: Decision::Exclude,
                ..DecisionRecord::unknown(RowId::from_url(a), "earlier", "m")
            })
            .unwrap();

        let retry_unknown = classifier(
            vec![
                ("food bank", Ok("INCLUDE".into())),
                ("flaky", Ok("INCLUDE".into())),
                ("garden", Ok("INCLUDE".into())),
            ],
            ReprocessPolicy::Unknown,
        );
        let stats = retry_unknown
            .run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(retry_unknown.service().calls(), 2);
        assert_eq!(stats.kept, 1);
        assert_eq!(decision(&store, a), Decision::Exclude);
        assert_eq!(decision(&store, b), Decision::Include);

        let only_missing = classifier(
            vec![("food bank", Ok("INCLUDE".into()))],
            ReprocessPolicy::Missing,
        );
        let stats = only_missing
            .run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(only_missing.service().calls(), 0);
        assert_eq!(stats.kept, 3);
    }

    #[tokio::test]
    async fn never_scraped_rows_are_unknown_and_limit_applies() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = ("https://a.ie", "https://b.ie", "https://c.ie");
        write_text(dir.path(), b, "food bank");
        write_text(dir.path(), c, "food bank too");
        let rows = rows(&[("A", a), ("B", b), ("C", c)]);
        let texts = TextStore::open(dir.path()).unwrap();
        let mut store = DecisionStore::open(&dir.path().join("d.csv")).unwrap();
        let clf = classifier(vec![("food bank", Ok("INCLUDE".into()))], ReprocessPolicy::All);

        let stats = clf
            .run(&rows, &texts, &mut store, Some(2), &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(stats.no_entry, 1);
        assert_eq!(clf.service().calls(), 1);
        let never = store.get(&RowId::from_url(a)).unwrap();
        assert_eq!(never.decision, Decision::Unknown);
        assert_eq!(never.rationale, NO_TEXT);
        assert!(store.get(&RowId::from_url(c)).is_none());
        assert_eq!(decision(&store, b), Decision::Include);
    }

    #[tokio::test]
    async fn only_row_never_scraped_still_gets_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let rows = rows(&[("A", "https://a.ie")]);
        let texts = TextStore::open(&dir.path().join("scraped")).unwrap();
        let mut store = DecisionStore::open(&dir.path().join("d.csv")).unwrap();
        let clf = classifier(vec![], ReprocessPolicy::All);

        clf.run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(clf.service().calls(), 0);
        assert_eq!(decision(&store, "https://a.ie"), Decision::Unknown);
        let reloaded = DecisionStore::open(&dir.path().join("d.csv")).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_text_is_unknown_and_the_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = ("https://a.ie", "https://b.ie");
        write_text(dir.path(), a, "food bank");
        write_text(dir.path(), b, "community garden");
        let texts = TextStore::open(dir.path()).unwrap();
        fs::remove_file(TextStore::path_for(dir.path(), "City", &RowId::from_url(a))).unwrap();

        let rows = rows(&[("A", a), ("B", b)]);
        let mut store = DecisionStore::open(&dir.path().join("d.csv")).unwrap();
        let clf = classifier(vec![("community garden", Ok("INCLUDE".into()))], ReprocessPolicy::All);

        let stats = clf
            .run(&rows, &texts, &mut store, None, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(clf.service().calls(), 1);
        let broken = store.get(&RowId::from_url(a)).unwrap();
        assert_eq!(broken.decision, Decision::Unknown);
        assert!(broken.rationale.contains("unreadable text"));
        assert_eq!(decision(&store, b), Decision::Include);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.included, 1);
    }

    #[tokio::test]
    async fn kept_rows_are_counted_past_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let urls = ["https://a.ie", "https://b.ie", "https://c.ie", "https://d.ie"];
        for u in urls {
            write_text(dir.path(), u, "food bank");
        }
        let rows = rows(&[("A", urls[0]), ("B", urls[1]), ("C", urls[2]), ("D", urls[3])]);
        let texts = TextStore::open(dir.path()).unwrap();
        let mut store = DecisionStore::open(&dir.path().join("d.csv")).unwrap();
        for u in &urls[1..] {
            store
                .upsert(DecisionRecord {
                    decision: Decision::Exclude,
                    ..DecisionRecord::unknown(RowId::from_url(u), "earlier", "m")
                })
                .unwrap();
        }

        let clf = classifier(vec![("food bank", Ok("INCLUDE".into()))], ReprocessPolicy::Missing);
        let stats = clf
            .run(&rows, &texts, &mut store, Some(1), &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(stats.kept, 3);
        assert_eq!(stats.rows, 1);
        assert_eq!(decision(&store, urls[0]), Decision::Include);
    }
}
