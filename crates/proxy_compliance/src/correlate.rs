//! Proxy-traversal check: every URL the client fetched must have been seen by
//! the proxy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;

use crate::error::{HarnessError, Result};
use crate::invoker::FetchReport;
use crate::util::{OutputIntegration, ensure_exists, output_for};

#[derive(Debug, Clone, Args)]
pub struct CorrelateArgs {
    /// JSON output captured from the client (`--json`).
    #[arg(long)]
    pub report: PathBuf,

    /// URL dump written by the proxy.
    #[arg(long)]
    pub dump: PathBuf,
}

/// URLs recorded by the proxy, one per line, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterceptedLog {
    urls: Vec<String>,
}

impl InterceptedLog {
    #[must_use]
    pub fn parse(content: &str) -> Self {
        Self {
            urls: content
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        }
    }

    /// Read the dump file. Only valid after the proxy has been stopped,
    /// since the proxy flushes on shutdown. A missing file means the proxy
    /// saw no traffic at all.
    pub fn from_path(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "proxy dump file missing; treating as empty");
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Correlation {
    pub fetched: usize,
    pub intercepted: usize,
}

/// Require every fetched URL to appear in `log` (exact match, any order).
///
/// All missing URLs are reported, in report order and without duplicates.
pub fn verify(report: &FetchReport, log: &InterceptedLog) -> Result<Correlation> {
    let seen = log.urls.iter().map(String::as_str).collect::<HashSet<_>>();
    let mut reported = HashSet::new();
    let missing = report
        .urls()
        .filter(|url| !seen.contains(url) && reported.insert(*url))
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();

    if missing.is_empty() {
        tracing::info!(
            fetched = report.len(),
            intercepted = log.len(),
            "every fetched url went through the proxy"
        );
        Ok(Correlation {
            fetched: report.len(),
            intercepted: log.len(),
        })
    } else {
        tracing::warn!(
            fetched = report.len(),
            intercepted = log.len(),
            missing = missing.len(),
            "fetched urls bypassed the proxy"
        );
        Err(HarnessError::MissingUrl {
            missing,
            total: report.len(),
        })
    }
}

/// Check a previously captured client report against a proxy dump.
pub fn run_correlate(args: CorrelateArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    ensure_exists(&args.report)?;
    let report = FetchReport::from_path(&args.report)?;
    let log = InterceptedLog::from_path(&args.dump)?;
    let outcome = verify(&report, &log);

    if integration.should_emit_json() {
        let missing = match &outcome {
            Err(HarnessError::MissingUrl { missing, .. }) => missing.clone(),
            _ => Vec::new(),
        };
        println!(
            "{}",
            serde_json::json!({
                "command": "correlate",
                "status": if outcome.is_ok() { "ok" } else { "failed" },
                "fetched": report.len(),
                "intercepted": log.len(),
                "missing": missing,
                "integration": integration,
            })
        );
    }

    let correlation = outcome?;
    ui.success(&format!(
        "all {} fetched url(s) went through the proxy ({} intercepted)",
        correlation.fetched, correlation.intercepted
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;
    use tempfile::tempdir;
    use tracing_subscriber::layer::SubscriberExt;

    use super::{CorrelateArgs, InterceptedLog, run_correlate, verify};
    use crate::error::HarnessError;
    use crate::invoker::{FetchAction, FetchReport};

    fn report(urls: &[&str]) -> FetchReport {
        FetchReport {
            fetches: urls
                .iter()
                .map(|url| FetchAction {
                    url: (*url).to_string(),
                })
                .collect(),
        }
    }

    struct FieldVisitor(Vec<(String, String)>);

    impl tracing::field::Visit for FieldVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{value:?}")));
        }
        fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
            self.0.push((field.name().to_string(), value.to_string()));
        }
    }

    #[derive(Clone, Default)]
    struct EventCapture {
        events: Arc<Mutex<Vec<(tracing::Level, HashMap<String, String>)>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCapture {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut visitor = FieldVisitor(Vec::new());
            event.record(&mut visitor);
            self.events
                .lock()
                .expect("capture lock")
                .push((*event.metadata().level(), visitor.0.into_iter().collect()));
        }
    }

    fn with_captured_events<R>(
        f: impl FnOnce() -> R,
    ) -> (R, Vec<(tracing::Level, HashMap<String, String>)>) {
        let capture = EventCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let result = tracing::subscriber::with_default(subscriber, f);
        let events = capture.events.lock().expect("capture lock").clone();
        (result, events)
    }

    #[test]
    fn verify_logs_counts_for_pass_and_bypass() {
        let log = InterceptedLog::parse("https://a/1\n");

        let (passed, events) = with_captured_events(|| verify(&report(&["https://a/1"]), &log));
        assert!(passed.is_ok());
        let (level, fields) = events.last().expect("pass event");
        assert_eq!(*level, tracing::Level::INFO);
        assert_eq!(fields.get("fetched").map(String::as_str), Some("1"));
        assert_eq!(fields.get("intercepted").map(String::as_str), Some("1"));

        let (bypassed, events) =
            with_captured_events(|| verify(&report(&["https://a/1", "https://a/2"]), &log));
        assert!(bypassed.is_err());
        let (level, fields) = events.last().expect("bypass event");
        assert_eq!(*level, tracing::Level::WARN);
        assert_eq!(fields.get("fetched").map(String::as_str), Some("2"));
        assert_eq!(fields.get("missing").map(String::as_str), Some("1"));
    }

    #[test]
    fn all_fetches_intercepted() {
        let log = InterceptedLog::parse(
            "https://repo.example/repodata.json\nhttps://repo.example/xtl-0.7.tar.bz2\nhttps://repo.example/xtensor-0.24.tar.bz2\n",
        );
        let result = verify(
            &report(&[
                "https://repo.example/xtensor-0.24.tar.bz2",
                "https://repo.example/xtl-0.7.tar.bz2",
            ]),
            &log,
        )
        .expect("complete traversal");
        assert_eq!(result.fetched, 2);
        assert_eq!(result.intercepted, 3);
    }

    #[test]
    fn collects_every_missing_url_once() {
        let log = InterceptedLog::parse("https://a/1\n");
        let error = verify(
            &report(&["https://a/2", "https://a/1", "https://a/3", "https://a/2"]),
            &log,
        )
        .expect_err("bypass");
        match error {
            HarnessError::MissingUrl { missing, total } => {
                assert_eq!(missing, vec!["https://a/2", "https://a/3"]);
                assert_eq!(total, 4);
            }
            other => panic!("expected MissingUrl, got {other}"),
        }
    }

    #[test]
    fn matching_is_exact() {
        let log = InterceptedLog::parse("https://a/x.tar.bz2?token=1\r\n");
        assert!(verify(&report(&["https://a/x.tar.bz2"]), &log).is_err());
        assert!(verify(&report(&["https://a/x.tar.bz2?token=1"]), &log).is_ok());
    }

    #[test]
    fn empty_report_always_passes() {
        assert!(verify(&report(&[]), &InterceptedLog::default()).is_ok());
    }

    #[test]
    fn missing_dump_file_reads_as_empty() {
        let temp = tempdir().expect("tempdir");
        let log = InterceptedLog::from_path(&temp.path().join("dump.json")).expect("read");
        assert!(log.is_empty());
    }

    #[test]
    fn run_correlate_reads_files_from_disk() {
        let temp = tempdir().expect("tempdir");
        let report_path = temp.path().join("client.json");
        let dump_path = temp.path().join("dump.json");
        std::fs::write(
            &report_path,
            r#"{"actions":{"FETCH":[{"url":"https://repo.example/xtensor-0.24.tar.bz2"}]}}"#,
        )
        .expect("write report");
        std::fs::write(&dump_path, "https://repo.example/xtensor-0.24.tar.bz2\n")
            .expect("write dump");

        run_correlate(CorrelateArgs {
            report: report_path.clone(),
            dump: dump_path.clone(),
        })
        .expect("complete traversal");

        std::fs::write(&dump_path, "https://repo.example/other\n").expect("rewrite dump");
        let error = run_correlate(CorrelateArgs {
            report: report_path,
            dump: dump_path,
        })
        .expect_err("bypass");
        assert!(matches!(error, HarnessError::MissingUrl { .. }));
    }

    proptest! {
        #[test]
        fn verify_passes_iff_report_is_subset_of_log(
            log_ids in proptest::collection::vec(0u8..16, 0..12),
            fetch_ids in proptest::collection::vec(0u8..16, 0..8),
        ) {
            let log_text = log_ids
                .iter()
                .map(|id| format!("https://repo.example/pkg-{id}.tar.bz2"))
                .collect::<Vec<_>>()
                .join("\n");
            let urls = fetch_ids
                .iter()
                .map(|id| format!("https://repo.example/pkg-{id}.tar.bz2"))
                .collect::<Vec<_>>();
            let fetch_report = FetchReport {
                fetches: urls.iter().map(|url| FetchAction { url: url.clone() }).collect(),
            };
            let subset = fetch_ids.iter().all(|id| log_ids.contains(id));
            prop_assert_eq!(verify(&fetch_report, &InterceptedLog::parse(&log_text)).is_ok(), subset);
        }
    }
}
