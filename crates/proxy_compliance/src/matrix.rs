//! The auth x TLS-verification matrix and the per-case cycle:
//! sandbox -> proxy -> rc-file -> install -> stop proxy -> correlate -> teardown.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info_span;

use crate::config::{ProxyAuthSpec, TlsVerifyMode, proxy_url, write_client_config};
use crate::correlate::{InterceptedLog, verify};
use crate::error::{HarnessError, Result};
use crate::invoker::TargetInvoker;
use crate::proxy::{ProxyController, ProxyPaths, StopOutcome};
use crate::sandbox::{BaselineInstaller, Environment, SandboxManager};
use crate::util::{CliOutput, now_utc_iso, unique_suffix, unused_tcp_port, write_string};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub auth_label: &'static str,
    pub auth: Option<ProxyAuthSpec>,
    pub verify_tls: bool,
}

impl TestCase {
    #[must_use]
    pub fn id(&self) -> String {
        let verify = if self.verify_tls { "verify" } else { "no-verify" };
        format!("{}/{verify}", self.auth_label)
    }

    #[must_use]
    pub fn tls_mode(&self, cert_path: &Path) -> TlsVerifyMode {
        if self.verify_tls {
            TlsVerifyMode::VerifyWithCertificate(cert_path.to_path_buf())
        } else {
            TlsVerifyMode::Disabled
        }
    }
}

/// No auth, plain basic auth, and an identity that needs percent-encoding in
/// the proxy URL; each with TLS verification on and off.
#[must_use]
pub fn default_matrix() -> Vec<TestCase> {
    let auths = [
        ("no-auth", None),
        ("basic-auth", Some(ProxyAuthSpec::new("foo", "bar"))),
        (
            "encoded-identity",
            Some(ProxyAuthSpec::new("user@example.com", "pass")),
        ),
    ];
    auths
        .into_iter()
        .flat_map(|(auth_label, auth)| {
            [true, false].into_iter().map(move |verify_tls| TestCase {
                auth_label,
                auth: auth.clone(),
                verify_tls,
            })
        })
        .collect()
}

/// Keep the cases whose ids appear in the comma separated `filter`.
pub fn select_cases(filter: Option<&str>) -> Result<Vec<TestCase>> {
    let all = default_matrix();
    let Some(filter) = filter else {
        return Ok(all);
    };
    let wanted = filter
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>();
    if let Some(unknown) = wanted
        .iter()
        .find(|id| !all.iter().any(|case| case.id() == **id))
    {
        return Err(HarnessError::invalid(format!("unknown case id: {unknown}")));
    }
    let selected = all
        .into_iter()
        .filter(|case| wanted.contains(&case.id().as_str()))
        .collect::<Vec<_>>();
    if selected.is_empty() {
        return Err(HarnessError::invalid("no cases selected"));
    }
    Ok(selected)
}

/// Everything one case needs, allocated fresh so nothing leaks between cases.
#[derive(Debug, Clone)]
pub struct CaseContext {
    pub case: TestCase,
    pub env_name: String,
    pub port: u16,
}

impl CaseContext {
    pub fn fresh(case: TestCase) -> Result<Self> {
        Ok(Self {
            case,
            env_name: format!("proxy{}", unique_suffix()),
            port: unused_tcp_port()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    /// The client fetched something the proxy never saw.
    Bypassed,
    Error,
}

impl CaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Bypassed => "bypassed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub proxy_user: Option<String>,
    pub ssl_verify: bool,
    pub port: Option<u16>,
    pub status: CaseStatus,
    pub error: Option<String>,
    pub missing: Vec<String>,
    pub fetched: usize,
    pub intercepted: usize,
    pub proxy_stop: Option<StopOutcome>,
    pub started_at: String,
    pub finished_at: String,
}

impl CaseResult {
    fn begin(case: &TestCase) -> Self {
        Self {
            case_id: case.id(),
            proxy_user: case.auth.as_ref().map(|auth| auth.username.clone()),
            ssl_verify: case.verify_tls,
            port: None,
            status: CaseStatus::Error,
            error: None,
            missing: Vec::new(),
            fetched: 0,
            intercepted: 0,
            proxy_stop: None,
            started_at: now_utc_iso(),
            finished_at: String::new(),
        }
    }

    fn finish(&mut self, outcome: Result<()>) {
        self.finished_at = now_utc_iso();
        let Err(error) = outcome else {
            self.status = CaseStatus::Passed;
            return;
        };
        self.error = Some(error.to_string());
        if let HarnessError::MissingUrl { missing, .. } = error {
            self.status = CaseStatus::Bypassed;
            self.missing = missing;
        } else {
            self.status = CaseStatus::Error;
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixReport {
    pub started_at: String,
    pub finished_at: String,
    pub passed: usize,
    pub failed: usize,
    pub cases: Vec<CaseResult>,
}

impl MatrixReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_string(path, &content)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&content)?)
    }
}

/// Shared collaborators; per-case state lives in [`CaseContext`].
pub struct Harness<B> {
    sandbox: SandboxManager<B>,
    proxy: ProxyController,
    invoker: TargetInvoker,
    ui: CliOutput,
}

impl<B: BaselineInstaller> Harness<B> {
    #[must_use]
    pub fn new(
        sandbox: SandboxManager<B>,
        proxy: ProxyController,
        invoker: TargetInvoker,
        ui: CliOutput,
    ) -> Self {
        Self {
            sandbox,
            proxy,
            invoker,
            ui,
        }
    }

    /// Run every case in order. A failing case never stops the rest.
    pub fn run_matrix(&self, cases: &[TestCase]) -> MatrixReport {
        let started_at = now_utc_iso();
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            let result = self.run_case(case.clone());
            match result.status {
                CaseStatus::Passed => self.ui.success(&format!(
                    "case={} status=ok fetched={} intercepted={}",
                    result.case_id, result.fetched, result.intercepted
                )),
                CaseStatus::Bypassed | CaseStatus::Error => self.ui.error(&format!(
                    "case={} status={} error={}",
                    result.case_id,
                    result.status.as_str(),
                    result.error.as_deref().unwrap_or("unknown")
                )),
            }
            results.push(result);
        }

        let passed = results.iter().filter(|result| result.passed()).count();
        MatrixReport {
            started_at,
            finished_at: now_utc_iso(),
            passed,
            failed: results.len() - passed,
            cases: results,
        }
    }

    pub fn run_case(&self, case: TestCase) -> CaseResult {
        let mut result = CaseResult::begin(&case);
        let _span = info_span!("matrix.case", case_id = result.case_id.as_str()).entered();
        self.ui.info(&format!("case={} starting", result.case_id));

        let outcome = CaseContext::fresh(case).and_then(|ctx| {
            result.port = Some(ctx.port);
            self.run_cycle(&ctx, &mut result)
        });
        if let Err(error) = &outcome {
            tracing::warn!(%error, "case failed");
        }
        result.finish(outcome);
        result
    }

    fn run_cycle(&self, ctx: &CaseContext, result: &mut CaseResult) -> Result<()> {
        let env = self.sandbox.create(&ctx.env_name)?;
        let exercised = self.exercise(ctx, &env, result);
        let teardown = self.sandbox.destroy(env);
        settle_teardown(exercised, teardown)
    }

    fn exercise(&self, ctx: &CaseContext, env: &Environment, result: &mut CaseResult) -> Result<()> {
        let auth = ctx.case.auth.as_ref();
        let paths = ProxyPaths::in_root(&env.root_path);
        let mut proxy = self.proxy.start(ctx.port, auth, &paths)?;

        let url = proxy_url(ctx.port, auth);
        let config_path = write_client_config(env, &url, ctx.case.tls_mode(&proxy.cert_path()))?;
        let fetched = self.invoker.run(env, &config_path, auth);

        // The dump is only complete once the proxy has shut down.
        let stopped = proxy.stop();
        let report = fetched?;
        result.proxy_stop = Some(stopped?);

        let log = InterceptedLog::from_path(proxy.dump_file_path())?;
        let correlation = verify(&report, &log);
        result.fetched = report.len();
        result.intercepted = log.len();
        correlation.map(|_| ())
    }
}

/// A failed teardown fails an otherwise passing case; an earlier failure
/// wins over it.
fn settle_teardown(exercised: Result<()>, teardown: Result<()>) -> Result<()> {
    match (exercised, teardown) {
        (Err(error), Err(teardown_error)) => {
            tracing::warn!(%teardown_error, "sandbox teardown also failed");
            Err(error)
        }
        (Err(error), Ok(())) | (Ok(()), Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}
