use std::path::PathBuf;

use clap::Args;

use crate::error::{HarnessError, Result};
use crate::invoker::{DEFAULT_CHANNEL, DEFAULT_PACKAGE, InvokerSettings, TargetInvoker};
use crate::matrix::{Harness, MatrixReport, TestCase, select_cases};
use crate::proxy::{ProxyController, ProxySettings};
use crate::sandbox::{ClientBaseline, SandboxManager};
use crate::util::{
    CliOutput, OutputIntegration, absolute_path, ensure_dir, now_compact_timestamp, output_for,
    parse_duration_value, resolve_command,
};

#[derive(Debug, Clone, Args)]
pub struct SuiteArgs {
    /// Client under test (path or command name).
    #[arg(long = "client", default_value = "micromamba")]
    pub client: PathBuf,

    /// Intercepting proxy executable (path or command name).
    #[arg(long = "proxy", default_value = "mitmdump")]
    pub proxy: PathBuf,

    #[arg(long, default_value = DEFAULT_PACKAGE)]
    pub package: String,

    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Do not pass a channel to the client.
    #[arg(long)]
    pub no_channel: bool,

    /// Directory receiving the per-case sandbox roots.
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Comma separated case ids (see `list-cases`).
    #[arg(long)]
    pub cases: Option<String>,

    #[arg(long = "readiness-timeout", default_value = "30s")]
    pub readiness_timeout: String,

    #[arg(long = "poll-interval", default_value = "1s")]
    pub poll_interval: String,

    #[arg(long = "grace-period", default_value = "3s")]
    pub grace_period: String,

    #[arg(long = "client-timeout", default_value = "600s")]
    pub client_timeout: String,

    /// Force the revocation-check opt-out regardless of platform.
    #[arg(long)]
    pub ssl_no_revoke: bool,

    /// Extra arguments appended to the client's install command.
    #[arg(long = "client-arg", allow_hyphen_values = true)]
    pub client_args: Vec<String>,

    /// Write the matrix report as JSON.
    #[arg(long = "report-json")]
    pub report_json: Option<PathBuf>,
}

/// Fully resolved settings for one matrix run.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub work_dir: PathBuf,
    pub proxy: ProxySettings,
    pub invoker: InvokerSettings,
}

impl HarnessSettings {
    pub fn from_args(args: &SuiteArgs) -> Result<Self> {
        let work_dir = match &args.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("proxy_compliance"),
        };
        ensure_dir(&work_dir)?;

        let readiness_timeout = parse_duration_value(&args.readiness_timeout)?;
        let poll_interval = parse_duration_value(&args.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(HarnessError::invalid("poll interval must be positive"));
        }

        Ok(Self {
            work_dir: absolute_path(&work_dir)?,
            proxy: ProxySettings {
                exe: resolve_command(&args.proxy)?,
                readiness_timeout,
                poll_interval,
                grace_period: parse_duration_value(&args.grace_period)?,
            },
            invoker: InvokerSettings {
                client_exe: resolve_command(&args.client)?,
                package: args.package.clone(),
                channel: (!args.no_channel).then(|| args.channel.clone()),
                ssl_no_revoke: args.ssl_no_revoke || cfg!(windows),
                timeout: parse_duration_value(&args.client_timeout)?,
                extra_args: args.client_args.clone(),
            },
        })
    }
}

pub fn run_suite(args: SuiteArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    let cases = select_cases(args.cases.as_deref())?;
    let settings = HarnessSettings::from_args(&args)?;

    ui.rule(Some("proxy compliance"));
    ui.info(&format!("client={}", settings.invoker.client_exe.display()));
    ui.info(&format!("proxy={}", settings.proxy.exe.display()));
    ui.info(&format!("package={}", settings.invoker.package));
    ui.info(&format!("work_dir={}", settings.work_dir.display()));
    ui.info(&format!("cases={}", cases.len()));

    let report = run_matrix_with(&settings, &cases, ui.clone());

    let report_path = args.report_json.clone().unwrap_or_else(|| {
        settings
            .work_dir
            .join(format!("matrix_{}.json", now_compact_timestamp()))
    });
    report.write_to_path(&report_path)?;

    ui.info(&format!(
        "matrix counts passed={} failed={}",
        report.passed, report.failed
    ));
    ui.info(&format!("report={}", report_path.display()));

    if integration.should_emit_json() {
        println!(
            "{}",
            serde_json::json!({
                "command": "suite",
                "status": if report.is_success() { "ok" } else { "failed" },
                "passed": report.passed,
                "failed": report.failed,
                "report": report_path.display().to_string(),
                "integration": integration,
            })
        );
    }

    suite_outcome_error(&report).map_or(Ok(()), Err)
}

/// Build the collaborators from `settings` and run `cases`.
pub fn run_matrix_with(
    settings: &HarnessSettings,
    cases: &[TestCase],
    ui: CliOutput,
) -> MatrixReport {
    let sandbox = SandboxManager::new(
        settings.work_dir.clone(),
        ClientBaseline::new(settings.invoker.client_exe.clone()),
    );
    let harness = Harness::new(
        sandbox,
        ProxyController::new(settings.proxy.clone()),
        TargetInvoker::new(settings.invoker.clone()),
        ui,
    );
    harness.run_matrix(cases)
}

fn suite_outcome_error(report: &MatrixReport) -> Option<HarnessError> {
    if report.is_success() {
        return None;
    }
    let failed = report
        .cases
        .iter()
        .filter(|case| !case.passed())
        .map(|case| case.case_id.as_str())
        .collect::<Vec<_>>();
    Some(HarnessError::exit(
        1,
        format!("{} case(s) failed: {}", failed.len(), failed.join(", ")),
    ))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{HarnessSettings, SuiteArgs, suite_outcome_error};
    use crate::matrix::{CaseResult, CaseStatus, MatrixReport};

    #[derive(Debug, Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: SuiteArgs,
    }

    fn case(id: &str, status: CaseStatus) -> CaseResult {
        CaseResult {
            case_id: id.to_string(),
            proxy_user: None,
            ssl_verify: true,
            port: Some(1),
            status,
            error: None,
            missing: Vec::new(),
            fetched: 0,
            intercepted: 0,
            proxy_stop: None,
            started_at: String::new(),
            finished_at: String::new(),
        }
    }

    #[test]
    fn defaults_match_reference_timings() {
        let wrapper = Wrapper::parse_from(["suite"]);
        assert_eq!(wrapper.args.readiness_timeout, "30s");
        assert_eq!(wrapper.args.poll_interval, "1s");
        assert_eq!(wrapper.args.grace_period, "3s");
        assert_eq!(wrapper.args.package, "xtensor");
        assert_eq!(wrapper.args.client, PathBuf::from("micromamba"));
    }

    #[test]
    fn settings_reject_missing_proxy_executable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("no-mitmdump");
        let wrapper = Wrapper::parse_from([
            "suite",
            "--proxy",
            missing.to_str().expect("utf8 path"),
            "--work-dir",
            temp.path().to_str().expect("utf8 path"),
        ]);
        assert!(HarnessSettings::from_args(&wrapper.args).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let wrapper = Wrapper::parse_from([
            "suite",
            "--poll-interval",
            "0ms",
            "--work-dir",
            temp.path().to_str().expect("utf8 path"),
        ]);
        let error = HarnessSettings::from_args(&wrapper.args).expect_err("zero interval");
        assert!(error.to_string().contains("poll interval"));
    }

    #[test]
    fn outcome_error_names_failed_cases() {
        let report = MatrixReport {
            started_at: String::new(),
            finished_at: String::new(),
            passed: 1,
            failed: 2,
            cases: vec![
                case("no-auth/verify", CaseStatus::Passed),
                case("basic-auth/verify", CaseStatus::Bypassed),
                case("basic-auth/no-verify", CaseStatus::Error),
            ],
        };
        let error = suite_outcome_error(&report).expect("failed report");
        assert_eq!(error.exit_code(), 1);
        assert_eq!(
            error.to_string(),
            "2 case(s) failed: basic-auth/verify, basic-auth/no-verify"
        );

        let ok = MatrixReport {
            failed: 0,
            cases: vec![case("no-auth/verify", CaseStatus::Passed)],
            ..report
        };
        assert!(suite_outcome_error(&ok).is_none());
    }
}
