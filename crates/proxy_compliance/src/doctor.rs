use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use clap::Args;
use wait_timeout::ChildExt;

use crate::error::{HarnessError, Result};
use crate::util::{CliOutput, OutputIntegration, output_for, resolve_command};

const VERSION_TIMEOUT_SECONDS: u64 = 20;

#[derive(Debug, Clone, Args)]
pub struct DoctorArgs {
    #[arg(long = "client", default_value = "micromamba")]
    pub client: PathBuf,

    #[arg(long = "proxy", default_value = "mitmdump")]
    pub proxy: PathBuf,
}

fn check_executable(label: &str, command: &Path, ui: &CliOutput) -> Result<PathBuf> {
    match resolve_command(command) {
        Ok(path) => {
            ui.success(&format!("{label} available: {}", path.display()));
            Ok(path)
        }
        Err(error) => {
            ui.error(&format!("{label} missing: {}", command.display()));
            Err(error)
        }
    }
}

/// Run `<exe> --version` with a bounded wait and return its first line.
fn probe_version(exe: &Path) -> Result<String> {
    let mut child = Command::new(exe)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    match child.wait_timeout(Duration::from_secs(VERSION_TIMEOUT_SECONDS))? {
        Some(status) if status.success() => {
            let output = child.wait_with_output()?;
            Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string())
        }
        Some(status) => Err(HarnessError::exit(
            status.code().unwrap_or(1),
            format!("{} --version failed", exe.display()),
        )),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(HarnessError::exit(
                124,
                format!(
                    "{} --version timed out after {VERSION_TIMEOUT_SECONDS}s",
                    exe.display()
                ),
            ))
        }
    }
}

pub fn run_doctor(args: DoctorArgs) -> Result<()> {
    let integration = OutputIntegration::detect();
    let ui = output_for(&integration);

    ui.rule(Some("proxy_compliance doctor"));
    ui.info(&format!(
        "fastapi_output mode={} agent={} ci={} tty={}",
        integration.fastapi_mode,
        integration.fastapi_agent,
        integration.fastapi_ci,
        integration.fastapi_tty
    ));

    let client = check_executable("client", &args.client, &ui)?;
    let proxy = check_executable("proxy", &args.proxy, &ui)?;

    let client_version = probe_version(&client)?;
    ui.info(&format!("client version: {client_version}"));
    let proxy_version = probe_version(&proxy)?;
    ui.info(&format!("proxy version: {proxy_version}"));

    if integration.should_emit_json() {
        println!(
            "{}",
            serde_json::json!({
                "command": "doctor",
                "status": "ok",
                "client": client.display().to_string(),
                "client_version": client_version,
                "proxy": proxy.display().to_string(),
                "proxy_version": proxy_version,
                "integration": integration,
            })
        );
    }

    ui.success("doctor checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{DoctorArgs, run_doctor};
    use crate::error::HarnessError;

    #[test]
    fn missing_client_is_reported() {
        let error = run_doctor(DoctorArgs {
            client: PathBuf::from("no-such-client-for-proxy-compliance"),
            proxy: PathBuf::from("no-such-proxy-for-proxy-compliance"),
        })
        .expect_err("missing client");
        match error {
            HarnessError::MissingCommand { command } => {
                assert_eq!(command, "no-such-client-for-proxy-compliance");
            }
            other => panic!("expected MissingCommand, got {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn version_probe_reads_first_line() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-tool");
        std::fs::write(&script, "#!/bin/sh\necho 'fake-tool 1.2.3'\necho detail\n")
            .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let version = super::probe_version(&script).expect("version");
        assert_eq!(version, "fake-tool 1.2.3");
    }

    #[cfg(unix)]
    #[test]
    fn version_probe_surfaces_failure_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("broken-tool");
        std::fs::write(&script, "#!/bin/sh\nexit 5\n").expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let error = super::probe_version(&script).expect_err("failing probe");
        assert_eq!(error.exit_code(), 5);
    }
}
