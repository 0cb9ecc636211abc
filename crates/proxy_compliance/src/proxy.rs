//! Lifecycle of the external intercepting proxy.
//!
//! At most one proxy runs per controller. A started proxy is represented by
//! a [`ProxyProcessHandle`]; dropping a handle that was never stopped still
//! terminates the process, so an aborted case cannot leak a listener into
//! the next one.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use wait_timeout::ChildExt;

use crate::config::ProxyAuthSpec;
use crate::error::{HarnessError, Result};
use crate::util::{display_command, ensure_dir, write_string};

/// Certificate the proxy writes into its configuration directory once it is
/// ready to accept connections.
pub const CERT_FILE_NAME: &str = "mitmproxy-ca-cert.pem";
pub const ADDON_FILE_NAME: &str = "dump_proxy_connections.py";

const DUMP_ADDON: &str = include_str!("../assets/dump_proxy_connections.py");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// How a proxy process ended up dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The process had already exited before termination was requested.
    AlreadyExited,
    Graceful,
    Forced,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub exe: PathBuf,
    pub readiness_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            exe: PathBuf::from("mitmdump"),
            readiness_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(3),
        }
    }
}

/// Files the proxy reads and writes for one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPaths {
    pub conf_dir: PathBuf,
    pub dump_file: PathBuf,
    pub script: PathBuf,
    pub log_file: PathBuf,
}

impl ProxyPaths {
    #[must_use]
    pub fn in_root(root: &Path) -> Self {
        Self {
            conf_dir: root.join("mitmproxy"),
            dump_file: root.join("dump.json"),
            script: root.join(ADDON_FILE_NAME),
            log_file: root.join("mitmproxy.log"),
        }
    }

    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.conf_dir.join(CERT_FILE_NAME)
    }
}

#[derive(Debug)]
pub struct ProxyController {
    settings: ProxySettings,
    active: Arc<AtomicBool>,
}

impl ProxyController {
    #[must_use]
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn args(port: u16, auth: Option<&ProxyAuthSpec>, paths: &ProxyPaths) -> Vec<String> {
        let mut args = vec![
            "--listen-port".to_string(),
            port.to_string(),
            "--scripts".to_string(),
            paths.script.display().to_string(),
            "--set".to_string(),
            format!("outfile={}", paths.dump_file.display()),
            "--set".to_string(),
            format!("confdir={}", paths.conf_dir.display()),
        ];
        if let Some(auth) = auth {
            args.push("--proxyauth".to_string());
            args.push(auth.proxyauth_arg());
        }
        args
    }

    /// Launch the proxy and block until its certificate appears.
    pub fn start(
        &self,
        port: u16,
        auth: Option<&ProxyAuthSpec>,
        paths: &ProxyPaths,
    ) -> Result<ProxyProcessHandle> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(HarnessError::InvalidState {
                expected: LifecycleState::NotStarted.as_str(),
                actual: LifecycleState::Running.as_str(),
            });
        }

        let child = match self.spawn(port, auth, paths) {
            Ok(child) => child,
            Err(error) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        let mut handle = ProxyProcessHandle {
            pid: child.id(),
            child,
            listen_port: port,
            cert_dir_path: paths.conf_dir.clone(),
            dump_file_path: paths.dump_file.clone(),
            state: LifecycleState::Running,
            grace_period: self.settings.grace_period,
            active: Arc::clone(&self.active),
        };

        let cert_path = paths.cert_path();
        match wait_for_readiness(
            &mut handle.child,
            &cert_path,
            self.settings.readiness_timeout,
            self.settings.poll_interval,
        ) {
            Ok(waited) => {
                tracing::info!(
                    pid = handle.pid,
                    port,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "proxy ready"
                );
                Ok(handle)
            }
            Err(error) => {
                tracing::warn!(pid = handle.pid, port, %error, "proxy failed to become ready");
                handle.abort();
                Err(error)
            }
        }
    }

    fn spawn(&self, port: u16, auth: Option<&ProxyAuthSpec>, paths: &ProxyPaths) -> Result<Child> {
        ensure_dir(&paths.conf_dir)?;
        write_string(&paths.script, DUMP_ADDON)?;

        let log = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&paths.log_file)?;
        let log_err = log.try_clone()?;

        let args = Self::args(port, auth, paths);
        let mut logged = args.clone();
        if let (Some(auth), Some(last)) = (auth, logged.last_mut()) {
            *last = format!("{}:***", auth.username);
        }
        tracing::info!(command = %display_command(&self.settings.exe, &logged), "starting proxy");

        let child = Command::new(&self.settings.exe)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;
        Ok(child)
    }
}

/// Poll for the readiness artifact until `timeout` elapses.
fn wait_for_readiness(
    child: &mut Child,
    cert_path: &Path,
    timeout: Duration,
    interval: Duration,
) -> Result<Duration> {
    let started = Instant::now();
    loop {
        if cert_path.exists() {
            return Ok(started.elapsed());
        }
        if let Some(status) = child.try_wait()? {
            return Err(HarnessError::ProxyExitedEarly {
                exit_code: status.code(),
            });
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(HarnessError::ProxyStartupTimeout {
                cert_path: cert_path.to_path_buf(),
                timeout,
            });
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}

/// Ask the process to shut down. Returns `false` when the platform has no
/// polite signal and the process was killed outright.
#[cfg(unix)]
fn request_termination(child: &mut Child) -> std::io::Result<bool> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if !status.success() {
        // Already gone between the liveness check and the signal.
        child.try_wait()?;
    }
    Ok(true)
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> std::io::Result<bool> {
    child.kill()?;
    Ok(false)
}

fn terminate(child: &mut Child, grace_period: Duration) -> Result<StopOutcome> {
    if child.try_wait()?.is_some() {
        return Ok(StopOutcome::AlreadyExited);
    }
    if !request_termination(child)? {
        child.wait()?;
        return Ok(StopOutcome::Forced);
    }
    match child.wait_timeout(grace_period)? {
        Some(_) => Ok(StopOutcome::Graceful),
        None => {
            let _ = child.kill();
            child.wait()?;
            Ok(StopOutcome::Forced)
        }
    }
}

#[derive(Debug)]
pub struct ProxyProcessHandle {
    child: Child,
    pid: u32,
    listen_port: u16,
    cert_dir_path: PathBuf,
    dump_file_path: PathBuf,
    state: LifecycleState,
    grace_period: Duration,
    active: Arc<AtomicBool>,
}

impl ProxyProcessHandle {
    #[must_use]
    pub fn os_process_id(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir_path.join(CERT_FILE_NAME)
    }

    #[must_use]
    pub fn dump_file_path(&self) -> &Path {
        &self.dump_file_path
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Terminate gracefully, escalating to a kill after the grace period.
    ///
    /// The process is dead when this returns, including on error. Stopping a
    /// handle twice is a caller bug and yields `InvalidState`.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        if self.state != LifecycleState::Running {
            return Err(HarnessError::InvalidState {
                expected: LifecycleState::Running.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = LifecycleState::Stopping;
        let outcome = terminate(&mut self.child, self.grace_period);
        if outcome.is_err() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        self.release();
        match &outcome {
            Ok(how) => tracing::info!(pid = self.pid, outcome = ?how, "proxy stopped"),
            Err(error) => tracing::warn!(pid = self.pid, %error, "proxy stop failed; process killed"),
        }
        outcome
    }

    fn abort(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.release();
    }

    fn release(&mut self) {
        self.state = LifecycleState::Stopped;
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for ProxyProcessHandle {
    fn drop(&mut self) {
        if self.state == LifecycleState::Stopped {
            return;
        }
        tracing::warn!(pid = self.pid, "proxy handle dropped while running; terminating");
        if terminate(&mut self.child, self.grace_period).is_err() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        self.release();
    }
}
