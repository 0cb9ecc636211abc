//! Disposable root/prefix environments, one per matrix case.
//!
//! The client locates its root and active environment through two
//! well-known variables. They are set on every spawned child command and
//! never on the harness process itself, so concurrent runs cannot observe
//! each other's overlay.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::error::{HarnessError, Result};
use crate::util::{display_command, unique_suffix};

pub const ROOT_PREFIX_VAR: &str = "MAMBA_ROOT_PREFIX";
pub const PREFIX_VAR: &str = "CONDA_PREFIX";

/// Marker file whose presence makes a directory a usable environment.
const HISTORY_MARKER: [&str; 2] = ["conda-meta", "history"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub root_path: PathBuf,
    pub prefix_path: PathBuf,
    pub env_name: String,
}

impl Environment {
    #[must_use]
    pub fn at(root_path: &Path, env_name: &str) -> Self {
        Self {
            root_path: root_path.to_path_buf(),
            prefix_path: root_path.join("envs").join(env_name),
            env_name: env_name.to_string(),
        }
    }

    /// Point a child command at this environment.
    pub fn apply_to(&self, command: &mut Command) {
        command
            .env(ROOT_PREFIX_VAR, &self.root_path)
            .env(PREFIX_VAR, &self.prefix_path);
    }

    #[must_use]
    pub fn history_marker(&self) -> PathBuf {
        HISTORY_MARKER
            .iter()
            .fold(self.prefix_path.clone(), |path, part| path.join(part))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.history_marker().is_file()
    }
}

/// Populates a freshly created environment so the client has a target.
pub trait BaselineInstaller {
    fn install(&self, env: &Environment) -> Result<()>;
}

impl<F> BaselineInstaller for F
where
    F: Fn(&Environment) -> Result<()>,
{
    fn install(&self, env: &Environment) -> Result<()> {
        self(env)
    }
}

/// Creates an empty environment with the client itself, without network.
#[derive(Debug, Clone)]
pub struct ClientBaseline {
    pub client_exe: PathBuf,
}

impl ClientBaseline {
    #[must_use]
    pub fn new(client_exe: impl Into<PathBuf>) -> Self {
        Self {
            client_exe: client_exe.into(),
        }
    }

    fn args(env: &Environment) -> Vec<String> {
        vec![
            "create".to_string(),
            "-n".to_string(),
            env.env_name.clone(),
            "--offline".to_string(),
            "-y".to_string(),
            "--no-rc".to_string(),
        ]
    }
}

impl BaselineInstaller for ClientBaseline {
    fn install(&self, env: &Environment) -> Result<()> {
        let args = Self::args(env);
        let rendered = display_command(&self.client_exe, &args);
        tracing::debug!(command = %rendered, "creating baseline environment");

        let mut command = Command::new(&self.client_exe);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        env.apply_to(&mut command);

        let output = command
            .output()
            .map_err(|error| HarnessError::sandbox(&env.root_path, format!("{rendered}: {error}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(HarnessError::sandbox(
            &env.root_path,
            format!(
                "{rendered} exited with {}: {}",
                output.status.code().unwrap_or(1),
                stderr.trim()
            ),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct SandboxManager<B> {
    base_dir: PathBuf,
    baseline: B,
}

impl<B: BaselineInstaller> SandboxManager<B> {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, baseline: B) -> Self {
        Self {
            base_dir: base_dir.into(),
            baseline,
        }
    }

    pub fn create(&self, env_name: &str) -> Result<Environment> {
        let root = self.base_dir.join(format!("tmproot{}", unique_suffix()));
        self.create_at(&root, env_name)
    }

    /// Build a sandbox at an explicit root. The root must not exist yet.
    pub fn create_at(&self, root: &Path, env_name: &str) -> Result<Environment> {
        if env_name.is_empty() || env_name.contains(['/', '\\']) {
            return Err(HarnessError::sandbox(
                root,
                format!("invalid environment name: {env_name:?}"),
            ));
        }
        if root.exists() {
            return Err(HarnessError::sandbox(root, "path already exists"));
        }

        let env = Environment::at(root, env_name);
        fs::create_dir_all(env.root_path.join("envs"))
            .map_err(|error| HarnessError::sandbox(root, error.to_string()))?;

        let installed = self.baseline.install(&env).and_then(|()| {
            if env.is_valid() {
                Ok(())
            } else {
                Err(HarnessError::sandbox(
                    &env.prefix_path,
                    format!("missing {}", env.history_marker().display()),
                ))
            }
        });
        if let Err(error) = installed {
            if let Err(cleanup) = fs::remove_dir_all(root) {
                tracing::warn!(root = %root.display(), %cleanup, "could not clean up failed sandbox");
            }
            return Err(error);
        }

        tracing::info!(root = %env.root_path.display(), env = %env.env_name, "sandbox created");
        Ok(env)
    }

    /// Remove the sandbox root. Failures are surfaced, never retried.
    pub fn destroy(&self, env: Environment) -> Result<()> {
        fs::remove_dir_all(&env.root_path).map_err(|source| HarnessError::SandboxTeardown {
            path: env.root_path.clone(),
            source,
        })?;
        tracing::info!(root = %env.root_path.display(), "sandbox destroyed");
        Ok(())
    }
}
