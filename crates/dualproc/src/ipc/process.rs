//! Worker process management.
//!
//! Provides `WorkerConfig` for describing which executable to run and which
//! processor it should build, and `WorkerProcess` for the spawned child.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};

/// Environment variable overriding the worker executable path.
pub const WORKER_PATH_ENV: &str = "DUALPROC_WORKER_PATH";

/// File name of the bundled worker executable.
pub const WORKER_BINARY: &str = if cfg!(windows) {
    "dualproc-worker.exe"
} else {
    "dualproc-worker"
};

/// Default time allowed for the worker to build its processor.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How to start the worker process and which processor it should build.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker executable. `None` means look it up with [`WorkerConfig::find_worker_binary`].
    pub program: Option<PathBuf>,
    /// Extra command line arguments for the worker executable.
    pub args: Vec<String>,
    /// Extra environment variables for the worker process.
    pub env: Vec<(String, String)>,
    /// Name of the processor factory registered in the worker.
    pub factory: String,
    /// Arguments passed to the factory inside the worker.
    pub factory_args: Value,
    /// How long to wait for the worker to report `Ready`.
    pub handshake_timeout: Duration,
}

impl WorkerConfig {
    /// Run an explicit worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::locate()
        }
    }

    /// Run the `dualproc-worker` executable found on this machine.
    pub fn locate() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: Vec::new(),
            factory: String::new(),
            factory_args: Value::Null,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Select the processor factory and its arguments.
    pub fn factory(mut self, name: impl Into<String>, args: impl Into<Value>) -> Self {
        self.factory = name.into();
        self.factory_args = args.into();
        self
    }

    /// Append a command line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Resolve the executable to run.
    pub fn program_path(&self) -> Result<PathBuf> {
        match &self.program {
            Some(path) => Ok(path.clone()),
            None => Self::find_worker_binary(),
        }
    }

    /// Find the worker binary path.
    ///
    /// Looks in the following order:
    /// 1. `DUALPROC_WORKER_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. System PATH
    /// 4. `target/debug` or `target/release` of this workspace
    pub fn find_worker_binary() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let worker_path = exe_dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
            // Test binaries live one level down, in target/<profile>/deps.
            if let Some(profile_dir) = exe_dir.parent() {
                let worker_path = profile_dir.join(WORKER_BINARY);
                if worker_path.exists() {
                    return Ok(worker_path);
                }
            }
        }

        if let Ok(path) = which::which(WORKER_BINARY) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(WORKER_BINARY);
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(Error::Spawn(format!(
            "Could not find {}. Set {} or ensure it's in PATH.",
            WORKER_BINARY, WORKER_PATH_ENV
        )))
    }
}

/// A spawned worker process.
///
/// The child is killed when this handle is dropped.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
}

impl WorkerProcess {
    /// Spawn the worker with piped stdin/stdout.
    ///
    /// Stderr is inherited so worker logs reach the controller's terminal.
    pub fn spawn(config: &WorkerConfig) -> Result<(Self, ChildStdin, ChildStdout)> {
        let program = config.program_path()?;

        let mut command = Command::new(&program);
        command
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::Spawn(format!(
                "Failed to spawn worker process '{}': {}",
                program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to get worker stdout".to_string()))?;

        let pid = child.id();
        tracing::debug!(program = %program.display(), ?pid, "worker process spawned");

        Ok((Self { child, pid }, stdin, stdout))
    }

    /// Process ID of the worker, as observed at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the worker process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the worker to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child
            .wait()
            .await
            .map_err(|e| Error::Ipc(format!("Failed to wait for worker: {}", e)))
    }

    /// Kill the worker process and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill worker: {}", e);
            return Err(Error::Io(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let config = WorkerConfig::new("/opt/bin/worker")
            .factory("counter", json!({ "start": 3 }))
            .arg("--verbose")
            .env("DUALPROC_LOG", "debug")
            .handshake_timeout(Duration::from_secs(2));

        assert_eq!(config.program_path().unwrap(), PathBuf::from("/opt/bin/worker"));
        assert_eq!(config.factory, "counter");
        assert_eq!(config.factory_args, json!({ "start": 3 }));
        assert_eq!(config.args, vec!["--verbose".to_string()]);
        assert_eq!(config.env, vec![("DUALPROC_LOG".to_string(), "debug".to_string())]);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let config = WorkerConfig::new("/nonexistent/dualproc-worker-missing");
        match WorkerProcess::spawn(&config) {
            Err(Error::Spawn(msg)) => assert!(msg.contains("dualproc-worker-missing")),
            other => panic!("expected spawn error, got {:?}", other.map(|_| ())),
        }
    }
}
