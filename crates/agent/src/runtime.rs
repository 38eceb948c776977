//! Container runtime seam.
//!
//! The pipeline only talks to [`ServiceRuntime`]. Production gateways use
//! [`DockerCompose`], which drives `docker compose -f <descriptor>` with
//! structured argument vectors; nothing goes through a shell.

use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Operations the update pipeline needs from the service runtime.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Pull one image reference.
    async fn pull(&self, image: &str) -> AgentResult<()>;

    /// Stop every service in the descriptor.
    async fn stop(&self) -> AgentResult<()>;

    /// Start every service in the descriptor.
    async fn start(&self) -> AgentResult<()>;

    /// Service name to runtime state (e.g. "running", "exited").
    async fn service_states(&self) -> AgentResult<BTreeMap<String, String>>;

    /// Run an allow-listed program with a prepared argument vector.
    async fn exec(&self, program: &str, args: &[String]) -> AgentResult<()>;
}

/// `docker compose` against the gateway's service descriptor.
pub struct DockerCompose {
    compose_file: PathBuf,
    timeout: Duration,
}

impl DockerCompose {
    pub fn new(compose_file: PathBuf, timeout: Duration) -> Self {
        Self {
            compose_file,
            timeout,
        }
    }

    fn compose_args(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    async fn output(&self, program: &str, args: &[String]) -> AgentResult<String> {
        tracing::debug!(program, ?args, "Running command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                AgentError::Runtime(format!(
                    "{program} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AgentError::Runtime(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Runtime(format!(
                "{program} {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ServiceRuntime for DockerCompose {
    async fn pull(&self, image: &str) -> AgentResult<()> {
        self.output("docker", &["pull".to_string(), image.to_string()])
            .await
            .map(|_| ())
    }

    async fn stop(&self) -> AgentResult<()> {
        self.output("docker", &self.compose_args(&["stop"]))
            .await
            .map(|_| ())
    }

    async fn start(&self) -> AgentResult<()> {
        self.output("docker", &self.compose_args(&["up", "-d", "--remove-orphans"]))
            .await
            .map(|_| ())
    }

    async fn service_states(&self) -> AgentResult<BTreeMap<String, String>> {
        let stdout = self
            .output("docker", &self.compose_args(&["ps", "--all", "--format", "json"]))
            .await?;
        parse_ps_output(&stdout)
    }

    async fn exec(&self, program: &str, args: &[String]) -> AgentResult<()> {
        self.output(program, args).await.map(|_| ())
    }
}

/// Parse `docker compose ps --format json`.
///
/// Older releases print one JSON array, newer ones one object per line.
pub fn parse_ps_output(stdout: &str) -> AgentResult<BTreeMap<String, String>> {
    let trimmed = stdout.trim();
    let entries: Vec<serde_json::Value> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<serde_json::Value>)
            .collect::<Result<_, _>>()?
    };

    let mut states = BTreeMap::new();
    for entry in entries {
        let service = entry.get("Service").and_then(|v| v.as_str());
        let state = entry.get("State").and_then(|v| v.as_str());
        if let (Some(service), Some(state)) = (service, state) {
            states.insert(service.to_string(), state.to_lowercase());
        }
    }
    Ok(states)
}
