//! Container runtime interface
//!
//! The orchestrator drives workers through this trait so the container
//! engine stays swappable; the shipped implementation shells out to the
//! Docker CLI. A local-process implementation is acceptable on platforms
//! without containers as long as it provides the same lifecycle verbs and
//! label-based enumeration.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Label identifying meeting-worker containers
pub const MEET_WORKER_LABEL: &str = "voxbridge.meet-worker";

/// Label carrying the meeting id
pub const MEETING_ID_LABEL: &str = "voxbridge.meeting-id";

/// Launch request for one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub name: String,
    /// Labels attached for later enumeration
    pub labels: HashMap<String, String>,
    /// Environment passed to the worker process
    pub env: HashMap<String, String>,
    /// Host port mapped to the worker's local status endpoint
    pub status_port: Option<u16>,
}

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i32),
    Missing,
}

/// Enumeration result for labelled containers
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container; returns the container id.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Stop and remove a container.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Inspect a container's run state.
    async fn inspect(&self, id: &str) -> Result<ContainerState>;

    /// List containers carrying a label key.
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerInfo>>;
}

/// Docker CLI implementation
pub struct DockerCli {
    /// Override for DOCKER_HOST (e.g. a custom socket path)
    socket: Option<String>,
}

impl DockerCli {
    pub fn new(socket: Option<String>) -> Self {
        Self { socket }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(socket) = &self.socket {
            cmd.env("DOCKER_HOST", socket);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!("docker {}", args.join(" "));
        let output = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to invoke docker")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker {} failed: {}", args.first().map(String::as_str).unwrap_or(""), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(port) = spec.status_port {
            args.push("-p".into());
            args.push(format!("127.0.0.1:{}:8080", port));
        }
        args.push(spec.image.clone());

        self.run(&args).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.run(&["rm".into(), "-f".into(), id.to_string()]).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let output = self
            .run(&[
                "inspect".into(),
                "--format".into(),
                "{{.State.Running}} {{.State.ExitCode}}".into(),
                id.to_string(),
            ])
            .await;

        let line = match output {
            Ok(line) => line,
            // A vanished container is a state, not an error
            Err(_) => return Ok(ContainerState::Missing),
        };

        let mut parts = line.split_whitespace();
        let running = parts.next() == Some("true");
        let exit_code: i32 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);

        Ok(if running { ContainerState::Running } else { ContainerState::Exited(exit_code) })
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let output = self
            .run(&[
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                format!("label={}", label),
                "--format".into(),
                "{{.ID}}\t{{.State}}\t{{.Labels}}".into(),
            ])
            .await?;

        let mut containers = Vec::new();
        for line in output.lines() {
            let mut fields = line.split('\t');
            let (Some(id), Some(state)) = (fields.next(), fields.next()) else { continue };
            let labels = fields
                .next()
                .unwrap_or("")
                .split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    Some((k.trim().to_string(), v.trim().to_string()))
                })
                .collect();
            containers.push(ContainerInfo {
                id: id.to_string(),
                running: state == "running",
                labels,
            });
        }
        Ok(containers)
    }
}
