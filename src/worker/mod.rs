//! Worker orchestrator
//!
//! One isolated worker process per external meeting: join launches a
//! labelled container, leave removes it, and a periodic probe reaps
//! workers whose containers died. On boot, labelled containers from a
//! previous incarnation are re-adopted. A worker that exits with
//! transcripts triggers a fire-and-forget summary worker.

pub mod api;
pub mod runtime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use runtime::{ContainerRuntime, ContainerState, LaunchSpec, MEETING_ID_LABEL, MEET_WORKER_LABEL};

/// Supervision probe interval
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Worker status-probe timeout
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one tracked meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Pending,
    Admitted,
    Running,
    Exited,
}

/// One tracked meeting worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMeeting {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
    #[serde(skip)]
    pub container_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub status: MeetingStatus,
    #[serde(rename = "meetLink")]
    pub external_url: String,
    #[serde(rename = "botName")]
    pub bot_name: String,
    #[serde(rename = "transcriptCount")]
    pub transcript_count: u64,
    #[serde(skip)]
    pub status_port: u16,
}

/// Why a join was refused
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Maximum concurrent meetings reached ({0})")]
    CapReached(usize),
    #[error("Invalid meeting link: {0}")]
    BadLink(String),
    #[error(transparent)]
    Launch(#[from] anyhow::Error),
}

/// Shape of a worker's local status endpoint
#[derive(Debug, Deserialize)]
struct WorkerStatus {
    #[serde(default)]
    state: Option<MeetingStatus>,
    #[serde(default, rename = "transcriptCount")]
    transcript_count: u64,
}

/// Spawns, supervises, and reaps meeting workers
pub struct MeetingOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: WorkerConfig,
    meetings: Mutex<HashMap<String, WorkerMeeting>>,
    http: reqwest::Client,
}

impl MeetingOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: WorkerConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(STATUS_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self { runtime, config, meetings: Mutex::new(HashMap::new()), http })
    }

    /// Join an external meeting: allocate an id, enforce the concurrency
    /// cap, and launch a labelled worker container.
    pub async fn join_meeting(
        &self,
        external_url: &str,
        bot_name: Option<&str>,
    ) -> Result<String, JoinError> {
        if url::Url::parse(external_url).is_err() {
            return Err(JoinError::BadLink(external_url.to_string()));
        }

        let meeting_id = short_id();
        let bot_name = bot_name.unwrap_or("Voxbridge").to_string();

        // Cap check and port allocation under the lock; the launch itself
        // happens off the lock.
        let status_port = {
            let meetings = self.meetings.lock().await;
            let active = meetings.values().filter(|m| m.status != MeetingStatus::Exited).count();
            if active >= self.config.max_meetings {
                return Err(JoinError::CapReached(self.config.max_meetings));
            }
            let used: Vec<u16> = meetings.values().map(|m| m.status_port).collect();
            (self.config.status_port_base..self.config.status_port_base + 256)
                .find(|p| !used.contains(p))
                .context("No status port available")?
        };

        let mut labels = HashMap::new();
        labels.insert(MEET_WORKER_LABEL.to_string(), "1".to_string());
        labels.insert(MEETING_ID_LABEL.to_string(), meeting_id.clone());
        labels.insert("voxbridge.meet-link".to_string(), external_url.to_string());
        labels.insert("voxbridge.bot-name".to_string(), bot_name.clone());
        labels.insert("voxbridge.status-port".to_string(), status_port.to_string());

        let mut env = HashMap::new();
        env.insert("MEET_LINK".to_string(), external_url.to_string());
        env.insert("BOT_NAME".to_string(), bot_name.clone());
        env.insert("SESSION_KEY".to_string(), format!("meet-{}", meeting_id));

        let spec = LaunchSpec {
            image: self.config.image.clone(),
            name: format!("meet-{}", meeting_id),
            labels,
            env,
            status_port: Some(status_port),
        };

        let container_id = self
            .runtime
            .launch(&spec)
            .await
            .context("Failed to launch meeting worker")?;

        let meeting = WorkerMeeting {
            meeting_id: meeting_id.clone(),
            container_id,
            started_at: Utc::now(),
            status: MeetingStatus::Pending,
            external_url: external_url.to_string(),
            bot_name,
            transcript_count: 0,
            status_port,
        };

        let mut meetings = self.meetings.lock().await;
        // Launch raced with a pile of joins: enforce the cap again before
        // the insert becomes visible
        let active = meetings.values().filter(|m| m.status != MeetingStatus::Exited).count();
        if active >= self.config.max_meetings {
            let container = meeting.container_id.clone();
            drop(meetings);
            let _ = self.runtime.remove(&container).await;
            return Err(JoinError::CapReached(self.config.max_meetings));
        }
        meetings.insert(meeting_id.clone(), meeting);

        info!("Joined meeting {} ({})", meeting_id, external_url);
        Ok(meeting_id)
    }

    /// Leave a meeting: remove the container and drop the record.
    pub async fn leave_meeting(&self, meeting_id: &str) -> Result<()> {
        let meeting = {
            let mut meetings = self.meetings.lock().await;
            meetings.remove(meeting_id).context("Unknown meeting id")?
        };

        if let Err(e) = self.runtime.remove(&meeting.container_id).await {
            warn!("Failed to remove container for meeting {}: {:#}", meeting_id, e);
        }

        info!("Left meeting {}", meeting_id);
        Ok(())
    }

    /// Snapshot of tracked meetings.
    pub async fn list_meetings(&self) -> Vec<WorkerMeeting> {
        let meetings = self.meetings.lock().await;
        let mut list: Vec<WorkerMeeting> = meetings.values().cloned().collect();
        list.sort_by_key(|m| m.started_at);
        list
    }

    pub async fn active_count(&self) -> usize {
        let meetings = self.meetings.lock().await;
        meetings.values().filter(|m| m.status != MeetingStatus::Exited).count()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_meetings
    }

    /// Re-adopt labelled containers from a previous run; exited ones are
    /// removed.
    pub async fn reconcile(&self) -> Result<()> {
        let containers = self
            .runtime
            .list_labeled(MEET_WORKER_LABEL)
            .await
            .context("Failed to enumerate worker containers")?;

        for container in containers {
            let Some(meeting_id) = container.labels.get(MEETING_ID_LABEL).cloned() else {
                continue;
            };

            if !container.running {
                debug!("Removing exited worker container {}", container.id);
                let _ = self.runtime.remove(&container.id).await;
                continue;
            }

            let status_port = container
                .labels
                .get("voxbridge.status-port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(self.config.status_port_base);

            let mut meeting = WorkerMeeting {
                meeting_id: meeting_id.clone(),
                container_id: container.id.clone(),
                started_at: Utc::now(),
                status: MeetingStatus::Running,
                external_url: container
                    .labels
                    .get("voxbridge.meet-link")
                    .cloned()
                    .unwrap_or_default(),
                bot_name: container
                    .labels
                    .get("voxbridge.bot-name")
                    .cloned()
                    .unwrap_or_else(|| "Voxbridge".to_string()),
                transcript_count: 0,
                status_port,
            };

            // Best effort: refresh from the worker's own status endpoint
            if let Some(status) = self.probe_worker(&meeting).await {
                if let Some(state) = status.state {
                    meeting.status = state;
                }
                meeting.transcript_count = status.transcript_count;
            }

            info!("Re-adopted meeting {} from container {}", meeting_id, container.id);
            self.meetings.lock().await.insert(meeting_id, meeting);
        }

        Ok(())
    }

    /// Supervision loop: every probe interval, reap dead workers and
    /// refresh live ones.
    pub async fn run_supervisor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(PROBE_INTERVAL).await;
            self.probe_all().await;
        }
    }

    async fn probe_all(&self) {
        let snapshot = self.list_meetings().await;

        for meeting in snapshot {
            let state = match self.runtime.inspect(&meeting.container_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Inspect failed for meeting {}: {:#}", meeting.meeting_id, e);
                    continue;
                }
            };

            match state {
                ContainerState::Running => {
                    if let Some(status) = self.probe_worker(&meeting).await {
                        let mut meetings = self.meetings.lock().await;
                        if let Some(m) = meetings.get_mut(&meeting.meeting_id) {
                            if let Some(state) = status.state {
                                m.status = state;
                            }
                            m.transcript_count = status.transcript_count;
                        }
                    }
                }
                ContainerState::Exited(_) | ContainerState::Missing => {
                    let code = match state {
                        ContainerState::Exited(c) => c,
                        _ => -1,
                    };
                    info!("Worker for meeting {} exited (code {})", meeting.meeting_id, code);
                    if meeting.transcript_count > 0 {
                        self.spawn_summary_worker(&meeting).await;
                    }
                    if let Err(e) = self.leave_meeting(&meeting.meeting_id).await {
                        debug!("Reap of meeting {} raced a leave: {:#}", meeting.meeting_id, e);
                    }
                }
            }
        }
    }

    async fn probe_worker(&self, meeting: &WorkerMeeting) -> Option<WorkerStatus> {
        let url = format!("http://127.0.0.1:{}/status", meeting.status_port);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                debug!("Worker status for {} returned {}", meeting.meeting_id, response.status());
                None
            }
            Err(e) => {
                debug!("Worker status probe failed for {}: {:#}", meeting.meeting_id, e);
                None
            }
        }
    }

    /// Fire-and-forget summary worker over the meeting's persisted data.
    async fn spawn_summary_worker(&self, meeting: &WorkerMeeting) {
        let Some(image) = self.config.summary_image.clone() else {
            debug!("No summary image configured, skipping handoff");
            return;
        };

        let data_dir = self.config.data_dir.join(&meeting.meeting_id);
        let mut labels = HashMap::new();
        labels.insert("voxbridge.summary-worker".to_string(), "1".to_string());
        labels.insert(MEETING_ID_LABEL.to_string(), meeting.meeting_id.clone());

        let mut env = HashMap::new();
        env.insert("MEETING_DATA_DIR".to_string(), data_dir.display().to_string());
        env.insert("MEETING_ID".to_string(), meeting.meeting_id.clone());

        let spec = LaunchSpec {
            image,
            name: format!("meet-summary-{}", meeting.meeting_id),
            labels,
            env,
            status_port: None,
        };

        match self.runtime.launch(&spec).await {
            Ok(id) => info!("Summary worker {} launched for meeting {}", id, meeting.meeting_id),
            Err(e) => warn!("Summary worker launch failed for {}: {:#}", meeting.meeting_id, e),
        }
    }
}

/// Short random meeting identifier
fn short_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::ContainerInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory runtime standing in for Docker
    struct FakeRuntime {
        launched: AtomicUsize,
        removed: AtomicUsize,
        state: std::sync::Mutex<HashMap<String, ContainerState>>,
    }

    impl FakeRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launched: AtomicUsize::new(0),
                removed: AtomicUsize::new(0),
                state: std::sync::Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
            let n = self.launched.fetch_add(1, Ordering::SeqCst);
            let id = format!("ctr-{}-{}", spec.name, n);
            self.state.lock().unwrap().insert(id.clone(), ContainerState::Running);
            Ok(id)
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            self.state.lock().unwrap().remove(id);
            Ok(())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerState> {
            Ok(*self.state.lock().unwrap().get(id).unwrap_or(&ContainerState::Missing))
        }

        async fn list_labeled(&self, _label: &str) -> Result<Vec<ContainerInfo>> {
            Ok(Vec::new())
        }
    }

    fn test_config(max: usize) -> WorkerConfig {
        WorkerConfig { max_meetings: max, ..WorkerConfig::default() }
    }

    #[tokio::test]
    async fn join_and_leave_lifecycle() {
        let runtime = FakeRuntime::new();
        let orch = MeetingOrchestrator::new(runtime.clone(), test_config(2));

        let id = orch.join_meeting("https://meet.example/abc", Some("Bot")).await.unwrap();
        assert_eq!(id.len(), 8);
        assert_eq!(orch.active_count().await, 1);

        let meetings = orch.list_meetings().await;
        assert_eq!(meetings[0].bot_name, "Bot");
        assert_eq!(meetings[0].status, MeetingStatus::Pending);

        orch.leave_meeting(&id).await.unwrap();
        assert_eq!(orch.active_count().await, 0);
        assert_eq!(runtime.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cap_is_enforced_without_launching() {
        let runtime = FakeRuntime::new();
        let orch = MeetingOrchestrator::new(runtime.clone(), test_config(1));

        orch.join_meeting("https://meet.example/one", None).await.unwrap();
        let err = orch.join_meeting("https://meet.example/two", None).await.unwrap_err();
        assert!(err.to_string().contains("Maximum concurrent meetings"));

        // The second join never reached the runtime
        assert_eq!(runtime.launched.load(Ordering::SeqCst), 1);
        assert_eq!(orch.list_meetings().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_link_is_rejected_before_launch() {
        let runtime = FakeRuntime::new();
        let orch = MeetingOrchestrator::new(runtime.clone(), test_config(1));
        let err = orch.join_meeting("not a url", None).await.unwrap_err();
        assert!(matches!(err, JoinError::BadLink(_)));
        assert_eq!(runtime.launched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn leave_unknown_meeting_errors() {
        let runtime = FakeRuntime::new();
        let orch = MeetingOrchestrator::new(runtime, test_config(1));
        assert!(orch.leave_meeting("nope1234").await.is_err());
    }

    #[tokio::test]
    async fn dead_worker_is_reaped_on_probe() {
        let runtime = FakeRuntime::new();
        let orch = MeetingOrchestrator::new(runtime.clone(), test_config(2));

        let id = orch.join_meeting("https://meet.example/abc", None).await.unwrap();
        // Kill the container behind the orchestrator's back
        let container = orch.list_meetings().await[0].container_id.clone();
        runtime.state.lock().unwrap().insert(container, ContainerState::Exited(0));

        orch.probe_all().await;
        assert!(orch.list_meetings().await.is_empty(), "meeting {} should be reaped", id);
    }

    #[test]
    fn short_ids_are_distinct() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
