pub mod keystore;
pub mod memory;
pub mod sweeper;

pub use keystore::KeystoreTaskMonitor;
pub use memory::InMemoryTaskMonitor;
pub use sweeper::TimeoutSweeper;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedSender;

use crate::infrastructure::keystore::KeystoreError;

pub type TaskId = i64;

/// How long a task may stay in Processing before the sweep times it out.
pub const DEFAULT_TIMEOUT_WINDOW: Duration = Duration::from_secs(40 * 60);

/// Fixed message stamped on timed-out tasks.
pub const TIMEOUT_MESSAGE: &str = "task timed out";

/// Content fingerprint used as the idempotency key: two submissions with
/// byte-identical text always map to the same key.
pub fn content_fingerprint(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{:x}", digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::TimedOut),
            _ => Err(()),
        }
    }
}

/// Read-only view of one task's state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub audio_url: Option<String>,
    pub filename: Option<String>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Started,
    Stage,
    Completed,
    Failed,
    Timeout,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// State-change notification fanned out to listeners. Also the pub/sub wire
/// form used by the distributed backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: EventKind,
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl TaskEvent {
    /// The same event redirected at a follower task.
    pub fn for_follower(&self, follower_id: TaskId) -> Self {
        let mut event = self.clone();
        event.task_id = follower_id;
        event
    }
}

/// Listeners are plain unbounded channel senders; a dropped receiver is
/// pruned on the next delivery attempt.
pub type EventSender = UnboundedSender<TaskEvent>;

/// Handle returned by `add_listener`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Monitor-wide counters. Monotonic for the lifetime of the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub active_tasks: u64,
    pub total_tasks: u64,
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_duration_secs: f64,
}

/// Leader found for a content fingerprint. `status` is `None` when the
/// index still points at a task whose row has disappeared.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingTask {
    pub task_id: TaskId,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("keystore failure: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("could not acquire lease for {0}")]
    LeaseUnavailable(String),
}

/// Job lifecycle tracker with content-fingerprint idempotency,
/// leader/follower linking, event fan-out and timeout sweeping.
///
/// Two interchangeable backends exist: [`InMemoryTaskMonitor`] for a single
/// process and [`KeystoreTaskMonitor`] for cross-process deployments. Both
/// expose identical external behavior; callers hold an `Arc<dyn TaskMonitor>`.
#[async_trait]
pub trait TaskMonitor: Send + Sync {
    /// Look up the leader task for this content, without mutating anything.
    async fn find_existing_by_content(
        &self,
        content: &str,
    ) -> Result<Option<ExistingTask>, MonitorError>;

    /// Atomically claim the content fingerprint and create a Processing
    /// task. Returns `false` when the fingerprint is already claimed by a
    /// Completed or Processing task, or when `task_id` itself is already
    /// Processing; the caller must not execute synthesis in that case.
    async fn start_task(&self, task_id: TaskId, content: &str) -> Result<bool, MonitorError>;

    /// Transition to Completed and fan the event out to listeners and
    /// followers. Unknown tasks are logged and ignored; tasks already in a
    /// terminal state are left untouched.
    async fn complete_task(
        &self,
        task_id: TaskId,
        audio_url: &str,
        filename: Option<&str>,
    ) -> Result<(), MonitorError>;

    async fn fail_task(&self, task_id: TaskId, error_message: &str) -> Result<(), MonitorError>;

    async fn timeout_task(&self, task_id: TaskId) -> Result<(), MonitorError>;

    /// Attach `follower_id` to `leader_id` so the leader's terminal event is
    /// mirrored to the follower (with the follower's own id). Self-links are
    /// ignored. A follower without a task row gets one in Processing state
    /// and a synthetic `started` event.
    async fn link_task(&self, follower_id: TaskId, leader_id: TaskId) -> Result<(), MonitorError>;

    /// Update the free-form progress label shown to live subscribers.
    async fn update_stage(&self, task_id: TaskId, stage: &str) -> Result<(), MonitorError>;

    async fn get_task_status(&self, task_id: TaskId)
        -> Result<Option<TaskSnapshot>, MonitorError>;

    async fn get_active_tasks(&self) -> Result<Vec<TaskId>, MonitorError>;

    async fn get_stats(&self) -> Result<MonitorStats, MonitorError>;

    async fn add_listener(&self, task_id: TaskId, sender: EventSender) -> ListenerId;

    async fn remove_listener(&self, task_id: TaskId, listener: ListenerId);

    /// Sweep Processing tasks older than the timeout window. Driven by an
    /// external scheduler (see [`TimeoutSweeper`]), not self-scheduled.
    async fn check_timeouts(&self) -> Result<(), MonitorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_content_addressed() {
        let a = content_fingerprint("A: Hello there.\nB: Hi!");
        let b = content_fingerprint("A: Hello there.\nB: Hi!");
        let c = content_fingerprint("A: Hello there.\nB: Hi?");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_status_wire_names_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(TaskStatus::TimedOut.as_str(), "timeout");
    }

    #[test]
    fn test_event_serialization_omits_empty_terminal_fields() {
        let event = TaskEvent {
            event: EventKind::Started,
            task_id: 7,
            status: TaskStatus::Processing,
            stage: "queued".to_string(),
            audio_url: None,
            filename: None,
            error_message: None,
            duration_secs: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "started");
        assert_eq!(json["status"], "processing");
        assert!(json.get("audio_url").is_none());
    }

    #[test]
    fn test_for_follower_rewrites_only_the_id() {
        let event = TaskEvent {
            event: EventKind::Completed,
            task_id: 1,
            status: TaskStatus::Completed,
            stage: "done".to_string(),
            audio_url: Some("https://cdn/audio.mp3".to_string()),
            filename: Some("a.mp3".to_string()),
            error_message: None,
            duration_secs: Some(1.5),
        };
        let mirrored = event.for_follower(2);
        assert_eq!(mirrored.task_id, 2);
        assert_eq!(mirrored.audio_url, event.audio_url);
        assert_eq!(mirrored.event, EventKind::Completed);
    }
}
