use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    content_fingerprint, EventKind, EventSender, ExistingTask, ListenerId, MonitorError,
    MonitorStats, TaskEvent, TaskId, TaskMonitor, TaskSnapshot, TaskStatus,
    DEFAULT_TIMEOUT_WINDOW, TIMEOUT_MESSAGE,
};

/// Single-process [`TaskMonitor`] backend: one mutex over the whole task
/// table, idempotency index, follow relations and listener registry.
pub struct InMemoryTaskMonitor {
    state: Mutex<State>,
    timeout_window: Duration,
    next_listener: AtomicU64,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskRecord>,
    idempotency: HashMap<String, TaskId>,
    listeners: HashMap<TaskId, Vec<(ListenerId, EventSender)>>,
    followers: HashMap<TaskId, Vec<TaskId>>,
    follow_parent: HashMap<TaskId, TaskId>,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    started: u64,
    completed: u64,
    failed: u64,
    total_duration_secs: f64,
}

struct TaskRecord {
    status: TaskStatus,
    stage: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    audio_url: Option<String>,
    filename: Option<String>,
    #[allow(dead_code)]
    idempotency_key: Option<String>,
}

impl Default for InMemoryTaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskMonitor {
    pub fn new() -> Self {
        Self::with_timeout_window(DEFAULT_TIMEOUT_WINDOW)
    }

    pub fn with_timeout_window(timeout_window: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            timeout_window,
            next_listener: AtomicU64::new(1),
        }
    }

    /// Deliver an event to the task's listeners and mirror it to every
    /// follower with the follower's own id.
    fn notify(state: &mut State, task_id: TaskId, event: &TaskEvent) {
        Self::send_to_listeners(state, task_id, event);

        let follower_ids = state.followers.get(&task_id).cloned().unwrap_or_default();
        for follower_id in follower_ids {
            let mirrored = event.for_follower(follower_id);
            Self::send_to_listeners(state, follower_id, &mirrored);
        }
    }

    fn send_to_listeners(state: &mut State, task_id: TaskId, event: &TaskEvent) {
        if let Some(listeners) = state.listeners.get_mut(&task_id) {
            listeners.retain(|(_, sender)| sender.send(event.clone()).is_ok());
        }
    }

    /// Shared terminal transition; `kind` decides the status, counters and
    /// event type. Unknown and already-terminal tasks are no-ops.
    fn finish(
        &self,
        task_id: TaskId,
        kind: EventKind,
        audio_url: Option<&str>,
        filename: Option<&str>,
        error_message: Option<&str>,
    ) {
        let mut state = self.state.lock();

        let Some(record) = state.tasks.get_mut(&task_id) else {
            tracing::warn!(task_id, event = ?kind, "terminal transition for unknown task ignored");
            return;
        };
        if record.status.is_terminal() {
            tracing::debug!(task_id, status = %record.status, "task already terminal, ignoring");
            return;
        }

        let now = Utc::now();
        let status = match kind {
            EventKind::Completed => TaskStatus::Completed,
            EventKind::Failed => TaskStatus::Failed,
            EventKind::Timeout => TaskStatus::TimedOut,
            _ => unreachable!("finish only handles terminal events"),
        };
        record.status = status;
        record.stage = "done".to_string();
        record.completed_at = Some(now);
        record.audio_url = audio_url.map(str::to_string).or(record.audio_url.take());
        record.filename = filename.map(str::to_string).or(record.filename.take());
        record.error_message = error_message.map(str::to_string);

        let duration = (now - record.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        match kind {
            EventKind::Completed => state.stats.completed += 1,
            _ => state.stats.failed += 1,
        }
        state.stats.total_duration_secs += duration;

        match kind {
            EventKind::Completed => {
                tracing::info!(task_id, duration_secs = duration, "task completed")
            }
            EventKind::Failed => tracing::error!(
                task_id,
                duration_secs = duration,
                error = error_message.unwrap_or(""),
                "task failed"
            ),
            EventKind::Timeout => {
                tracing::warn!(task_id, duration_secs = duration, "task timed out")
            }
            _ => {}
        }

        let event = TaskEvent {
            event: kind,
            task_id,
            status,
            stage: "done".to_string(),
            audio_url: audio_url.map(str::to_string),
            filename: filename.map(str::to_string),
            error_message: error_message.map(str::to_string),
            duration_secs: Some(duration),
        };
        Self::notify(&mut state, task_id, &event);
    }
}

#[async_trait]
impl TaskMonitor for InMemoryTaskMonitor {
    async fn find_existing_by_content(
        &self,
        content: &str,
    ) -> Result<Option<ExistingTask>, MonitorError> {
        let key = content_fingerprint(content);
        let state = self.state.lock();
        Ok(state.idempotency.get(&key).map(|&task_id| ExistingTask {
            task_id,
            status: state.tasks.get(&task_id).map(|t| t.status),
        }))
    }

    async fn start_task(&self, task_id: TaskId, content: &str) -> Result<bool, MonitorError> {
        let key = content_fingerprint(content);
        let mut state = self.state.lock();

        if let Some(&existing_id) = state.idempotency.get(&key) {
            if let Some(existing) = state.tasks.get(&existing_id) {
                if matches!(
                    existing.status,
                    TaskStatus::Completed | TaskStatus::Processing
                ) {
                    tracing::info!(
                        task_id,
                        existing_id,
                        status = %existing.status,
                        "identical content already claimed, skipping execution"
                    );
                    return Ok(false);
                }
            } else {
                tracing::warn!(existing_id, "idempotency key present but task row missing");
            }
        }

        if let Some(current) = state.tasks.get(&task_id) {
            if current.status == TaskStatus::Processing {
                tracing::warn!(task_id, "task already processing");
                return Ok(false);
            }
        }

        state.tasks.insert(
            task_id,
            TaskRecord {
                status: TaskStatus::Processing,
                stage: "queued".to_string(),
                started_at: Utc::now(),
                completed_at: None,
                error_message: None,
                audio_url: None,
                filename: None,
                idempotency_key: Some(key.clone()),
            },
        );
        state.idempotency.insert(key, task_id);
        state.stats.started += 1;

        tracing::info!(task_id, "task started");
        let event = TaskEvent {
            event: EventKind::Started,
            task_id,
            status: TaskStatus::Processing,
            stage: "queued".to_string(),
            audio_url: None,
            filename: None,
            error_message: None,
            duration_secs: None,
        };
        Self::notify(&mut state, task_id, &event);
        Ok(true)
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        audio_url: &str,
        filename: Option<&str>,
    ) -> Result<(), MonitorError> {
        self.finish(task_id, EventKind::Completed, Some(audio_url), filename, None);
        Ok(())
    }

    async fn fail_task(&self, task_id: TaskId, error_message: &str) -> Result<(), MonitorError> {
        self.finish(task_id, EventKind::Failed, None, None, Some(error_message));
        Ok(())
    }

    async fn timeout_task(&self, task_id: TaskId) -> Result<(), MonitorError> {
        self.finish(task_id, EventKind::Timeout, None, None, Some(TIMEOUT_MESSAGE));
        Ok(())
    }

    async fn link_task(&self, follower_id: TaskId, leader_id: TaskId) -> Result<(), MonitorError> {
        if follower_id == leader_id {
            return Ok(());
        }
        let mut state = self.state.lock();

        state.follow_parent.insert(follower_id, leader_id);
        let followers = state.followers.entry(leader_id).or_default();
        if !followers.contains(&follower_id) {
            followers.push(follower_id);
        }

        if !state.tasks.contains_key(&follower_id) {
            state.tasks.insert(
                follower_id,
                TaskRecord {
                    status: TaskStatus::Processing,
                    stage: "running".to_string(),
                    started_at: Utc::now(),
                    completed_at: None,
                    error_message: None,
                    audio_url: None,
                    filename: None,
                    idempotency_key: None,
                },
            );
            let event = TaskEvent {
                event: EventKind::Started,
                task_id: follower_id,
                status: TaskStatus::Processing,
                stage: "running".to_string(),
                audio_url: None,
                filename: None,
                error_message: None,
                duration_secs: None,
            };
            Self::notify(&mut state, follower_id, &event);
        }

        tracing::info!(follower_id, leader_id, "task linked to leader");
        Ok(())
    }

    async fn update_stage(&self, task_id: TaskId, stage: &str) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        let Some(record) = state.tasks.get_mut(&task_id) else {
            return Ok(());
        };
        record.stage = stage.to_string();
        let event = TaskEvent {
            event: EventKind::Stage,
            task_id,
            status: record.status,
            stage: stage.to_string(),
            audio_url: None,
            filename: None,
            error_message: None,
            duration_secs: None,
        };
        Self::notify(&mut state, task_id, &event);
        Ok(())
    }

    async fn get_task_status(
        &self,
        task_id: TaskId,
    ) -> Result<Option<TaskSnapshot>, MonitorError> {
        let state = self.state.lock();
        Ok(state.tasks.get(&task_id).map(|record| TaskSnapshot {
            task_id,
            status: record.status,
            stage: record.stage.clone(),
            started_at: record.started_at,
            completed_at: record.completed_at,
            error_message: record.error_message.clone(),
            audio_url: record.audio_url.clone(),
            filename: record.filename.clone(),
            duration_secs: record
                .completed_at
                .map(|end| (end - record.started_at).num_milliseconds().max(0) as f64 / 1000.0),
        }))
    }

    async fn get_active_tasks(&self) -> Result<Vec<TaskId>, MonitorError> {
        let state = self.state.lock();
        Ok(state
            .tasks
            .iter()
            .filter(|(_, r)| r.status == TaskStatus::Processing)
            .map(|(&id, _)| id)
            .collect())
    }

    async fn get_stats(&self) -> Result<MonitorStats, MonitorError> {
        let state = self.state.lock();
        let active = state
            .tasks
            .values()
            .filter(|r| r.status == TaskStatus::Processing)
            .count() as u64;
        let average = if state.stats.completed > 0 {
            state.stats.total_duration_secs / state.stats.completed as f64
        } else {
            0.0
        };
        Ok(MonitorStats {
            active_tasks: active,
            total_tasks: state.tasks.len() as u64,
            tasks_started: state.stats.started,
            tasks_completed: state.stats.completed,
            tasks_failed: state.stats.failed,
            average_duration_secs: average,
        })
    }

    async fn add_listener(&self, task_id: TaskId, sender: EventSender) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.state
            .lock()
            .listeners
            .entry(task_id)
            .or_default()
            .push((id, sender));
        id
    }

    async fn remove_listener(&self, task_id: TaskId, listener: ListenerId) {
        let mut state = self.state.lock();
        if let Some(listeners) = state.listeners.get_mut(&task_id) {
            listeners.retain(|(id, _)| *id != listener);
            if listeners.is_empty() {
                state.listeners.remove(&task_id);
            }
        }
    }

    async fn check_timeouts(&self) -> Result<(), MonitorError> {
        let expired: Vec<TaskId> = {
            let state = self.state.lock();
            let now = Utc::now();
            state
                .tasks
                .iter()
                .filter(|(_, r)| {
                    r.status == TaskStatus::Processing
                        && (now - r.started_at).to_std().unwrap_or_default() > self.timeout_window
                })
                .map(|(&id, _)| id)
                .collect()
        };

        for task_id in expired {
            self.timeout_task(task_id).await?;
        }
        Ok(())
    }
}
