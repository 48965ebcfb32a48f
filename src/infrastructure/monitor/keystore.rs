use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{
    content_fingerprint, EventKind, EventSender, ExistingTask, ListenerId, MonitorError,
    MonitorStats, TaskEvent, TaskId, TaskMonitor, TaskSnapshot, TaskStatus,
    DEFAULT_TIMEOUT_WINDOW, TIMEOUT_MESSAGE,
};
use crate::infrastructure::keystore::{Keystore, KeystoreError, WriteBatch};

const LEASE_WAIT: Duration = Duration::from_secs(5);
const LEASE_TTL: Duration = Duration::from_secs(30);

type ListenerRegistry = Mutex<HashMap<TaskId, Vec<(ListenerId, EventSender)>>>;

/// Distributed [`TaskMonitor`] backend over a shared [`Keystore`].
///
/// Every mutation runs under a short-lived lease scoped to the minimal
/// contended key (the content fingerprint for `start_task`, the task id for
/// terminal transitions) and lands as one atomic write batch that includes
/// the event publish, so any process observing the store sees either the
/// whole transition or none of it. A background subscriber on the wildcard
/// event pattern delivers inbound events to locally registered listeners,
/// no matter which process performed the mutation.
pub struct KeystoreTaskMonitor {
    store: Arc<dyn Keystore>,
    namespace: String,
    timeout_window: Duration,
    listeners: Arc<ListenerRegistry>,
    next_listener: AtomicU64,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl KeystoreTaskMonitor {
    pub fn new(store: Arc<dyn Keystore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            timeout_window: DEFAULT_TIMEOUT_WINDOW,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            subscriber: Mutex::new(None),
        }
    }

    pub fn with_timeout_window(mut self, timeout_window: Duration) -> Self {
        self.timeout_window = timeout_window;
        self
    }

    /// Stop the background event subscriber. Safe to call more than once;
    /// a later `add_listener` restarts it.
    pub fn shutdown(&self) {
        if let Some(handle) = self.subscriber.lock().take() {
            handle.abort();
        }
    }

    // ---- key naming -----------------------------------------------------

    fn task_key(&self, task_id: TaskId) -> String {
        format!("{}:task:{}", self.namespace, task_id)
    }

    fn active_set(&self) -> String {
        format!("{}:active", self.namespace)
    }

    fn all_set(&self) -> String {
        format!("{}:all", self.namespace)
    }

    fn idempotency_hash(&self) -> String {
        format!("{}:idempotency", self.namespace)
    }

    fn stats_hash(&self) -> String {
        format!("{}:stats", self.namespace)
    }

    fn followers_set(&self, leader_id: TaskId) -> String {
        format!("{}:followers:{}", self.namespace, leader_id)
    }

    fn follow_parent_hash(&self) -> String {
        format!("{}:follow_parent", self.namespace)
    }

    fn event_channel(&self, task_id: TaskId) -> String {
        format!("{}:events:{}", self.namespace, task_id)
    }

    fn event_pattern(&self) -> String {
        format!("{}:events:*", self.namespace)
    }

    fn lease_name(&self, scope: &str) -> String {
        format!("{}:lock:{}", self.namespace, scope)
    }

    // ---- event plumbing -------------------------------------------------

    /// Start the wildcard subscriber loop if it is not already running.
    /// Lazy: the first listener registration (or explicit call) spins it up.
    pub async fn ensure_subscriber(&self) -> Result<(), MonitorError> {
        {
            let guard = self.subscriber.lock();
            if guard.as_ref().is_some_and(|h| !h.is_finished()) {
                return Ok(());
            }
        }

        let mut rx = self.store.psubscribe(&self.event_pattern()).await?;
        let listeners = Arc::clone(&self.listeners);

        let handle = tokio::spawn(async move {
            while let Some((channel, payload)) = rx.recv().await {
                let event: TaskEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(err) => {
                        // A bad payload must never kill the loop.
                        tracing::error!(%channel, error = %err, "malformed task event payload");
                        continue;
                    }
                };
                dispatch_local(&listeners, &event);
            }
            tracing::debug!("task event subscriber loop ended");
        });

        *self.subscriber.lock() = Some(handle);
        Ok(())
    }

    async fn with_lease<T>(
        &self,
        scope: &str,
        op: impl std::future::Future<Output = Result<T, MonitorError>>,
    ) -> Result<T, MonitorError> {
        let name = self.lease_name(scope);
        match self.store.acquire_lease(&name, LEASE_WAIT, LEASE_TTL).await {
            Ok(()) => {}
            Err(KeystoreError::LeaseTimeout(_)) => {
                return Err(MonitorError::LeaseUnavailable(name));
            }
            Err(err) => return Err(err.into()),
        }

        let result = op.await;
        if let Err(err) = self.store.release_lease(&name).await {
            tracing::warn!(lease = %name, error = %err, "failed to release lease");
        }
        result
    }

    // ---- record codec ---------------------------------------------------

    fn snapshot_from_hash(
        task_id: TaskId,
        data: &HashMap<String, String>,
    ) -> Option<TaskSnapshot> {
        if data.is_empty() {
            return None;
        }
        let status = data
            .get("status")
            .and_then(|s| s.parse::<TaskStatus>().ok())?;
        let started_at = data
            .get("started_at")
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let completed_at = data
            .get("completed_at")
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok());
        let stage = data
            .get("stage")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| {
                if completed_at.is_some() {
                    "done".to_string()
                } else {
                    "queued".to_string()
                }
            });
        Some(TaskSnapshot {
            task_id,
            status,
            stage,
            started_at,
            completed_at,
            error_message: non_empty(data.get("error_message")),
            audio_url: non_empty(data.get("audio_url")),
            filename: non_empty(data.get("filename")),
            duration_secs: completed_at
                .map(|end| (end - started_at).num_milliseconds().max(0) as f64 / 1000.0),
        })
    }

    /// Shared terminal transition under a task-scoped lease.
    async fn finish(
        &self,
        task_id: TaskId,
        kind: EventKind,
        audio_url: Option<&str>,
        filename: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), MonitorError> {
        let scope = format!("task:{}", task_id);
        self.with_lease(&scope, async {
            let task_key = self.task_key(task_id);
            let data = self.store.hgetall(&task_key).await?;
            if data.is_empty() {
                tracing::warn!(task_id, event = ?kind, "terminal transition for unknown task ignored");
                return Ok(());
            }
            let current = data.get("status").and_then(|s| s.parse::<TaskStatus>().ok());
            if current.is_some_and(|s| s.is_terminal()) {
                tracing::debug!(task_id, "task already terminal, ignoring");
                return Ok(());
            }

            let now = Utc::now();
            let started_at = data
                .get("started_at")
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .unwrap_or(now);
            let duration = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;

            let status = match kind {
                EventKind::Completed => TaskStatus::Completed,
                EventKind::Failed => TaskStatus::Failed,
                EventKind::Timeout => TaskStatus::TimedOut,
                _ => unreachable!("finish only handles terminal events"),
            };

            let mut fields = vec![
                ("status".to_string(), status.as_str().to_string()),
                ("completed_at".to_string(), now.to_rfc3339()),
                ("stage".to_string(), "done".to_string()),
            ];
            if let Some(url) = audio_url {
                fields.push(("audio_url".to_string(), url.to_string()));
            }
            if let Some(name) = filename {
                fields.push(("filename".to_string(), name.to_string()));
            }
            if let Some(message) = error_message {
                fields.push(("error_message".to_string(), message.to_string()));
            }

            let counter = if kind == EventKind::Completed {
                "tasks_completed"
            } else {
                "tasks_failed"
            };

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
            let payload = serde_json::to_string(&event)
                .map_err(|e| KeystoreError::Unavailable(e.to_string()))?;

            self.store
                .apply(
                    WriteBatch::new()
                        .hset(task_key, fields)
                        .srem(self.active_set(), task_id.to_string())
                        .hincr_by(self.stats_hash(), counter, 1)
                        .hincr_by_float(self.stats_hash(), "total_duration", duration)
                        .publish(self.event_channel(task_id), payload),
                )
                .await?;
            broadcast_to_followers(self.store.as_ref(), &self.namespace, &event).await;

            tracing::info!(task_id, status = %status, duration_secs = duration, "task finished");
            Ok(())
        })
        .await
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.is_empty()).cloned()
}

fn dispatch_local(listeners: &ListenerRegistry, event: &TaskEvent) {
    let mut registry = listeners.lock();
    if let Some(subscribers) = registry.get_mut(&event.task_id) {
        subscribers.retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }
}

/// Re-publish an event on every follower's channel with the follower's own
/// id, so their subscribers see it as their own outcome. Runs on the
/// process performing the mutation, exactly once per event.
async fn broadcast_to_followers(store: &dyn Keystore, namespace: &str, event: &TaskEvent) {
    let followers_key = format!("{}:followers:{}", namespace, event.task_id);
    let followers = match store.smembers(&followers_key).await {
        Ok(members) => members,
        Err(err) => {
            tracing::error!(task_id = event.task_id, error = %err, "failed to read followers");
            return;
        }
    };

    for member in followers {
        let Ok(follower_id) = member.parse::<TaskId>() else {
            tracing::warn!(%member, "non-numeric follower id in keystore");
            continue;
        };
        let mirrored = event.for_follower(follower_id);
        let Ok(payload) = serde_json::to_string(&mirrored) else {
            continue;
        };
        let channel = format!("{}:events:{}", namespace, follower_id);
        if let Err(err) = store.publish(&channel, &payload).await {
            tracing::error!(follower_id, error = %err, "failed to publish follower event");
        }
    }
}

#[async_trait]
impl TaskMonitor for KeystoreTaskMonitor {
    async fn find_existing_by_content(
        &self,
        content: &str,
    ) -> Result<Option<ExistingTask>, MonitorError> {
        let key = content_fingerprint(content);
        let Some(existing) = self.store.hget(&self.idempotency_hash(), &key).await? else {
            return Ok(None);
        };
        let Ok(task_id) = existing.parse::<TaskId>() else {
            return Ok(None);
        };
        let status = self
            .store
            .hget(&self.task_key(task_id), "status")
            .await?
            .and_then(|s| s.parse::<TaskStatus>().ok());
        Ok(Some(ExistingTask { task_id, status }))
    }

    async fn start_task(&self, task_id: TaskId, content: &str) -> Result<bool, MonitorError> {
        let key = content_fingerprint(content);
        let scope = key.clone();
        self.with_lease(&scope, async {
            if let Some(existing) = self.store.hget(&self.idempotency_hash(), &key).await? {
                let status = self
                    .store
                    .hget(&format!("{}:task:{}", self.namespace, existing), "status")
                    .await?
                    .and_then(|s| s.parse::<TaskStatus>().ok());
                if matches!(
                    status,
                    Some(TaskStatus::Completed) | Some(TaskStatus::Processing)
                ) {
                    tracing::info!(
                        task_id,
                        existing_id = %existing,
                        "identical content already claimed, skipping execution"
                    );
                    return Ok(false);
                }
            }

            let current = self
                .store
                .hget(&self.task_key(task_id), "status")
                .await?
                .and_then(|s| s.parse::<TaskStatus>().ok());
            if current == Some(TaskStatus::Processing) {
                tracing::warn!(task_id, "task already processing");
                return Ok(false);
            }

            let now = Utc::now();
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
            let payload = serde_json::to_string(&event)
                .map_err(|e| KeystoreError::Unavailable(e.to_string()))?;

            self.store
                .apply(
                    WriteBatch::new()
                        .hset(self.idempotency_hash(), vec![(key.clone(), task_id.to_string())])
                        .hset(
                            self.task_key(task_id),
                            vec![
                                ("task_id".to_string(), task_id.to_string()),
                                ("status".to_string(), TaskStatus::Processing.as_str().to_string()),
                                ("started_at".to_string(), now.to_rfc3339()),
                                ("idempotency_key".to_string(), key.clone()),
                                ("completed_at".to_string(), String::new()),
                                ("error_message".to_string(), String::new()),
                                ("audio_url".to_string(), String::new()),
                                ("filename".to_string(), String::new()),
                                ("stage".to_string(), "queued".to_string()),
                            ],
                        )
                        .sadd(self.active_set(), task_id.to_string())
                        .sadd(self.all_set(), task_id.to_string())
                        .hincr_by(self.stats_hash(), "tasks_started", 1)
                        .publish(self.event_channel(task_id), payload),
                )
                .await?;

            tracing::info!(task_id, "task started");
            Ok(true)
        })
        .await
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        audio_url: &str,
        filename: Option<&str>,
    ) -> Result<(), MonitorError> {
        self.finish(task_id, EventKind::Completed, Some(audio_url), filename, None)
            .await
    }

    async fn fail_task(&self, task_id: TaskId, error_message: &str) -> Result<(), MonitorError> {
        self.finish(task_id, EventKind::Failed, None, None, Some(error_message))
            .await
    }

    async fn timeout_task(&self, task_id: TaskId) -> Result<(), MonitorError> {
        self.finish(task_id, EventKind::Timeout, None, None, Some(TIMEOUT_MESSAGE))
            .await
    }

    async fn link_task(&self, follower_id: TaskId, leader_id: TaskId) -> Result<(), MonitorError> {
        if follower_id == leader_id {
            return Ok(());
        }
        let scope = format!("link:{}", leader_id);
        self.with_lease(&scope, async {
            let follower_key = self.task_key(follower_id);
            let existing = self.store.hgetall(&follower_key).await?;

            let mut batch = WriteBatch::new()
                .hset(
                    self.follow_parent_hash(),
                    vec![(follower_id.to_string(), leader_id.to_string())],
                )
                .sadd(self.followers_set(leader_id), follower_id.to_string());

            if existing.is_empty() {
                let now = Utc::now();
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
                let payload = serde_json::to_string(&event)
                    .map_err(|e| KeystoreError::Unavailable(e.to_string()))?;
                batch = batch
                    .hset(
                        follower_key,
                        vec![
                            ("task_id".to_string(), follower_id.to_string()),
                            ("status".to_string(), TaskStatus::Processing.as_str().to_string()),
                            ("started_at".to_string(), now.to_rfc3339()),
                            ("idempotency_key".to_string(), String::new()),
                            ("completed_at".to_string(), String::new()),
                            ("error_message".to_string(), String::new()),
                            ("audio_url".to_string(), String::new()),
                            ("filename".to_string(), String::new()),
                            ("stage".to_string(), "running".to_string()),
                        ],
                    )
                    .sadd(self.active_set(), follower_id.to_string())
                    .sadd(self.all_set(), follower_id.to_string())
                    .publish(self.event_channel(follower_id), payload);
            }

            self.store.apply(batch).await?;
            tracing::info!(follower_id, leader_id, "task linked to leader");
            Ok(())
        })
        .await
    }

    async fn update_stage(&self, task_id: TaskId, stage: &str) -> Result<(), MonitorError> {
        let status = self
            .store
            .hget(&self.task_key(task_id), "status")
            .await?
            .and_then(|s| s.parse::<TaskStatus>().ok())
            .unwrap_or(TaskStatus::Processing);

        let event = TaskEvent {
            event: EventKind::Stage,
            task_id,
            status,
            stage: stage.to_string(),
            audio_url: None,
            filename: None,
            error_message: None,
            duration_secs: None,
        };
        let payload = serde_json::to_string(&event)
            .map_err(|e| KeystoreError::Unavailable(e.to_string()))?;

        self.store
            .apply(
                WriteBatch::new()
                    .hset(
                        self.task_key(task_id),
                        vec![("stage".to_string(), stage.to_string())],
                    )
                    .publish(self.event_channel(task_id), payload),
            )
            .await?;
        broadcast_to_followers(self.store.as_ref(), &self.namespace, &event).await;
        Ok(())
    }

    async fn get_task_status(
        &self,
        task_id: TaskId,
    ) -> Result<Option<TaskSnapshot>, MonitorError> {
        let data = self.store.hgetall(&self.task_key(task_id)).await?;
        Ok(Self::snapshot_from_hash(task_id, &data))
    }

    async fn get_active_tasks(&self) -> Result<Vec<TaskId>, MonitorError> {
        let members = self.store.smembers(&self.active_set()).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    async fn get_stats(&self) -> Result<MonitorStats, MonitorError> {
        let stats = self.store.hgetall(&self.stats_hash()).await?;
        let read_u64 =
            |field: &str| stats.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let tasks_completed = read_u64("tasks_completed");
        let total_duration = stats
            .get("total_duration")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(MonitorStats {
            active_tasks: self.store.scard(&self.active_set()).await?,
            total_tasks: self.store.scard(&self.all_set()).await?,
            tasks_started: read_u64("tasks_started"),
            tasks_completed,
            tasks_failed: read_u64("tasks_failed"),
            average_duration_secs: if tasks_completed > 0 {
                total_duration / tasks_completed as f64
            } else {
                0.0
            },
        })
    }

    async fn add_listener(&self, task_id: TaskId, sender: EventSender) -> ListenerId {
        if let Err(err) = self.ensure_subscriber().await {
            tracing::error!(error = %err, "failed to start event subscriber");
        }
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(task_id)
            .or_default()
            .push((id, sender));
        id
    }

    async fn remove_listener(&self, task_id: TaskId, listener: ListenerId) {
        let mut registry = self.listeners.lock();
        if let Some(subscribers) = registry.get_mut(&task_id) {
            subscribers.retain(|(id, _)| *id != listener);
            if subscribers.is_empty() {
                registry.remove(&task_id);
            }
        }
    }

    async fn check_timeouts(&self) -> Result<(), MonitorError> {
        let active = self.get_active_tasks().await?;
        let now = Utc::now();

        for task_id in active {
            let data = self.store.hgetall(&self.task_key(task_id)).await?;
            let status = data.get("status").and_then(|s| s.parse::<TaskStatus>().ok());
            if status != Some(TaskStatus::Processing) {
                continue;
            }
            let started_at = data
                .get("started_at")
                .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                .unwrap_or(now);
            let age = (now - started_at).to_std().unwrap_or_default();
            if age > self.timeout_window {
                self.timeout_task(task_id).await?;
            }
        }
        Ok(())
    }
}

impl Drop for KeystoreTaskMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
