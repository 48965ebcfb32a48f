use std::sync::Arc;

use crate::domain::dialogue::{build_turns_with_limit, validate_dialogue, MAX_ROUND_LENGTH};
use crate::error::{AppError, AppResult};
use crate::infrastructure::admission::AdmissionGate;
use crate::infrastructure::monitor::{content_fingerprint, TaskId, TaskMonitor, TaskStatus};
use crate::infrastructure::repositories::{
    AudioRecord, AudioRepository, NewAudioRecord, TextRecord, TextRepository,
};
use crate::infrastructure::storage::{
    compute_audio_filename, put_bytes_with_retry, sanitize_path_segment, ObjectStore,
    StorageError,
};
use crate::infrastructure::synthesizer::{SpeechSynthesizer, SynthesisError};

use super::{MIN_ARTIFACT_BYTES, QUOTA_BACKOFF};

/// How a synthesis request was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Fresh audio was synthesized and stored.
    Generated {
        audio_id: i64,
        filename: String,
        file_size: u64,
        audio_url: String,
    },
    /// An existing artifact satisfied the request without synthesis.
    ReusedExisting {
        audio_id: i64,
        filename: String,
        audio_url: String,
        leader_id: Option<TaskId>,
    },
    /// An equivalent task is running; this one now mirrors its events.
    Following { leader_id: TaskId },
    /// The task itself is already executing elsewhere.
    AlreadyRunning,
}

/// Orchestrates one synthesis request end to end: idempotency checks,
/// artifact reuse, admission, synthesis, upload and bookkeeping.
pub struct TaskService {
    texts: Arc<dyn TextRepository>,
    audios: Arc<dyn AudioRepository>,
    store: Arc<dyn ObjectStore>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    monitor: Arc<dyn TaskMonitor>,
    admission: AdmissionGate,
    max_round_length: usize,
}

impl TaskService {
    pub fn new(
        texts: Arc<dyn TextRepository>,
        audios: Arc<dyn AudioRepository>,
        store: Arc<dyn ObjectStore>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        monitor: Arc<dyn TaskMonitor>,
        admission: AdmissionGate,
    ) -> Self {
        Self {
            texts,
            audios,
            store,
            synthesizer,
            monitor,
            admission,
            max_round_length: MAX_ROUND_LENGTH,
        }
    }

    pub fn with_max_round_length(mut self, max_round_length: usize) -> Self {
        self.max_round_length = max_round_length;
        self
    }

    pub async fn create_synthesis_task(
        &self,
        text_id: i64,
        user_id: i64,
    ) -> AppResult<TaskOutcome> {
        let text = self
            .texts
            .get_text_by_id(text_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("text {}", text_id)))?;

        tracing::info!(
            text_id,
            user_id,
            title = %text.title,
            char_count = text.char_count,
            "synthesis task requested"
        );

        let filename = compute_audio_filename(&text.title, text.char_count, 1);
        let object_key = object_key_for(&text, &filename);

        let leader = self.monitor.find_existing_by_content(&text.content).await?;
        let granted = self.monitor.start_task(text_id, &text.content).await?;

        if !granted {
            return self
                .resolve_without_synthesis(text_id, user_id, leader, &filename, &object_key)
                .await;
        }

        match self
            .execute(&text, text_id, user_id, &filename, &object_key)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(AppError::QuotaExceeded {
                message,
                retry_after,
            }) => {
                // The task record is already failed and the permit released;
                // hold the caller back for the service-mandated cool-down.
                tracing::warn!(text_id, %message, "quota exhausted, backing off");
                tokio::time::sleep(QUOTA_BACKOFF).await;
                Err(AppError::QuotaExceeded {
                    message,
                    retry_after,
                })
            }
            Err(err) => {
                if let Err(mark) = self.monitor.fail_task(text_id, &err.to_string()).await {
                    tracing::error!(text_id, error = %mark, "failed to record task failure");
                }
                Err(err)
            }
        }
    }

    /// The monitor denied execution: another task owns this content.
    async fn resolve_without_synthesis(
        &self,
        text_id: i64,
        user_id: i64,
        leader: Option<crate::infrastructure::monitor::ExistingTask>,
        filename: &str,
        object_key: &str,
    ) -> AppResult<TaskOutcome> {
        let Some(leader) = leader else {
            tracing::info!(text_id, "task already running, no leader info");
            return Ok(TaskOutcome::AlreadyRunning);
        };

        match leader.status {
            Some(TaskStatus::Completed) => {
                tracing::info!(
                    text_id,
                    leader_id = leader.task_id,
                    "reusing completed task's artifact"
                );
                let file_size = self.store.size(object_key).await.unwrap_or(0);
                let row = self
                    .ensure_audio_row(text_id, user_id, filename, object_key, file_size)
                    .await?;
                let audio_url = self.store.public_url(object_key);
                // Linking first gives this task its own row so the terminal
                // transition below has something to land on.
                self.monitor.link_task(text_id, leader.task_id).await?;
                self.monitor
                    .complete_task(text_id, &audio_url, Some(filename))
                    .await?;
                Ok(TaskOutcome::ReusedExisting {
                    audio_id: row.id,
                    filename: filename.to_string(),
                    audio_url,
                    leader_id: Some(leader.task_id),
                })
            }
            _ => {
                tracing::info!(
                    text_id,
                    leader_id = leader.task_id,
                    "equivalent task in flight, following"
                );
                self.monitor.link_task(text_id, leader.task_id).await?;
                Ok(TaskOutcome::Following {
                    leader_id: leader.task_id,
                })
            }
        }
    }

    async fn execute(
        &self,
        text: &TextRecord,
        text_id: i64,
        user_id: i64,
        filename: &str,
        object_key: &str,
    ) -> AppResult<TaskOutcome> {
        if let Some(outcome) = self
            .try_reuse_artifact(text_id, user_id, filename, object_key)
            .await?
        {
            return Ok(outcome);
        }

        self.monitor.update_stage(text_id, "parsing").await?;
        validate_dialogue(&text.content)?;
        let turns = build_turns_with_limit(&text.content, self.max_round_length);

        self.monitor.update_stage(text_id, "synthesizing").await?;
        let permit = self.admission.acquire().await;
        let audio = match self.synthesizer.synthesize(&turns).await {
            Ok(audio) => {
                drop(permit);
                audio
            }
            Err(SynthesisError::QuotaExceeded(message)) => {
                // Release the admission slot before the cool-down so other
                // tasks are not starved while this one waits.
                drop(permit);
                self.monitor
                    .fail_task(
                        text_id,
                        &format!("concurrency quota exceeded, retry later: {}", message),
                    )
                    .await?;
                return Err(AppError::QuotaExceeded {
                    message,
                    retry_after: QUOTA_BACKOFF,
                });
            }
            Err(err) => {
                drop(permit);
                return Err(err.into());
            }
        };

        self.monitor.update_stage(text_id, "uploading").await?;
        let audio_url = put_bytes_with_retry(
            self.store.as_ref(),
            object_key,
            &audio,
            Some("audio/mpeg"),
        )
        .await?;

        let row = self
            .ensure_audio_row(text_id, user_id, filename, object_key, audio.len() as u64)
            .await?;
        self.monitor
            .complete_task(text_id, &audio_url, Some(filename))
            .await?;

        tracing::info!(
            text_id,
            audio_id = row.id,
            bytes = audio.len(),
            %filename,
            "synthesis task complete"
        );
        Ok(TaskOutcome::Generated {
            audio_id: row.id,
            filename: filename.to_string(),
            file_size: audio.len() as u64,
            audio_url,
        })
    }

    /// Reuse a stored artifact when one exists and clears the size floor.
    /// Undersized objects are deleted so the task regenerates them.
    async fn try_reuse_artifact(
        &self,
        text_id: i64,
        user_id: i64,
        filename: &str,
        object_key: &str,
    ) -> AppResult<Option<TaskOutcome>> {
        if !self.store.exists(object_key).await? {
            return Ok(None);
        }
        match self.store.size(object_key).await {
            Ok(size) if size >= MIN_ARTIFACT_BYTES => {
                tracing::info!(text_id, object_key, size, "artifact exists, skipping synthesis");
                let row = self
                    .ensure_audio_row(text_id, user_id, filename, object_key, size)
                    .await?;
                let audio_url = self.store.public_url(object_key);
                self.monitor
                    .complete_task(text_id, &audio_url, Some(filename))
                    .await?;
                Ok(Some(TaskOutcome::ReusedExisting {
                    audio_id: row.id,
                    filename: filename.to_string(),
                    audio_url,
                    leader_id: None,
                }))
            }
            Ok(size) => {
                tracing::warn!(text_id, object_key, size, "artifact below size floor, regenerating");
                self.store.delete(object_key).await?;
                Ok(None)
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch or create the artifact row for this object key. Insert races
    /// resolve by re-reading the winning row.
    async fn ensure_audio_row(
        &self,
        text_id: i64,
        user_id: i64,
        filename: &str,
        object_key: &str,
        file_size: u64,
    ) -> AppResult<AudioRecord> {
        if let Some(row) = self.audios.find_by_object_key(object_key).await? {
            return Ok(row);
        }
        let inserted = self
            .audios
            .insert(NewAudioRecord {
                text_id,
                user_id,
                filename: filename.to_string(),
                object_key: object_key.to_string(),
                file_size,
                version_num: 1,
            })
            .await;
        match inserted {
            Ok(row) => Ok(row),
            Err(StorageError::Duplicate(_)) => {
                tracing::warn!(object_key, "concurrent insert, reusing winning row");
                self.audios
                    .find_by_object_key(object_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::Storage(format!(
                            "duplicate insert for {} but no row found",
                            object_key
                        ))
                    })
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// `audios/{safe_title}/{hash8}/{filename}`: the content hash prefix keeps
/// identically titled scripts with different contents apart.
fn object_key_for(text: &TextRecord, filename: &str) -> String {
    let fingerprint = content_fingerprint(&text.content);
    format!(
        "audios/{}/{}/{}",
        sanitize_path_segment(&text.title),
        &fingerprint[..8],
        filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_object_key_shape() {
        let text = TextRecord {
            id: 1,
            title: "my show / ep 1".to_string(),
            content: "A: hi".to_string(),
            char_count: 5,
        };
        let key = object_key_for(&text, "my show _ ep 1_短_v01.mp3");
        assert!(key.starts_with("audios/my_show___ep_1/"));
        let hash_segment = key.split('/').nth(2).unwrap();
        assert_eq!(hash_segment.len(), 8);
        assert_eq!(key, object_key_for(&text, "my show _ ep 1_短_v01.mp3"));
    }
}
