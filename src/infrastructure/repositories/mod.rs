use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::infrastructure::storage::StorageError;

/// A stored dialogue script.
#[derive(Debug, Clone)]
pub struct TextRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub char_count: usize,
}

/// A synthesized artifact row.
#[derive(Debug, Clone)]
pub struct AudioRecord {
    pub id: i64,
    pub text_id: i64,
    pub user_id: i64,
    pub filename: String,
    pub object_key: String,
    pub file_size: u64,
    pub version_num: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAudioRecord {
    pub text_id: i64,
    pub user_id: i64,
    pub filename: String,
    pub object_key: String,
    pub file_size: u64,
    pub version_num: u32,
}

#[async_trait]
pub trait TextRepository: Send + Sync {
    async fn get_text_by_id(&self, text_id: i64) -> Result<Option<TextRecord>, StorageError>;
}

#[async_trait]
pub trait AudioRepository: Send + Sync {
    async fn find_by_object_key(
        &self,
        object_key: &str,
    ) -> Result<Option<AudioRecord>, StorageError>;

    /// Insert a new artifact row. A unique-key conflict on the object key
    /// surfaces as `StorageError::Duplicate` so the caller can re-read the
    /// winning row.
    async fn insert(&self, record: NewAudioRecord) -> Result<AudioRecord, StorageError>;
}

/// In-memory repositories for tests and local development.
#[derive(Default, Clone)]
pub struct MemoryTextRepository {
    texts: Arc<Mutex<HashMap<i64, TextRecord>>>,
}

impl MemoryTextRepository {
    pub fn insert(&self, id: i64, title: &str, content: &str) {
        self.texts.lock().insert(
            id,
            TextRecord {
                id,
                title: title.to_string(),
                content: content.to_string(),
                char_count: content.chars().count(),
            },
        );
    }
}

#[async_trait]
impl TextRepository for MemoryTextRepository {
    async fn get_text_by_id(&self, text_id: i64) -> Result<Option<TextRecord>, StorageError> {
        Ok(self.texts.lock().get(&text_id).cloned())
    }
}

#[derive(Default, Clone)]
pub struct MemoryAudioRepository {
    state: Arc<Mutex<AudioTable>>,
}

#[derive(Default)]
struct AudioTable {
    rows: Vec<AudioRecord>,
    next_id: i64,
}

#[async_trait]
impl AudioRepository for MemoryAudioRepository {
    async fn find_by_object_key(
        &self,
        object_key: &str,
    ) -> Result<Option<AudioRecord>, StorageError> {
        Ok(self
            .state
            .lock()
            .rows
            .iter()
            .find(|row| row.object_key == object_key)
            .cloned())
    }

    async fn insert(&self, record: NewAudioRecord) -> Result<AudioRecord, StorageError> {
        let mut table = self.state.lock();
        if table
            .rows
            .iter()
            .any(|row| row.object_key == record.object_key)
        {
            return Err(StorageError::Duplicate(record.object_key));
        }
        table.next_id += 1;
        let row = AudioRecord {
            id: table.next_id,
            text_id: record.text_id,
            user_id: record.user_id,
            filename: record.filename,
            object_key: record.object_key,
            file_size: record.file_size,
            version_num: record.version_num,
            created_at: Utc::now(),
        };
        table.rows.push(row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(text_id: i64, key: &str) -> NewAudioRecord {
        NewAudioRecord {
            text_id,
            user_id: 7,
            filename: "ep_短_v01.mp3".to_string(),
            object_key: key.to_string(),
            file_size: 1024,
            version_num: 1,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_object_key() {
        let repo = MemoryAudioRepository::default();
        repo.insert(sample(1, "audios/a/k/f.mp3")).await.unwrap();
        let err = repo.insert(sample(1, "audios/a/k/f.mp3")).await.unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(_)));

        let winner = repo
            .find_by_object_key("audios/a/k/f.mp3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner.id, 1);
    }

    #[tokio::test]
    async fn test_text_lookup_misses_return_none() {
        let repo = MemoryTextRepository::default();
        assert!(repo.get_text_by_id(99).await.unwrap().is_none());
    }
}
