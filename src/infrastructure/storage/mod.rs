use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Character count above which an artifact is tagged as "long" in its
/// filename.
pub const LONG_SCRIPT_THRESHOLD: usize = 4000;

const UPLOAD_ATTEMPTS: u32 = 3;
const UPLOAD_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Public-read object storage. Implementations return a stable public URL
/// for every stored object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, object_key: &str) -> Result<bool, StorageError>;

    /// Size in bytes. `NotFound` if the object does not exist.
    async fn size(&self, object_key: &str) -> Result<u64, StorageError>;

    /// Store the object and return its public URL.
    async fn put_bytes(
        &self,
        object_key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<String, StorageError>;

    async fn delete(&self, object_key: &str) -> Result<(), StorageError>;

    fn public_url(&self, object_key: &str) -> String;
}

/// Upload with bounded retries. Transient store failures get an
/// exponentially growing pause between attempts; the last error wins.
pub async fn put_bytes_with_retry(
    store: &dyn ObjectStore,
    object_key: &str,
    data: &[u8],
    content_type: Option<&str>,
) -> Result<String, StorageError> {
    let mut backoff = UPLOAD_BACKOFF;
    let mut last_err = None;

    for attempt in 1..=UPLOAD_ATTEMPTS {
        match store.put_bytes(object_key, data, content_type).await {
            Ok(url) => return Ok(url),
            Err(err) => {
                tracing::warn!(
                    object_key,
                    attempt,
                    error = %err,
                    "object upload failed"
                );
                last_err = Some(err);
                if attempt < UPLOAD_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| StorageError::Unavailable("upload failed".to_string())))
}

/// Make a title safe for use as one object-key path segment.
pub fn sanitize_path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

/// Artifact filename: base name, a length tag (long or short form), and a
/// two digit version.
pub fn compute_audio_filename(base_name: &str, char_count: usize, next_version: u32) -> String {
    let length_tag = if char_count > LONG_SCRIPT_THRESHOLD {
        "长"
    } else {
        "短"
    };
    format!("{}_{}_v{:02}.mp3", base_name, length_tag, next_version)
}

/// In-memory [`ObjectStore`] used in tests and local development.
#[derive(Clone)]
pub struct MemoryObjectStore {
    base_url: String,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("https://audio.test.local")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, object_key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().contains_key(object_key))
    }

    async fn size(&self, object_key: &str) -> Result<u64, StorageError> {
        self.objects
            .lock()
            .get(object_key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(object_key.to_string()))
    }

    async fn put_bytes(
        &self,
        object_key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        self.objects
            .lock()
            .insert(object_key.to_string(), data.to_vec());
        Ok(self.public_url(object_key))
    }

    async fn delete(&self, object_key: &str) -> Result<(), StorageError> {
        self.objects.lock().remove(object_key);
        Ok(())
    }

    fn public_url(&self, object_key: &str) -> String {
        format!("{}/{}", self.base_url, object_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_filename_tags_short_scripts() {
        assert_eq!(compute_audio_filename("episode", 120, 1), "episode_短_v01.mp3");
    }

    #[test]
    fn test_filename_tags_long_scripts() {
        assert_eq!(compute_audio_filename("episode", 4001, 12), "episode_长_v12.mp3");
    }

    #[test]
    fn test_sanitize_replaces_separators_and_whitespace() {
        assert_eq!(sanitize_path_segment("my show / ep 1"), "my_show___ep_1");
        assert_eq!(sanitize_path_segment("   "), "untitled");
        assert_eq!(sanitize_path_segment("第一集"), "第一集");
    }

    struct FlakyStore {
        inner: MemoryObjectStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn exists(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.exists(key).await
        }
        async fn size(&self, key: &str) -> Result<u64, StorageError> {
            self.inner.size(key).await
        }
        async fn put_bytes(
            &self,
            key: &str,
            data: &[u8],
            content_type: Option<&str>,
        ) -> Result<String, StorageError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err(StorageError::Unavailable("transient".to_string()));
            }
            self.inner.put_bytes(key, data, content_type).await
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }
        fn public_url(&self, key: &str) -> String {
            self.inner.public_url(key)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retries_transient_failures() {
        let store = FlakyStore {
            inner: MemoryObjectStore::default(),
            failures_left: AtomicU32::new(2),
        };
        let url = put_bytes_with_retry(&store, "audios/x/a.mp3", b"data", Some("audio/mpeg"))
            .await
            .unwrap();
        assert_eq!(url, "https://audio.test.local/audios/x/a.mp3");
        assert!(store.inner.exists("audios/x/a.mp3").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_gives_up_after_three_attempts() {
        let store = FlakyStore {
            inner: MemoryObjectStore::default(),
            failures_left: AtomicU32::new(10),
        };
        let result = put_bytes_with_retry(&store, "audios/x/a.mp3", b"data", None).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
        assert_eq!(store.failures_left.load(Ordering::SeqCst), 7);
    }
}
