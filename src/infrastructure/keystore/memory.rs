use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use super::{Command, Keystore, KeystoreError, WriteBatch};

/// In-process [`Keystore`] implementation. Backs the distributed task
/// monitor in tests and single-node deployments; every operation holds one
/// lock, which makes `apply` trivially atomic.
#[derive(Default)]
pub struct MemoryKeystore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    leases: HashMap<String, Instant>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    pattern: String,
    sender: UnboundedSender<(String, String)>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish_locked(state: &mut State, channel: &str, payload: &str) {
        state.subscribers.retain(|sub| {
            if !pattern_matches(&sub.pattern, channel) {
                return true;
            }
            // Drop subscribers whose receiver is gone.
            sub.sender
                .send((channel.to_string(), payload.to_string()))
                .is_ok()
        });
    }

    fn apply_locked(state: &mut State, command: Command) {
        match command {
            Command::HSet { key, fields } => {
                let hash = state.hashes.entry(key).or_default();
                for (field, value) in fields {
                    hash.insert(field, value);
                }
            }
            Command::HIncrBy { key, field, delta } => {
                let hash = state.hashes.entry(key).or_default();
                let current: i64 = hash.get(&field).and_then(|v| v.parse().ok()).unwrap_or(0);
                hash.insert(field, (current + delta).to_string());
            }
            Command::HIncrByFloat { key, field, delta } => {
                let hash = state.hashes.entry(key).or_default();
                let current: f64 = hash.get(&field).and_then(|v| v.parse().ok()).unwrap_or(0.0);
                hash.insert(field, (current + delta).to_string());
            }
            Command::SAdd { key, member } => {
                state.sets.entry(key).or_default().insert(member);
            }
            Command::SRem { key, member } => {
                if let Some(set) = state.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
            Command::Publish { channel, payload } => {
                Self::publish_locked(state, &channel, &payload);
            }
        }
    }
}

/// Trailing-`*` glob match; the monitor only subscribes to channel prefixes.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KeystoreError> {
        Ok(self
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KeystoreError> {
        Ok(self.state.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KeystoreError> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<u64, KeystoreError> {
        Ok(self.state.lock().sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), KeystoreError> {
        let mut state = self.state.lock();
        for command in batch.into_commands() {
            Self::apply_locked(&mut state, command);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KeystoreError> {
        Self::publish_locked(&mut self.state.lock(), channel, payload);
        Ok(())
    }

    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<UnboundedReceiver<(String, String)>, KeystoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            sender: tx,
        });
        Ok(rx)
    }

    async fn acquire_lease(
        &self,
        name: &str,
        wait: Duration,
        ttl: Duration,
    ) -> Result<(), KeystoreError> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock();
                let now = Instant::now();
                let held = state.leases.get(name).is_some_and(|expiry| *expiry > now);
                if !held {
                    state.leases.insert(name.to_string(), now + ttl);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(KeystoreError::LeaseTimeout(name.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn release_lease(&self, name: &str) -> Result<(), KeystoreError> {
        self.state.lock().leases.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_is_applied_in_order() {
        let store = MemoryKeystore::new();
        store
            .apply(
                WriteBatch::new()
                    .hset("h", vec![("a".to_string(), "1".to_string())])
                    .hincr_by("h", "a", 2)
                    .sadd("s", "x"),
            )
            .await
            .unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.smembers("s").await.unwrap(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_pattern_subscription_receives_batched_publish() {
        let store = MemoryKeystore::new();
        let mut rx = store.psubscribe("ns:events:*").await.unwrap();

        store
            .apply(WriteBatch::new().publish("ns:events:7", "hello"))
            .await
            .unwrap();
        store.publish("other:events:7", "ignored").await.unwrap();

        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, "ns:events:7");
        assert_eq!(payload, "hello");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lease_blocks_second_holder_until_release() {
        let store = MemoryKeystore::new();
        store
            .acquire_lease("l", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();

        let err = store
            .acquire_lease("l", Duration::from_millis(30), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoreError::LeaseTimeout(_)));

        store.release_lease("l").await.unwrap();
        store
            .acquire_lease("l", Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reacquired() {
        let store = MemoryKeystore::new();
        store
            .acquire_lease("l", Duration::from_millis(10), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .acquire_lease("l", Duration::from_millis(10), Duration::from_secs(30))
            .await
            .unwrap();
    }
}
