pub mod memory;

pub use memory::MemoryKeystore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("keystore unavailable: {0}")]
    Unavailable(String),

    #[error("lease '{0}' could not be acquired within the wait bound")]
    LeaseTimeout(String),
}

/// One mutation inside an atomic [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum Command {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    HIncrByFloat {
        key: String,
        field: String,
        delta: f64,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Publish {
        channel: String,
        payload: String,
    },
}

/// An ordered group of mutations applied as one atomic unit.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    commands: Vec<Command>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset<K: Into<String>>(mut self, key: K, fields: Vec<(String, String)>) -> Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hincr_by<K: Into<String>, F: Into<String>>(mut self, key: K, field: F, delta: i64) -> Self {
        self.commands.push(Command::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    pub fn hincr_by_float<K: Into<String>, F: Into<String>>(
        mut self,
        key: K,
        field: F,
        delta: f64,
    ) -> Self {
        self.commands.push(Command::HIncrByFloat {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    pub fn sadd<K: Into<String>, M: Into<String>>(mut self, key: K, member: M) -> Self {
        self.commands.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem<K: Into<String>, M: Into<String>>(mut self, key: K, member: M) -> Self {
        self.commands.push(Command::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn publish<C: Into<String>, P: Into<String>>(mut self, channel: C, payload: P) -> Self {
        self.commands.push(Command::Publish {
            channel: channel.into(),
            payload: payload.into(),
        });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// Shared keystore used by the distributed task monitor: namespaced hashes
/// and sets, atomic multi-key writes, per-channel pub/sub with pattern
/// subscription, and short-lived mutual-exclusion leases.
///
/// Injected rather than reached for as a process-wide global, so backends
/// (a real Redis-style store in deployment, [`MemoryKeystore`] in tests and
/// single-node setups) are swappable behind the same contract.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KeystoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KeystoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KeystoreError>;

    async fn scard(&self, key: &str) -> Result<u64, KeystoreError>;

    /// Apply every command in the batch as one atomic unit, in order.
    async fn apply(&self, batch: WriteBatch) -> Result<(), KeystoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KeystoreError>;

    /// Subscribe to every channel matching `pattern` (trailing `*` glob).
    /// Messages arrive as `(channel, payload)` pairs.
    async fn psubscribe(
        &self,
        pattern: &str,
    ) -> Result<UnboundedReceiver<(String, String)>, KeystoreError>;

    /// Acquire a mutual-exclusion lease, blocking up to `wait`. The lease
    /// self-expires after `ttl` if not released.
    async fn acquire_lease(
        &self,
        name: &str,
        wait: Duration,
        ttl: Duration,
    ) -> Result<(), KeystoreError>;

    async fn release_lease(&self, name: &str) -> Result<(), KeystoreError>;
}
