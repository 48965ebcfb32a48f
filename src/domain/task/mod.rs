pub mod service;
pub mod stream;

pub use service::{TaskOutcome, TaskService};
pub use stream::stream_task_events;

use std::time::Duration;

/// Fixed pause after the remote service reports quota exhaustion, also
/// surfaced to callers as the recommended retry delay.
pub const QUOTA_BACKOFF: Duration = Duration::from_secs(60);

/// Artifacts below this size are treated as corrupt and regenerated.
pub const MIN_ARTIFACT_BYTES: u64 = 100;
