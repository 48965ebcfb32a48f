pub mod codec;
pub mod session;

pub use session::{AuthCheck, PodcastTtsClient};

use async_trait::async_trait;

use crate::domain::dialogue::DialogueTurn;

/// Remote error code the speech service returns when the account's
/// concurrency quota is exhausted.
pub const QUOTA_EXCEEDED_CODE: u32 = 45000292;

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("concurrency quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("server error [{code}]: {payload}")]
    Server { code: i32, payload: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no audio received")]
    NoAudio,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Turns an ordered list of dialogue rounds into one audio artifact.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, turns: &[DialogueTurn]) -> Result<Vec<u8>, SynthesisError>;
}
