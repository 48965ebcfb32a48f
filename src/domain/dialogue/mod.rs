pub mod parser;
pub mod segmenter;
pub mod voices;

pub use parser::{parse_dialogue, validate_dialogue, DialogueLine};
pub use segmenter::split_long_turn;
pub use voices::VoiceAssigner;

use serde::Serialize;

/// One synthesis-ready turn: a concrete voice plus the text it speaks.
/// This is the unit the protocol engine sends to the remote synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialogueTurn {
    pub speaker: String,
    pub text: String,
}

/// Maximum characters the remote service accepts per dialogue round.
pub const MAX_ROUND_LENGTH: usize = 250;

/// Parse a raw script into synthesis-ready turns: match speaker-tagged
/// lines, assign voices in order of appearance, and split turns that
/// exceed the per-round limit.
///
/// Voice assignment state is scoped to this call, so the same script
/// always produces the same voices regardless of earlier requests.
pub fn build_turns(text: &str) -> Vec<DialogueTurn> {
    build_turns_with_limit(text, MAX_ROUND_LENGTH)
}

pub fn build_turns_with_limit(text: &str, max_round_length: usize) -> Vec<DialogueTurn> {
    let mut assigner = VoiceAssigner::new();
    let mut turns = Vec::new();

    for line in parse_dialogue(text) {
        let speaker = assigner.voice_for(&line.role).to_string();
        for segment in split_long_turn(&line.content, max_round_length) {
            turns.push(DialogueTurn {
                speaker: speaker.clone(),
                text: segment,
            });
        }
    }

    turns
}
