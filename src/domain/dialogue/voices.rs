/// Voice given to the first distinct role in a script.
pub const VOICE_FEMALE: &str = "zh_female_mizai_v2_saturn_bigtts";
/// Voice given to the second distinct role.
pub const VOICE_MALE: &str = "zh_male_dayi_v2_saturn_bigtts";

/// Assigns synthesis voices to roles in order of first appearance:
/// first role gets the female voice, second gets the male voice, and any
/// further new role falls back to the female voice. State lives for one
/// synthesis request only.
#[derive(Debug, Default)]
pub struct VoiceAssigner {
    first: Option<String>,
    second: Option<String>,
}

impl VoiceAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn voice_for(&mut self, role: &str) -> &'static str {
        match &self.first {
            None => {
                self.first = Some(role.to_string());
                VOICE_FEMALE
            }
            Some(first) if first == role => VOICE_FEMALE,
            Some(_) => match &self.second {
                None => {
                    self.second = Some(role.to_string());
                    VOICE_MALE
                }
                Some(second) if second == role => VOICE_MALE,
                // Third and later roles follow the first voice.
                Some(_) => VOICE_FEMALE,
            },
        }
    }
}
