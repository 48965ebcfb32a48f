/// Minimum fraction of the window a split point must lie past, so a split
/// never produces a too-short leading fragment.
pub const MIN_SPLIT_RATIO: f64 = 0.7;

const CJK_TERMINATORS: [char; 3] = ['。', '？', '！'];
const ASCII_TERMINATORS: [char; 3] = ['.', '?', '!'];

/// Split an oversized turn into segments of at most `max_length` characters.
///
/// Split points are searched backward from the window boundary, preferring
/// full-width sentence terminators over ASCII ones, and accepted only past
/// `MIN_SPLIT_RATIO` of the window; the terminator stays with the leading
/// segment. With no acceptable terminator the turn is cut hard at
/// `max_length`. Lengths are counted in characters, not bytes.
pub fn split_long_turn(content: &str, max_length: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= max_length {
        return vec![content.to_string()];
    }

    let threshold = max_length as f64 * MIN_SPLIT_RATIO;
    let mut segments = Vec::new();
    let mut rest: &[char] = &chars;

    while rest.len() > max_length {
        let window = &rest[..max_length];

        let mut split_pos = max_length;
        'search: for group in [CJK_TERMINATORS, ASCII_TERMINATORS] {
            for punct in group {
                if let Some(pos) = window.iter().rposition(|&c| c == punct) {
                    if pos as f64 > threshold {
                        split_pos = pos + 1; // keep the terminator
                        break 'search;
                    }
                }
            }
        }

        let (head, tail) = rest.split_at(split_pos);
        let segment = head.iter().collect::<String>().trim().to_string();
        if !segment.is_empty() {
            segments.push(segment);
        }
        rest = trim_chars(tail);
    }

    if !rest.is_empty() {
        segments.push(rest.iter().collect::<String>().trim().to_string());
    }

    if segments.len() > 1 {
        tracing::debug!(
            original_length = chars.len(),
            segment_count = segments.len(),
            "long turn segmented"
        );
    }

    segments
}

fn trim_chars(chars: &[char]) -> &[char] {
    let start = chars
        .iter()
        .position(|c| !c.is_whitespace())
        .unwrap_or(chars.len());
    let end = chars
        .iter()
        .rposition(|c| !c.is_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &chars[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn test_short_turn_untouched() {
        let segments = split_long_turn("short sentence.", 250);
        assert_eq!(segments, vec!["short sentence.".to_string()]);
    }

    #[test]
    fn test_split_prefers_period_past_ratio() {
        // 600 chars with a period at index 240: the first segment must end
        // right after the period (length 241), not at the hard 250 cut.
        let mut text = "a".repeat(240);
        text.replace_range(239..240, ".");
        text.push_str(&"b".repeat(360));
        assert_eq!(char_len(&text), 600);

        let segments = split_long_turn(&text, 250);
        assert_eq!(char_len(&segments[0]), 240);
        assert!(segments[0].ends_with('.'));
    }

    #[test]
    fn test_split_period_at_position_240() {
        // Period as the 241st character (index 240) qualifies: 240 > 175.
        let text = format!("{}.{}", "a".repeat(240), "b".repeat(359));
        let segments = split_long_turn(&text, 250);
        assert_eq!(char_len(&segments[0]), 241);
        assert!(segments[0].ends_with('.'));
    }

    #[test]
    fn test_too_early_punctuation_forces_hard_cut() {
        // Period at index 100 is below the 0.7 floor for max 250.
        let text = format!("{}.{}", "a".repeat(100), "b".repeat(400));
        let segments = split_long_turn(&text, 250);
        assert_eq!(char_len(&segments[0]), 250);
    }

    #[test]
    fn test_cjk_terminator_preferred_over_ascii() {
        let text = format!("{}。{}.{}", "字".repeat(200), "字".repeat(20), "字".repeat(200));
        let segments = split_long_turn(&text, 250);
        // ASCII '.' sits at index 221, the full-width '。' at 200; the
        // full-width terminator wins even though both qualify.
        assert_eq!(char_len(&segments[0]), 201);
        assert!(segments[0].ends_with('。'));
    }

    #[test]
    fn test_no_punctuation_hard_cuts_at_max() {
        let text = "x".repeat(1000);
        let segments = split_long_turn(&text, 250);
        assert_eq!(segments.len(), 4);
        assert!(segments.iter().all(|s| char_len(s) == 250));
    }

    #[test]
    fn test_segments_respect_bounds_and_content_roundtrip() {
        let sentence = "这是一个完整的句子。";
        let text = sentence.repeat(80); // 800 chars
        let segments = split_long_turn(&text, 250);

        for segment in &segments {
            assert!(char_len(segment) <= 250);
        }
        // Non-final segments stay above the minimum split fraction.
        for segment in &segments[..segments.len() - 1] {
            assert!(char_len(segment) as f64 > 250.0 * MIN_SPLIT_RATIO);
        }
        let rejoined: String = segments.concat();
        assert_eq!(rejoined, text);
    }
}
