use std::sync::LazyLock;

use regex::Regex;

use crate::error::{AppError, AppResult};

/// One parsed script line: who speaks and what they say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub role: String,
    pub content: String,
}

// Matches `role [（description）] ： content` with both full-width and
// ASCII colons/parentheses, e.g. "A: hi", "小童（旁白）：开始吧".
static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<role>[^（(:：]+?)\s*(?:[（(][^）)]*[）)])?\s*[:：]\s*(?P<content>.+)$")
        .unwrap()
});

// Bracketed stage directions inside content, e.g. "[pause]", "[笑]".
static STAGE_DIRECTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]+\]").unwrap());

/// Parse speaker-tagged dialogue text into role/content pairs.
///
/// Lines that do not match the pattern are skipped, as are lines whose
/// content is empty after stripping stage directions. Validity of the
/// document as a whole is [`validate_dialogue`]'s job.
pub fn parse_dialogue(text: &str) -> Vec<DialogueLine> {
    let mut lines = Vec::new();

    for raw in text.trim().lines() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let Some(caps) = LINE_PATTERN.captures(raw) else {
            continue;
        };

        let role = caps["role"].trim().to_string();
        let content = STAGE_DIRECTION
            .replace_all(&caps["content"], "")
            .trim()
            .to_string();

        if !content.is_empty() {
            lines.push(DialogueLine { role, content });
        }
    }

    lines
}

/// Reject documents in which not a single line matches the dialogue format.
pub fn validate_dialogue(text: &str) -> AppResult<()> {
    if parse_dialogue(text).is_empty() {
        return Err(AppError::Validation(
            "text does not match the dialogue format; expected lines like \
             `name: content` or `name (description): content`"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ascii_colon() {
        let lines = parse_dialogue("A: Hello there.\nB: Hi!");
        assert_eq!(
            lines,
            vec![
                DialogueLine {
                    role: "A".to_string(),
                    content: "Hello there.".to_string()
                },
                DialogueLine {
                    role: "B".to_string(),
                    content: "Hi!".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_full_width_colon_and_description() {
        let lines = parse_dialogue("小童（旁白）：开始吧\n婷婷(活泼)：哈喽，大家好！");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, "小童");
        assert_eq!(lines[0].content, "开始吧");
        assert_eq!(lines[1].role, "婷婷");
        assert_eq!(lines[1].content, "哈喽，大家好！");
    }

    #[test]
    fn test_parse_strips_stage_directions() {
        let lines = parse_dialogue("A: Well [pause] hello [笑] there.");
        assert_eq!(lines[0].content, "Well  hello  there.".trim());
    }

    #[test]
    fn test_parse_skips_non_matching_lines() {
        let lines = parse_dialogue("just a narrator line\nA: real content\n\n---\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].role, "A");
    }

    #[test]
    fn test_parse_drops_line_emptied_by_stripping() {
        let lines = parse_dialogue("A: [pause]\nB: kept");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].role, "B");
    }

    #[test]
    fn test_validate_rejects_zero_matching_lines() {
        let err = validate_dialogue("no speakers here\nplain prose").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_validate_accepts_mixed_document() {
        validate_dialogue("prose line\nA: but this one matches").unwrap();
    }
}
