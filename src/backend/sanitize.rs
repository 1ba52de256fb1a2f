//! Prompt input sanitization.
//!
//! Episode content arrives from arbitrary sources and regularly carries
//! zero-width characters (copy-pasted from rich text) or stray control
//! bytes. Both confuse model tokenizers and break JSON replies, so every
//! outbound message is scrubbed before dispatch.

use super::Message;

/// Zero-width characters stripped from prompt input.
const ZERO_WIDTH: [char; 5] = [
    '\u{200B}', // zero width space
    '\u{200C}', // zero width non-joiner
    '\u{200D}', // zero width joiner
    '\u{FEFF}', // byte order mark
    '\u{2060}', // word joiner
];

/// Remove zero-width characters and control characters from `input`,
/// keeping newlines, carriage returns, and tabs. All other text, including
/// non-ASCII, passes through untouched.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|c| !ZERO_WIDTH.contains(c))
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Sanitize every message of a rendered prompt.
pub fn sanitize_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| Message {
            role: m.role,
            content: sanitize(&m.content),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Role;

    #[test]
    fn test_strips_zero_width_characters() {
        let input = "Ali\u{200B}ce\u{200C} wor\u{200D}ks at\u{2060} Initech\u{FEFF}";
        assert_eq!(sanitize(input), "Alice works at Initech");
    }

    #[test]
    fn test_drops_control_characters() {
        let input = "hello\u{0000}\u{0007} world\u{001B}[0m";
        assert_eq!(sanitize(input), "hello world[0m");
    }

    #[test]
    fn test_keeps_whitespace_controls() {
        let input = "line one\nline two\r\n\tindented";
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn test_keeps_non_ascii_text() {
        let input = "Zoé works in Zürich on 日本語 docs 🚀";
        assert_eq!(sanitize(input), input);
    }

    #[test]
    fn test_sanitize_messages_preserves_roles() {
        let messages = vec![
            Message::system("sys\u{200B}tem"),
            Message::user("u\u{0001}ser"),
        ];
        let clean = sanitize_messages(&messages);
        assert_eq!(clean[0].role, Role::System);
        assert_eq!(clean[0].content, "system");
        assert_eq!(clean[1].role, Role::User);
        assert_eq!(clean[1].content, "user");
    }
}
