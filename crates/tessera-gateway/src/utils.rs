//! Small text helpers shared by the dispatcher and the cursor engine

/// Characters of command text kept in log fields
pub const PREVIEW_CHARS: usize = 100;

/// First [`PREVIEW_CHARS`] characters of `text`, cut on a char boundary
pub fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(PREVIEW_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_text_unchanged() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview(""), "");
    }

    #[test]
    fn test_preview_counts_chars_not_bytes() {
        assert_eq!(preview(&"é".repeat(150)).chars().count(), PREVIEW_CHARS);

        // Byte 100 falls inside the 'é' that starts at byte 99
        let text = format!("SELECT {}", "é".repeat(120));
        assert!(!text.is_char_boundary(100));
        assert_eq!(preview(&text).chars().count(), PREVIEW_CHARS);
    }
}
