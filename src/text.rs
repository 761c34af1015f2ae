//! Text preparation before extraction

use blake3::Hasher;
use unicode_segmentation::UnicodeSegmentation;

/// Marker appended to content cut at the extraction bound
pub const TRUNCATION_MARKER: &str = "\n... [Document truncated for processing]";

/// Normalize raw document text.
///
/// Drops control characters other than `\n` and `\t`, collapses runs of
/// spaces and tabs to one space, collapses three or more newlines to two,
/// and trims the result.
pub fn clean_content(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    let mut newlines = 0usize;

    for c in raw.chars() {
        match c {
            ' ' | '\t' => pending_space = true,
            '\n' => {
                pending_space = false;
                newlines += 1;
            }
            c if c.is_control() => {}
            c => {
                if newlines > 0 {
                    out.push_str(if newlines >= 2 { "\n\n" } else { "\n" });
                    newlines = 0;
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    out
}

/// Cut `text` to at most `max` grapheme clusters, appending [`TRUNCATION_MARKER`]
/// when anything was dropped.
pub fn bound_content(text: &str, max: usize) -> String {
    match grapheme_prefix(text, max) {
        Some(prefix) => format!("{}{}", prefix, TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Title for a requirement that arrived without one: its first line, cut to
/// `max` grapheme clusters with a trailing `...`.
pub fn derive_title(text: &str, max: usize) -> String {
    let first_line = text.trim().lines().next().unwrap_or_default().trim();
    match grapheme_prefix(first_line, max) {
        Some(prefix) => format!("{}...", prefix.trim_end()),
        None => first_line.to_string(),
    }
}

/// Fingerprint of document content
pub fn content_hash(text: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(text.as_bytes());
    hasher.finalize().to_hex().to_string()
}

// `None` if the text already fits
fn grapheme_prefix(text: &str, max: usize) -> Option<&str> {
    let (end, _) = text.grapheme_indices(true).nth(max)?;
    Some(&text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_content() {
        let raw = "  The system\t\tshall  respond.\u{0007}\n\n\n\nWithin 2s.\r\n  ";
        assert_eq!(clean_content(raw), "The system shall respond.\n\nWithin 2s.");
    }

    #[test]
    fn test_clean_keeps_single_newlines() {
        assert_eq!(clean_content("a\nb\n\nc"), "a\nb\n\nc");
    }

    #[test]
    fn test_bound_content() {
        assert_eq!(bound_content("short", 10), "short");
        assert_eq!(
            bound_content("abcdefghij", 4),
            format!("abcd{}", TRUNCATION_MARKER)
        );
    }

    #[test]
    fn test_bound_is_grapheme_safe() {
        // Each flag is one grapheme made of two code points
        let flags = "🇩🇪🇫🇷🇮🇹";
        assert_eq!(bound_content(flags, 2), format!("🇩🇪🇫🇷{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("Users can log in\nvia SSO", 100), "Users can log in");
        assert_eq!(derive_title("The system shall", 10), "The system...");
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }
}
