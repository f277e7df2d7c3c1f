// ABOUTME: Text shaping for outbound delivery: paragraph-aware chunking for channel
// ABOUTME: size limits, plus markdown title and preview extraction for published pages.

/// Messages longer than this are offered to the content publisher
pub const PUBLISH_THRESHOLD: usize = 3000;
/// Hard per-chunk limit for channel delivery
pub const MAX_MSG_LEN: usize = 4000;
/// Preview length used in published-page summaries
pub const SUMMARY_PREVIEW_LEN: usize = 200;

/// Split long text into chunks of at most `max_len` characters, preferring
/// paragraph boundaries, then line boundaries, then a hard cut.
///
/// A boundary is only used when it sits past 30 % of `max_len`, so a stray
/// blank line near the start cannot produce a tiny leading chunk.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let min_break = max_len * 3 / 10;
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_len {
        let window_end = byte_offset_of_char(rest, max_len);
        let window = &rest[..window_end];

        if let Some(pos) = usable_break(window, "\n\n", min_break) {
            chunks.push(window[..pos].trim_end().to_string());
            rest = &rest[pos + 2..];
        } else if let Some(pos) = usable_break(window, "\n", min_break) {
            chunks.push(window[..pos].trim_end().to_string());
            rest = &rest[pos + 1..];
        } else {
            chunks.push(window.to_string());
            rest = &rest[window_end..];
        }
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Last occurrence of `sep` in `window` that lies past `min_break` characters
fn usable_break(window: &str, sep: &str, min_break: usize) -> Option<usize> {
    let pos = window.rfind(sep)?;
    if window[..pos].chars().count() > min_break {
        Some(pos)
    } else {
        None
    }
}

/// Byte offset of the `n`-th character, or the string length if shorter
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

fn take_chars(s: &str, n: usize) -> &str {
    &s[..byte_offset_of_char(s, n)]
}

/// Extract a page title from a message.
///
/// Tries the first markdown heading (`#` to `###`), then the first non-empty
/// line when it fits in 100 characters, then the first 60 characters with an
/// ellipsis.
pub fn extract_title(text: &str) -> String {
    for line in text.lines() {
        let hashes = line.chars().take_while(|c| *c == '#').count();
        if (1..=3).contains(&hashes) {
            let remainder = &line[hashes..];
            if remainder.starts_with(|c: char| c == ' ' || c == '\t') {
                let title = remainder.trim();
                if !title.is_empty() {
                    return take_chars(title, 100).to_string();
                }
            }
        }
    }

    if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
        if line.chars().count() <= 100 {
            return line.to_string();
        }
    }

    format!("{}...", take_chars(text, 60))
}

/// Plain-text preview for a published page: heading markers and inline
/// markdown characters stripped, truncated to `max_len` with an ellipsis.
pub fn preview(text: &str, max_len: usize) -> String {
    let mut stripped = String::with_capacity(text.len());
    for line in text.lines() {
        let line = strip_heading_marker(line);
        stripped.extend(line.chars().filter(|c| !matches!(c, '*' | '_' | '~' | '`')));
        stripped.push('\n');
    }

    let stripped = stripped.trim();
    if stripped.chars().count() <= max_len {
        stripped.to_string()
    } else {
        format!("{}…", take_chars(stripped, max_len).trim_end())
    }
}

fn strip_heading_marker(line: &str) -> &str {
    let rest = line.trim_start_matches('#');
    if rest.len() == line.len() {
        line
    } else {
        rest.trim_start()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_single_chunk() {
        let text = "hello world";
        assert_eq!(split_message(text, 4000), vec![text.to_string()]);
    }

    #[test]
    fn test_exact_limit_is_single_chunk() {
        let text = "a".repeat(4000);
        assert_eq!(split_message(&text, 4000), vec![text.clone()]);
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "a".repeat(9000);
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4000);
        assert_eq!(chunks[1].len(), 4000);
        assert_eq!(chunks[2].len(), 1000);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let first = "x".repeat(3000);
        let second = "y".repeat(2000);
        let text = format!("{}\n\n{}", first, second);
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks, vec![first, second]);
    }

    #[test]
    fn test_falls_back_to_line_boundary() {
        let first = "x".repeat(3000);
        let second = "y".repeat(2000);
        let text = format!("{}\n{}", first, second);
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks, vec![first, second]);
    }

    #[test]
    fn test_early_boundary_is_ignored() {
        // The only paragraph break sits at 2.5% of the limit, well under the
        // 30% floor, so the splitter hard-cuts instead.
        let text = format!("{}\n\n{}", "x".repeat(100), "y".repeat(5000));
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks[0].chars().count(), 4000);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4000));
    }

    #[test]
    fn test_reassembly_modulo_boundary_whitespace() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            "a".repeat(2000),
            "b".repeat(2500),
            "c".repeat(2500)
        );
        let chunks = split_message(&text, 4000);
        let rejoined: String = chunks.concat();
        let original: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let reassembled: String = rejoined.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(original, reassembled);
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(5000);
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4000);
        assert_eq!(chunks[1].chars().count(), 1000);
    }

    #[test]
    fn test_title_from_heading() {
        let text = "intro line\n\n## Rapport hebdomadaire\n\nbody";
        assert_eq!(extract_title(text), "Rapport hebdomadaire");
    }

    #[test]
    fn test_title_ignores_deep_headings() {
        let text = "#### not a title\nFirst real line";
        assert_eq!(extract_title(text), "#### not a title");
    }

    #[test]
    fn test_title_from_first_line() {
        let text = "Short opening line\nand more text";
        assert_eq!(extract_title(text), "Short opening line");
    }

    #[test]
    fn test_title_truncates_long_first_line() {
        let text = "w".repeat(150);
        let title = extract_title(&text);
        assert_eq!(title, format!("{}...", "w".repeat(60)));
    }

    #[test]
    fn test_title_caps_heading_length() {
        let text = format!("# {}", "t".repeat(300));
        assert_eq!(extract_title(&text).chars().count(), 100);
    }

    #[test]
    fn test_preview_strips_markdown() {
        let text = "## Titre\n\nDu texte avec **gras** et `code` et _italique_.";
        let p = preview(text, SUMMARY_PREVIEW_LEN);
        assert!(p.starts_with("Titre"));
        assert!(!p.contains('*'));
        assert!(!p.contains('`'));
        assert!(!p.contains('_'));
        assert!(p.contains("gras"));
    }

    #[test]
    fn test_preview_truncates_with_ellipsis() {
        let text = "z".repeat(500);
        let p = preview(&text, SUMMARY_PREVIEW_LEN);
        assert_eq!(p.chars().count(), SUMMARY_PREVIEW_LEN + 1);
        assert!(p.ends_with('…'));
    }
}
