//! Post-processing: deterministic cleanup of recognised page text.
//!
//! Applied to every page's text, whatever produced it (tesseract, a vision
//! model, or a PDF text layer), before aggregation. The rules only touch
//! whitespace, invisible characters and wrapper fences; recognised words are
//! never altered.
//!
//! ## Rule Order
//!
//! Fences are stripped before line endings are normalised so the fence regex
//! sees the raw model output; invisible characters go before whitespace
//! trimming so a line holding only a zero-width space ends up blank.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to one page's text.
///
/// Rules (applied in order):
/// 1. Strip outer code fences (vision models sometimes add them)
/// 2. Normalise line endings (CRLF / CR → LF)
/// 3. Strip invisible Unicode and stray form feeds
/// 4. Trim trailing whitespace per line
/// 5. Collapse runs of blank lines to a single blank line
/// 6. Trim leading and trailing blank lines
pub fn clean_text(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    trim_blank_edges(&s)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[a-zA-Z]*\r?\n(.*?)\r?\n```\s*$").expect("static regex is valid")
});

fn strip_code_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible characters ──────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{000C}',
        ],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse blank-line runs ─────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("static regex is valid"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 6: Trim blank edges ─────────────────────────────────────────────

fn trim_blank_edges(input: &str) -> String {
    input.trim_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_code_fences("```text\nHello\nWorld\n```"), "Hello\nWorld");
        assert_eq!(strip_code_fences("```\nHello\n```  "), "Hello");
        assert_eq!(strip_code_fences("Hello ```x```"), "Hello ```x```");
    }

    #[test]
    fn normalises_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn removes_invisible_characters() {
        assert_eq!(
            remove_invisible_chars("in\u{200B}voice\u{FEFF} no\u{00AD}\u{000C}"),
            "invoice no"
        );
    }

    #[test]
    fn collapses_blank_runs_to_one_blank_line() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_lines("a\n\nb"), "a\n\nb");
    }

    #[test]
    fn keeps_leading_indentation() {
        assert_eq!(trim_trailing_whitespace("  total   \nsum\t"), "  total\nsum");
    }

    #[test]
    fn full_pipeline() {
        let raw = "\r\n```\r\nInvoice 42   \r\n\r\n\r\n\r\nTotal:\u{200B} 10 EUR\r\n```\r\n";
        assert_eq!(clean_text(raw), "Invoice 42\n\nTotal: 10 EUR");
    }

    #[test]
    fn empty_and_whitespace_pages() {
        assert_eq!(clean_text(""), "");
        assert_eq!(clean_text("\n \n\u{FEFF}\n"), "");
    }

    #[test]
    fn is_idempotent() {
        let once = clean_text("a  \n\n\n\nb\r\n");
        assert_eq!(clean_text(&once), once);
    }
}
