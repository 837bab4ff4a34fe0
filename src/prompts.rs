//! Prompts for the vision recognizer.
//!
//! Kept apart from [`crate::pipeline::vision`] so prompt wording can be
//! inspected and tested without a provider.

/// System prompt asking a vision model for a plain-text transcription.
pub const TRANSCRIPTION_PROMPT: &str = r#"You are an OCR engine. Transcribe all text visible in the page image exactly as written.

Rules:
1. Output plain text only. No Markdown, no code fences, no commentary.
2. Keep the reading order a human would use, top to bottom, column by column.
3. Put each text line on its own line. Separate paragraphs and blocks with one blank line.
4. Do not translate, summarise, correct spelling or expand abbreviations.
5. Transcribe tables row by row, cells separated by a single tab.
6. If a word is illegible, write [illegible] in its place.
7. If the page contains no text, output nothing."#;

/// Sentence naming the expected languages, appended to the system prompt.
///
/// Language hints are tesseract codes (`eng`, `deu`, `chi_sim`); models
/// understand them well enough as written.
pub fn language_hint(languages: &[String]) -> String {
    match languages {
        [] => String::new(),
        [one] => format!("\n\nThe page is expected to be in this language: {one}."),
        many => format!(
            "\n\nThe page may contain these languages: {}.",
            many.join(", ")
        ),
    }
}

/// Full system prompt for the given language hints.
pub fn transcription_prompt(languages: &[String]) -> String {
    format!("{TRANSCRIPTION_PROMPT}{}", language_hint(languages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_forbids_markdown() {
        assert!(TRANSCRIPTION_PROMPT.contains("No Markdown"));
    }

    #[test]
    fn language_hint_variants() {
        assert_eq!(language_hint(&[]), "");
        assert!(language_hint(&["deu".into()]).contains("language: deu."));
        assert!(language_hint(&["eng".into(), "fra".into()]).contains("eng, fra"));
    }

    #[test]
    fn transcription_prompt_appends_hint() {
        let p = transcription_prompt(&["eng".into()]);
        assert!(p.starts_with(TRANSCRIPTION_PROMPT));
        assert!(p.ends_with("language: eng."));
    }
}
