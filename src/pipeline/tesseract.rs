//! Tesseract engine: runs the `tesseract` CLI as a child process.
//!
//! The page goes in as PNG on stdin and comes back as TSV on stdout, so no
//! temporary files are involved. The child is spawned with `kill_on_drop`:
//! when [`crate::pipeline::recognize::recognize_page`] abandons an attempt at
//! its deadline the process is killed with it.

use crate::config::OcrConfig;
use crate::error::RecognizeError;
use crate::output::WordBox;
use crate::pipeline::encode::encode_png;
use crate::pipeline::preprocess::PreparedPage;
use crate::pipeline::recognize::{Recognition, Recognizer};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Columns of `tesseract ... tsv` output.
const TSV_COLUMNS: usize = 12;

/// TSV level of a single word.
const WORD_LEVEL: u32 = 5;

pub struct TesseractRecognizer {
    binary: PathBuf,
    psm: u8,
}

impl TesseractRecognizer {
    pub fn new(binary: impl Into<PathBuf>, psm: u8) -> Self {
        Self {
            binary: binary.into(),
            psm,
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        Self::new(config.tesseract_bin.clone(), config.tesseract_psm)
    }

    fn command(&self, languages: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(languages.join("+"))
            .arg("--psm")
            .arg(self.psm.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn recognize(
        &self,
        page: &PreparedPage,
        languages: &[String],
    ) -> Result<Recognition, RecognizeError> {
        let png = encode_png(&page.image)
            .map_err(|e| RecognizeError::Failed(format!("PNG encoding failed: {e}")))?;

        let mut child = self.command(languages).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RecognizeError::Unavailable(format!(
                    "'{}' not found; install tesseract-ocr",
                    self.binary.display()
                ))
            } else {
                RecognizeError::Failed(format!("failed to start tesseract: {e}"))
            }
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognizeError::Failed("tesseract stdin not captured".into()))?;

        let feed = async move {
            stdin.write_all(&png).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output =
            output.map_err(|e| RecognizeError::Failed(format!("tesseract did not finish: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognizeError::Failed(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        fed.map_err(|e| RecognizeError::Failed(format!("writing page to tesseract: {e}")))?;

        let recognition = parse_tsv(&String::from_utf8_lossy(&output.stdout))?;
        debug!(
            "Page {}: tesseract returned {} words",
            page.index + 1,
            recognition.words.len()
        );
        Ok(recognition)
    }
}

/// Rebuild page text, word boxes and confidence from tesseract TSV.
///
/// Words on one line are joined by spaces, lines by newlines, and
/// paragraphs or blocks by a blank line. Rows with confidence -1 are layout
/// rows, not words.
pub fn parse_tsv(tsv: &str) -> Result<Recognition, RecognizeError> {
    let mut text = String::new();
    let mut words = Vec::new();
    let mut conf_sum = 0.0f64;
    let mut last_key: Option<(u32, u32, u32)> = None;

    for (line_no, row) in tsv.lines().enumerate() {
        if row.trim().is_empty() || row.starts_with("level") {
            continue;
        }
        let fields: Vec<&str> = row.splitn(TSV_COLUMNS, '\t').collect();
        if fields.len() < TSV_COLUMNS - 1 {
            return Err(RecognizeError::InvalidOutput(format!(
                "TSV row {} has {} columns",
                line_no + 1,
                fields.len()
            )));
        }

        let num = |i: usize| -> Result<u32, RecognizeError> {
            fields[i].trim().parse::<u32>().map_err(|_| {
                RecognizeError::InvalidOutput(format!(
                    "TSV row {}: column {} is not a number: '{}'",
                    line_no + 1,
                    i + 1,
                    fields[i]
                ))
            })
        };

        if num(0)? != WORD_LEVEL {
            continue;
        }
        let conf: f32 = fields[10].trim().parse().map_err(|_| {
            RecognizeError::InvalidOutput(format!(
                "TSV row {}: bad confidence '{}'",
                line_no + 1,
                fields[10]
            ))
        })?;
        let word = fields.get(11).map(|w| w.trim()).unwrap_or("");
        if conf < 0.0 || word.is_empty() {
            continue;
        }

        let key = (num(2)?, num(3)?, num(4)?);
        match last_key {
            None => {}
            Some((block, par, _)) if (block, par) != (key.0, key.1) => text.push_str("\n\n"),
            Some(prev) if prev != key => text.push('\n'),
            Some(_) => text.push(' '),
        }
        last_key = Some(key);
        text.push_str(word);

        conf_sum += conf as f64;
        words.push(WordBox {
            text: word.to_string(),
            confidence: (conf / 100.0).clamp(0.0, 1.0),
            x: num(6)?,
            y: num(7)?,
            width: num(8)?,
            height: num(9)?,
        });
    }

    let confidence = if words.is_empty() {
        0.0
    } else {
        ((conf_sum / words.len() as f64) / 100.0).clamp(0.0, 1.0) as f32
    };

    Ok(Recognition {
        text,
        confidence,
        words,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn tsv(rows: &[&str]) -> String {
        std::iter::once(HEADER)
            .chain(rows.iter().copied())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn words_lines_and_paragraphs() {
        let input = tsv(&[
            "1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t",
            "5\t1\t1\t1\t1\t1\t10\t10\t40\t12\t90\tHello",
            "5\t1\t1\t1\t1\t2\t60\t10\t50\t12\t80\tworld",
            "5\t1\t1\t1\t2\t1\t10\t30\t40\t12\t70\tsecond",
            "5\t1\t2\t1\t1\t1\t10\t80\t40\t12\t60\tnext",
        ]);
        let r = parse_tsv(&input).unwrap();
        assert_eq!(r.text, "Hello world\nsecond\n\nnext");
        assert_eq!(r.words.len(), 4);
        assert!((r.confidence - 0.75).abs() < 1e-6);
        assert_eq!(
            r.words[1],
            WordBox {
                text: "world".into(),
                confidence: 0.8,
                x: 60,
                y: 10,
                width: 50,
                height: 12
            }
        );
    }

    #[test]
    fn layout_rows_and_blank_words_are_skipped() {
        let input = tsv(&[
            "4\t1\t1\t1\t1\t0\t10\t10\t100\t12\t-1\t",
            "5\t1\t1\t1\t1\t1\t10\t10\t40\t12\t-1\t ",
            "5\t1\t1\t1\t1\t2\t10\t10\t40\t12\t95.5\tok",
        ]);
        let r = parse_tsv(&input).unwrap();
        assert_eq!(r.text, "ok");
        assert!((r.confidence - 0.955).abs() < 1e-6);
    }

    #[test]
    fn empty_page_has_zero_confidence() {
        let r = parse_tsv(HEADER).unwrap();
        assert!(r.text.is_empty());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let err = parse_tsv(&tsv(&["5\t1\t1"])).unwrap_err();
        assert!(matches!(err, RecognizeError::InvalidOutput(_)));

        let err = parse_tsv(&tsv(&["5\t1\t1\t1\t1\t1\tx\t10\t40\t12\t90\tword"])).unwrap_err();
        assert!(err.to_string().contains("column 7"));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = TesseractRecognizer::new("/nonexistent/tesseract", 3);
        assert!(!engine.is_available().await);

        let page = PreparedPage {
            index: 0,
            image: image::DynamicImage::ImageLuma8(image::GrayImage::new(2, 2)),
            skew_degrees: None,
        };
        let err = engine.recognize(&page, &["eng".into()]).await.unwrap_err();
        assert!(matches!(err, RecognizeError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_binary_receives_languages_and_returns_tsv() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tesseract");
        let args_file = dir.path().join("args.txt");
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
cat > /dev/null
echo "$@" > "{}"
printf 'level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n'
printf '5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t90\tHallo\n'
printf '5\t1\t1\t1\t1\t2\t70\t10\t50\t20\t70\tWelt\n'
"#,
                args_file.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = TesseractRecognizer::new(&script, 6);
        let page = PreparedPage {
            index: 0,
            image: image::DynamicImage::ImageLuma8(image::GrayImage::new(8, 8)),
            skew_degrees: None,
        };
        let r = engine
            .recognize(&page, &["eng".into(), "deu".into()])
            .await
            .unwrap();
        assert_eq!(r.text, "Hallo Welt");
        assert!((r.confidence - 0.8).abs() < 1e-6);

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), "stdin stdout -l eng+deu --psm 6 tsv");
    }
}
