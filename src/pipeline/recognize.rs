//! Recognition: the [`Recognizer`] seam and the per-page timeout policy.
//!
//! A recognizer turns one [`PreparedPage`] into text. Engines only implement
//! a single attempt; deadlines and the retry live in [`recognize_page`], which
//! drives a small state machine:
//!
//! ```text
//! pending ──▶ recognizing ──timeout──▶ retrying ──▶ done | failed
//!                  │
//!                  ├──ok──▶ done
//!                  └──error──▶ failed
//! ```
//!
//! Every transition moves strictly forward, so a page is attempted at most
//! twice: once with the page deadline and, only after a timeout, once more
//! with the shorter retry deadline. Engine errors are not retried; running
//! the same bitmap through the same engine fails the same way.

use crate::config::OcrConfig;
use crate::error::{PageError, RecognizeError};
use crate::output::WordBox;
use crate::pipeline::preprocess::PreparedPage;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest number of language hints combined for one document.
pub const MAX_LANGUAGES: usize = 8;

/// Longest accepted language code.
pub const MAX_LANGUAGE_LEN: usize = 32;

/// Text recognised on one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Page confidence in [0, 1].
    pub confidence: f32,
    /// Word boxes in preprocessed-image pixels; empty if the engine has none.
    pub words: Vec<WordBox>,
}

/// An OCR engine.
///
/// Implementations must be cheap to share: one instance serves every page of
/// every document of an [`crate::engine::OcrEngine`].
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Short engine name for logs and `/health`.
    fn name(&self) -> &str;

    /// Whether the engine can run at all (binary installed, provider configured).
    async fn is_available(&self) -> bool;

    /// Run one recognition attempt. No deadline is applied here.
    async fn recognize(
        &self,
        page: &PreparedPage,
        languages: &[String],
    ) -> Result<Recognition, RecognizeError>;
}

// ── Language hints ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LanguageError {
    #[error("at least one language is required")]
    Empty,
    #[error("at most {max} languages may be combined, got {count}")]
    TooMany { count: usize, max: usize },
    #[error("invalid language code '{0}': expected 1-32 characters of [A-Za-z0-9_]")]
    Invalid(String),
}

/// Check language hints before they reach an engine command line.
pub fn validate_languages(languages: &[String]) -> Result<(), LanguageError> {
    if languages.is_empty() {
        return Err(LanguageError::Empty);
    }
    if languages.len() > MAX_LANGUAGES {
        return Err(LanguageError::TooMany {
            count: languages.len(),
            max: MAX_LANGUAGES,
        });
    }
    for lang in languages {
        let valid = !lang.is_empty()
            && lang.len() <= MAX_LANGUAGE_LEN
            && lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(LanguageError::Invalid(lang.clone()));
        }
    }
    Ok(())
}

/// Split `eng,deu` or `eng+deu` into hints.
pub fn parse_languages(s: &str) -> Vec<String> {
    s.split([',', '+'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Timeout policy ───────────────────────────────────────────────────────

/// Where a page is in the recognition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    /// First attempt in flight.
    Recognizing,
    /// Second (and last) attempt in flight, after a timeout.
    Retrying,
    Done,
    Failed,
}

/// What happened to the attempt in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Start,
    Succeeded,
    TimedOut,
    Errored,
}

impl AttemptState {
    /// Apply an event. Events that do not apply to the current state leave it unchanged.
    pub fn on(self, event: AttemptEvent) -> Self {
        use AttemptEvent::*;
        use AttemptState::*;
        match (self, event) {
            (Pending, Start) => Recognizing,
            (Recognizing, TimedOut) => Retrying,
            (Recognizing | Retrying, Succeeded) => Done,
            (Recognizing, Errored) | (Retrying, TimedOut | Errored) => Failed,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Done | AttemptState::Failed)
    }
}

/// Deadlines for the two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub page_timeout: Duration,
    /// At most half of `page_timeout`; the constructor clamps it.
    pub retry_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(page_timeout: Duration, retry_timeout: Duration) -> Self {
        Self {
            page_timeout,
            retry_timeout: retry_timeout.min(page_timeout / 2),
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        Self::new(config.page_timeout(), config.retry_timeout())
    }

    /// Deadline of the attempt that runs in `state`, if one runs.
    pub fn deadline(&self, state: AttemptState) -> Option<Duration> {
        match state {
            AttemptState::Recognizing => Some(self.page_timeout),
            AttemptState::Retrying => Some(self.retry_timeout),
            _ => None,
        }
    }
}

/// Recognise one page under `policy`.
///
/// Returns the recognition and the number of attempts made (1 or 2).
pub async fn recognize_page(
    recognizer: &dyn Recognizer,
    page: &PreparedPage,
    languages: &[String],
    policy: &RetryPolicy,
) -> Result<(Recognition, u8), PageError> {
    let mut state = AttemptState::Pending.on(AttemptEvent::Start);
    let mut attempts = 0u8;
    let mut last_deadline = policy.page_timeout;
    let mut outcome: Option<Result<Recognition, RecognizeError>> = None;

    while let Some(deadline) = policy.deadline(state) {
        attempts += 1;
        last_deadline = deadline;

        let event = match tokio::time::timeout(deadline, recognizer.recognize(page, languages)).await
        {
            Ok(Ok(recognition)) => {
                outcome = Some(Ok(recognition));
                AttemptEvent::Succeeded
            }
            Ok(Err(e)) => {
                outcome = Some(Err(e));
                AttemptEvent::Errored
            }
            Err(_) => {
                warn!(
                    "Page {}: {} timed out after {}ms (attempt {})",
                    page.index + 1,
                    recognizer.name(),
                    deadline.as_millis(),
                    attempts
                );
                AttemptEvent::TimedOut
            }
        };
        state = state.on(event);
    }

    match (state, outcome) {
        (AttemptState::Done, Some(Ok(mut recognition))) => {
            recognition.confidence = clamp_confidence(recognition.confidence);
            debug!(
                "Page {}: {} chars, confidence {:.2}, {} attempt(s)",
                page.index + 1,
                recognition.text.len(),
                recognition.confidence,
                attempts
            );
            Ok((recognition, attempts))
        }
        (_, Some(Err(e))) => Err(PageError::RecognitionFailed {
            page: page.index,
            detail: e.to_string(),
        }),
        _ => Err(PageError::RecognitionTimeout {
            page: page.index,
            attempts,
            last_timeout_ms: last_deadline.as_millis() as u64,
        }),
    }
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_finite() {
        c.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn page(index: usize) -> PreparedPage {
        PreparedPage {
            index,
            image: DynamicImage::ImageLuma8(GrayImage::new(4, 4)),
            skew_degrees: None,
        }
    }

    fn langs() -> Vec<String> {
        vec!["eng".to_string()]
    }

    /// Sleeps `delays[n]` on call n, then answers.
    struct Scripted {
        delays: Vec<Duration>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Scripted {
        fn new(delays: &[u64]) -> Self {
            Self {
                delays: delays.iter().map(|ms| Duration::from_millis(*ms)).collect(),
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(&[0])
            }
        }
    }

    #[async_trait]
    impl Recognizer for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn recognize(
            &self,
            _page: &PreparedPage,
            _languages: &[String],
        ) -> Result<Recognition, RecognizeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delays.get(n).copied().unwrap_or_default();
            tokio::time::sleep(delay).await;
            if self.fail {
                return Err(RecognizeError::Failed("engine exploded".into()));
            }
            Ok(Recognition {
                text: format!("call {n}"),
                confidence: 1.7,
                words: Vec::new(),
            })
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(80), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn fast_engine_succeeds_first_time() {
        let engine = Scripted::new(&[0]);
        let (r, attempts) = recognize_page(&engine, &page(0), &langs(), &policy())
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(r.text, "call 0");
        assert_eq!(r.confidence, 1.0, "confidence is clamped");
    }

    #[tokio::test]
    async fn timeout_then_success_uses_the_retry() {
        let engine = Scripted::new(&[1_000, 0]);
        let (r, attempts) = recognize_page(&engine, &page(2), &langs(), &policy())
            .await
            .unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(r.text, "call 1");
    }

    #[tokio::test]
    async fn two_timeouts_fail_the_page() {
        let engine = Scripted::new(&[1_000, 1_000, 0]);
        let err = recognize_page(&engine, &page(3), &langs(), &policy())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PageError::RecognitionTimeout {
                page: 3,
                attempts: 2,
                last_timeout_ms: 40
            }
        );
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2, "never a third attempt");
    }

    #[tokio::test]
    async fn retry_deadline_is_shorter() {
        // 60ms beats the 80ms page deadline but not the 40ms retry deadline.
        let engine = Scripted::new(&[1_000, 60]);
        let err = recognize_page(&engine, &page(0), &langs(), &policy())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "recognition_timeout");
    }

    #[tokio::test]
    async fn engine_errors_are_not_retried() {
        let engine = Scripted::failing();
        let err = recognize_page(&engine, &page(1), &langs(), &policy())
            .await
            .unwrap_err();
        match err {
            PageError::RecognitionFailed { page, detail } => {
                assert_eq!(page, 1);
                assert!(detail.contains("exploded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_machine_is_bounded() {
        use AttemptEvent::*;
        use AttemptState::*;
        assert_eq!(Pending.on(Start), Recognizing);
        assert_eq!(Recognizing.on(TimedOut), Retrying);
        assert_eq!(Retrying.on(TimedOut), Failed);
        assert_eq!(Recognizing.on(Succeeded), Done);
        assert_eq!(Retrying.on(Succeeded), Done);
        assert_eq!(Recognizing.on(Errored), Failed);
        assert_eq!(Done.on(Start), Done);
        assert_eq!(Failed.on(TimedOut), Failed);
        assert_eq!(Pending.on(Succeeded), Pending);
        assert!(Done.is_terminal() && Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn retry_deadline_is_clamped_below_the_page_deadline() {
        let p = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(p.retry_timeout, Duration::from_millis(2_500));
        assert_eq!(p.deadline(AttemptState::Pending), None);
        assert_eq!(
            p.deadline(AttemptState::Retrying),
            Some(Duration::from_millis(2_500))
        );

        let p = RetryPolicy::new(Duration::from_secs(20), Duration::from_secs(20));
        assert!(p.retry_timeout < p.page_timeout);
    }

    #[test]
    fn language_validation() {
        assert!(validate_languages(&["eng".into(), "chi_sim".into()]).is_ok());
        assert_eq!(validate_languages(&[]), Err(LanguageError::Empty));
        assert_eq!(
            validate_languages(&["eng; rm -rf".into()]),
            Err(LanguageError::Invalid("eng; rm -rf".into()))
        );
        assert!(validate_languages(&["-l".into()]).is_err());
        assert!(validate_languages(&["a".repeat(33)]).is_err());
        let many: Vec<String> = (0..9).map(|i| format!("l{i}")).collect();
        assert!(matches!(
            validate_languages(&many),
            Err(LanguageError::TooMany { count: 9, .. })
        ));
    }

    #[test]
    fn parse_language_lists() {
        assert_eq!(parse_languages("eng, deu"), vec!["eng", "deu"]);
        assert_eq!(parse_languages("eng+fra"), vec!["eng", "fra"]);
        assert!(parse_languages(" , ").is_empty());
    }

    #[test]
    fn non_finite_confidence_is_zero() {
        assert_eq!(clamp_confidence(f32::NAN), 0.0);
        assert_eq!(clamp_confidence(-0.5), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }
}
