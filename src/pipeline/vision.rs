//! Vision engine: transcribe page images with a multimodal LLM through
//! `edgequake-llm`.
//!
//! Useful where tesseract is weak (handwriting, dense mixed scripts). Models
//! report no confidence, so every successful page gets
//! [`VISION_CONFIDENCE`], and no word boxes.
//!
//! Availability is a one-token completion against the provider. The answer
//! is cached for [`AVAILABILITY_TTL`] so `/health` polling does not turn into
//! provider traffic.

use crate::config::OcrConfig;
use crate::error::{OcrError, RecognizeError};
use crate::pipeline::encode::encode_image_data;
use crate::pipeline::preprocess::PreparedPage;
use crate::pipeline::recognize::{Recognition, Recognizer};
use crate::prompts::transcription_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Confidence reported for every page the model transcribed.
pub const VISION_CONFIDENCE: f32 = 0.75;

/// How long an availability answer is reused.
pub const AVAILABILITY_TTL: Duration = Duration::from_secs(60);

const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

pub struct VisionRecognizer {
    provider: Arc<dyn LLMProvider>,
    max_tokens: usize,
    /// Last availability answer and when it was taken.
    availability: Mutex<Option<(Instant, bool)>>,
}

impl VisionRecognizer {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            max_tokens: 4096,
            availability: Mutex::new(None),
        }
    }

    pub fn from_config(config: &OcrConfig) -> Result<Self, OcrError> {
        Ok(Self::new(resolve_provider(config)?))
    }

    fn lock_availability(&self) -> MutexGuard<'_, Option<(Instant, bool)>> {
        self.availability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached_availability(&self) -> Option<bool> {
        let cached = *self.lock_availability();
        cached
            .filter(|(at, _)| at.elapsed() < AVAILABILITY_TTL)
            .map(|(_, available)| available)
    }
}

/// Greedy decoding: a transcription has one right answer.
fn completion_options(max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(0.0),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl Recognizer for VisionRecognizer {
    fn name(&self) -> &str {
        "vision"
    }

    async fn is_available(&self) -> bool {
        if let Some(available) = self.cached_availability() {
            return available;
        }

        let ping_options = completion_options(1);
        let ping = self
            .provider
            .complete_with_options("ping", &ping_options);
        let available = match tokio::time::timeout(AVAILABILITY_TIMEOUT, ping).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Vision provider '{}' unavailable: {}", self.provider.name(), e);
                false
            }
            Err(_) => {
                warn!(
                    "Vision provider '{}' did not answer within {:?}",
                    self.provider.name(),
                    AVAILABILITY_TIMEOUT
                );
                false
            }
        };

        *self.lock_availability() = Some((Instant::now(), available));
        available
    }

    async fn recognize(
        &self,
        page: &PreparedPage,
        languages: &[String],
    ) -> Result<Recognition, RecognizeError> {
        let image = encode_image_data(&page.image)
            .map_err(|e| RecognizeError::Failed(format!("PNG encoding failed: {e}")))?;

        let messages = vec![
            ChatMessage::system(transcription_prompt(languages)),
            ChatMessage::user_with_images("", vec![image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&completion_options(self.max_tokens)))
            .await
            .map_err(|e| RecognizeError::Failed(format!("{}", e)))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens",
            page.index + 1,
            response.prompt_tokens,
            response.completion_tokens
        );

        let confidence = if response.content.trim().is_empty() {
            0.0
        } else {
            VISION_CONFIDENCE
        };
        Ok(Recognition {
            text: response.content,
            confidence,
            words: Vec::new(),
        })
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, OcrError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| OcrError::EngineUnavailable {
        engine: format!("vision ({name})"),
        hint: format!("{e}"),
    })
}

/// Pick the vision provider: explicit instance, then named provider, then
/// `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, then `OPENAI_API_KEY`,
/// then whatever the factory detects from the environment.
pub fn resolve_provider(config: &OcrConfig) -> Result<Arc<dyn LLMProvider>, OcrError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| OcrError::EngineUnavailable {
            engine: "vision".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment. \
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider. Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgequake_llm::{LLMResponse, LlmError, MockProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider whose every call fails, counting the calls.
    #[derive(Default)]
    struct Unreachable {
        calls: AtomicUsize,
    }

    impl Unreachable {
        fn fail(&self) -> edgequake_llm::Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::NetworkError("connection refused".into()))
        }
    }

    #[async_trait]
    impl LLMProvider for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        fn model(&self) -> &str {
            "none"
        }

        fn max_context_length(&self) -> usize {
            4096
        }

        async fn complete(&self, _prompt: &str) -> edgequake_llm::Result<LLMResponse> {
            self.fail()
        }

        async fn complete_with_options(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.fail()
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: Option<&CompletionOptions>,
        ) -> edgequake_llm::Result<LLMResponse> {
            self.fail()
        }
    }

    #[test]
    fn completion_options_are_greedy() {
        let options = completion_options(2048);
        assert_eq!(options.temperature, Some(0.0));
        assert_eq!(options.max_tokens, Some(2048));
    }

    #[tokio::test]
    async fn reachable_provider_is_available() {
        let recognizer = VisionRecognizer::new(Arc::new(MockProvider::new()));
        assert!(recognizer.is_available().await);
    }

    #[tokio::test]
    async fn unreachable_provider_is_unavailable_and_cached() {
        let provider = Arc::new(Unreachable::default());
        let recognizer = VisionRecognizer::new(provider.clone());

        assert!(!recognizer.is_available().await);
        assert!(!recognizer.is_available().await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1, "second answer is cached");
    }
}
