//! Vision-language-model adapters built on `edgequake-llm` providers.
//!
//! Both roles are served by a chat-completion VLM: the figure interpreter
//! sends the cropped figure with [`FIGURE_PROMPT`]; the page formatter sends
//! the page image with the cleaned page text appended to
//! [`crate::prompts::FORMATTER_PROMPT`].
//!
//! ## Retry Strategy
//!
//! Transient API failures are retried with exponential backoff
//! (`retry_backoff_ms * 2^(attempt-1)`). After the last attempt the adapter
//! returns [`ModelCallError`]; it never panics and never aborts the stage.
//!
//! ## Truncation
//!
//! A completion whose token count reaches the variant's `max_new_tokens`
//! (minus a small per-role margin) is returned as
//! [`Generation::truncated`], so the caller can discard it.

use super::manager::{ModelFactory, ModelHandle};
use super::registry::{ModelRole, VariantSpec};
use super::{FigureInterpreter, Generation, ModelCallError, PageFormatter};
use crate::config::ParserConfig;
use crate::error::DocParseError;
use crate::pipeline::encode;
use crate::prompts::{
    formatter_user_prompt, FIGURE_PROMPT, FIGURE_SYSTEM_PROMPT, FORMATTER_SYSTEM_PROMPT,
};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const FIGURE_TRUNCATION_MARGIN: usize = 1;
const FORMATTER_TRUNCATION_MARGIN: usize = 5;
const MAX_BACKOFF_MS: u64 = 60_000;

/// Exponential backoff before retry `attempt` (1-based), capped at one minute.
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .map_or(MAX_BACKOFF_MS, |factor| base.saturating_mul(factor))
        .min(MAX_BACKOFF_MS)
}

/// Where the factory gets its LLM provider from.
#[derive(Clone)]
pub enum ProviderSource {
    /// A caller-built provider, used as-is for every variant.
    Fixed(Arc<dyn LLMProvider>),
    /// A provider name (`openai`, `ollama`, ...) instantiated per variant model.
    Named(String),
    /// Detect from the environment.
    Auto,
}

impl std::fmt::Debug for ProviderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderSource::Fixed(_) => f.write_str("Fixed(<dyn LLMProvider>)"),
            ProviderSource::Named(n) => write!(f, "Named({n})"),
            ProviderSource::Auto => f.write_str("Auto"),
        }
    }
}

/// [`ModelFactory`] producing VLM-backed figure interpreters and formatters.
#[derive(Debug, Clone)]
pub struct VlmModelFactory {
    source: ProviderSource,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl VlmModelFactory {
    pub fn new(source: ProviderSource) -> Self {
        Self {
            source,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }

    /// Pre-built provider first, then a named provider, then auto-detection.
    pub fn from_config(config: &ParserConfig) -> Self {
        let source = if let Some(ref provider) = config.provider {
            ProviderSource::Fixed(Arc::clone(provider))
        } else if let Some(ref name) = config.provider_name {
            ProviderSource::Named(name.clone())
        } else {
            ProviderSource::Auto
        };
        Self::new(source).with_retries(config.max_retries, config.retry_backoff_ms)
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }

    fn provider_for(&self, model: &str) -> Result<Arc<dyn LLMProvider>, DocParseError> {
        match &self.source {
            ProviderSource::Fixed(p) => Ok(Arc::clone(p)),
            ProviderSource::Named(name) => create_provider(name, model),
            ProviderSource::Auto => {
                if let Ok(prov) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
                    if !prov.is_empty() {
                        return create_provider(&prov, model);
                    }
                }
                if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
                    return create_provider("openai", model);
                }
                let (llm, _embedding) =
                    ProviderFactory::from_env().map_err(|e| DocParseError::ProviderNotConfigured {
                        provider: "auto".to_string(),
                        hint: format!(
                            "No LLM provider could be auto-detected from environment.\n\
                             Set EDGEQUAKE_LLM_PROVIDER, OPENAI_API_KEY, or pass --provider.\n\
                             Error: {e}"
                        ),
                    })?;
                debug!("auto-detected provider; model '{model}' left to provider default");
                Ok(llm)
            }
        }
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, DocParseError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        DocParseError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// A fine-tuned deployment is addressed by its adapter name.
fn served_model(spec: &VariantSpec) -> &str {
    spec.adapter.as_deref().unwrap_or(&spec.model_id)
}

fn build_options(spec: &VariantSpec) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(spec.temperature),
        max_tokens: Some(spec.max_new_tokens),
        ..Default::default()
    }
}

fn reached_budget(completion_tokens: usize, max_new_tokens: usize, margin: usize) -> bool {
    max_new_tokens > 0 && completion_tokens >= max_new_tokens.saturating_sub(margin)
}

impl ModelFactory for VlmModelFactory {
    fn construct(
        &self,
        role: ModelRole,
        variant: &str,
        spec: &VariantSpec,
    ) -> Result<ModelHandle, DocParseError> {
        let model = served_model(spec);
        let provider = self.provider_for(model).map_err(|e| match e {
            DocParseError::ProviderNotConfigured { .. } => e,
            other => DocParseError::ModelConstructionFailed {
                role: role.to_string(),
                variant: variant.to_string(),
                detail: other.to_string(),
            },
        })?;

        let margin = match role {
            ModelRole::FigureInterpreter => FIGURE_TRUNCATION_MARGIN,
            ModelRole::PageFormatter => FORMATTER_TRUNCATION_MARGIN,
        };
        let client = VlmClient {
            provider,
            options: build_options(spec),
            max_new_tokens: spec.max_new_tokens,
            truncation_margin: margin,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
            label: role.as_str(),
        };

        Ok(match role {
            ModelRole::FigureInterpreter => {
                ModelHandle::FigureInterpreter(Arc::new(VlmFigureInterpreter { client }))
            }
            ModelRole::PageFormatter => {
                ModelHandle::PageFormatter(Arc::new(VlmPageFormatter { client }))
            }
        })
    }
}

struct VlmClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    max_new_tokens: usize,
    truncation_margin: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
    label: &'static str,
}

impl VlmClient {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<Generation, ModelCallError> {
        let start = Instant::now();
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_ms(self.retry_backoff_ms, attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    self.label, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&self.options)).await {
                Ok(response) => {
                    let completion = response.completion_tokens as usize;
                    debug!(
                        "{}: {} input tokens, {} output tokens, {:?}",
                        self.label,
                        response.prompt_tokens,
                        completion,
                        start.elapsed()
                    );
                    if reached_budget(completion, self.max_new_tokens, self.truncation_margin) {
                        warn!(
                            "{}: output reached the {}-token budget",
                            self.label, self.max_new_tokens
                        );
                        return Ok(Generation::truncated(response.content));
                    }
                    return Ok(Generation::success(response.content));
                }
                Err(e) => {
                    let err_msg = format!("{e}");
                    warn!("{}: attempt {} failed — {}", self.label, attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(ModelCallError::new(
            self.max_retries,
            last_err.unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }
}

struct VlmFigureInterpreter {
    client: VlmClient,
}

#[async_trait]
impl FigureInterpreter for VlmFigureInterpreter {
    async fn interpret(&self, figure: &DynamicImage) -> Result<Generation, ModelCallError> {
        let image = encode::encode_png(figure)
            .map_err(|e| ModelCallError::new(0, format!("figure encoding failed: {e}")))?;
        let messages = vec![
            ChatMessage::system(FIGURE_SYSTEM_PROMPT),
            ChatMessage::user_with_images(FIGURE_PROMPT, vec![image]),
        ];
        self.client.complete(messages).await
    }
}

struct VlmPageFormatter {
    client: VlmClient,
}

#[async_trait]
impl PageFormatter for VlmPageFormatter {
    fn max_new_tokens(&self) -> usize {
        self.client.max_new_tokens
    }

    async fn format(
        &self,
        plain_text: &str,
        page_image: &DynamicImage,
    ) -> Result<Generation, ModelCallError> {
        let image = encode::encode_png(page_image)
            .map_err(|e| ModelCallError::new(0, format!("page encoding failed: {e}")))?;
        let prompt = formatter_user_prompt(plain_text);
        let messages = vec![
            ChatMessage::system(FORMATTER_SYSTEM_PROMPT),
            ChatMessage::user_with_images(&prompt, vec![image]),
        ];
        self.client.complete(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_ms(500, 1), 500);
        assert_eq!(backoff_ms(500, 3), 2000);
        assert_eq!(backoff_ms(500, 40), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(500, 200), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(u64::MAX, 2), MAX_BACKOFF_MS);
    }

    #[test]
    fn options_follow_variant_spec() {
        let spec = VariantSpec::new("m", 1024).with_temperature(0.3);
        let opts = build_options(&spec);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[test]
    fn adapter_name_wins_over_base_model() {
        let base = VariantSpec::new("qwen", 8);
        assert_eq!(served_model(&base), "qwen");
        let ft = base.with_adapter("qwen-ft");
        assert_eq!(served_model(&ft), "qwen-ft");
    }

    #[test]
    fn budget_detection_uses_margin() {
        assert!(!reached_budget(4090, 4096, 5));
        assert!(reached_budget(4091, 4096, 5));
        assert!(reached_budget(1023, 1024, 1));
        assert!(!reached_budget(10, 0, 1));
    }

    #[test]
    fn factory_prefers_fixed_then_named_then_auto() {
        let cfg = ParserConfig::builder()
            .provider_name("ollama")
            .build()
            .unwrap();
        let f = VlmModelFactory::from_config(&cfg);
        assert!(matches!(f.source, ProviderSource::Named(ref n) if n == "ollama"));
        assert_eq!(f.max_retries, cfg.max_retries);

        let f = VlmModelFactory::from_config(&ParserConfig::default());
        assert!(matches!(f.source, ProviderSource::Auto));
    }
}
