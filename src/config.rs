//! Configuration for document parsing.
//!
//! Every knob lives in [`ParserConfig`], built via its
//! [`ParserConfigBuilder`]. One struct means configs can be shared across
//! tasks, logged with `{:?}`, and compared between runs.
//!
//! # Design choice: builder over constructor
//! Callers set only what they care about; setters clamp to sane ranges and
//! [`ParserConfigBuilder::build`] rejects what cannot be clamped.

use crate::error::DocParseError;
use crate::models::VariantTable;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one or more parse requests.
///
/// # Example
/// ```rust
/// use docparse::ParserConfig;
///
/// let config = ParserConfig::builder()
///     .dpi(200)
///     .concurrency(2)
///     .formatter_variant("quantized")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ParserConfig {
    /// Rendering DPI for PDF rasterisation. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Longest side of a rendered page, in pixels. Default: 1440.
    ///
    /// Caps memory on oversized pages (posters, plans) independent of DPI.
    pub max_rendered_pixels: u32,

    /// Longest side of a cropped figure before it is previewed or sent to the
    /// figure interpreter. Default: 560.
    pub figure_max_pixels: u32,

    /// JPEG quality of the embedded figure preview (1–100). Default: 20.
    ///
    /// The preview is a thumbnail for JSON consumers, not an archive copy.
    pub preview_jpeg_quality: u8,

    /// Longest side of the page image sent to the page formatter. Default: 1080.
    pub formatter_image_pixels: u32,

    /// Per-stage fan-out over pages. Default: 4.
    ///
    /// Model calls into one role are still serialised by the model manager;
    /// this bounds image loading, extraction and prompt preparation.
    pub concurrency: usize,

    /// Retry attempts on a failed model call. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Variant of the figure interpreter to keep resident. Default: `"base"`.
    pub figure_variant: String,

    /// Variant of the page formatter to keep resident. Default: `"base"`.
    pub formatter_variant: String,

    /// `(role, variant)` construction table. Default: [`VariantTable::builtin`].
    pub variants: VariantTable,

    /// LLM provider name for the VLM adapters (`openai`, `ollama`, ...).
    /// If None along with `provider`, auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Root under which each request gets its scratch directory.
    /// Default: `<system temp>/docparse`.
    pub work_dir: PathBuf,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Text elements shorter than this (after trimming) are pruned by the
    /// text-format stage. Default: 2.
    pub min_text_chars: usize,

    /// Separator between pages in the exported markdown. Default: horizontal rule.
    pub page_separator: PageSeparator,

    /// Optional per-stage / per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 1440,
            figure_max_pixels: 560,
            preview_jpeg_quality: 20,
            formatter_image_pixels: 1080,
            concurrency: 4,
            max_retries: 2,
            retry_backoff_ms: 500,
            figure_variant: "base".to_string(),
            formatter_variant: "base".to_string(),
            variants: VariantTable::builtin(),
            provider_name: None,
            provider: None,
            work_dir: std::env::temp_dir().join("docparse"),
            password: None,
            min_text_chars: 2,
            page_separator: PageSeparator::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ParserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("figure_max_pixels", &self.figure_max_pixels)
            .field("preview_jpeg_quality", &self.preview_jpeg_quality)
            .field("formatter_image_pixels", &self.formatter_image_pixels)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("figure_variant", &self.figure_variant)
            .field("formatter_variant", &self.formatter_variant)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("work_dir", &self.work_dir)
            .field("min_text_chars", &self.min_text_chars)
            .field("page_separator", &self.page_separator)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl ParserConfig {
    /// Create a new builder for `ParserConfig`.
    pub fn builder() -> ParserConfigBuilder {
        ParserConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ParserConfig`].
#[derive(Debug)]
pub struct ParserConfigBuilder {
    config: ParserConfig,
}

impl ParserConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn figure_max_pixels(mut self, px: u32) -> Self {
        self.config.figure_max_pixels = px.max(16);
        self
    }

    pub fn preview_jpeg_quality(mut self, q: u8) -> Self {
        self.config.preview_jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn formatter_image_pixels(mut self, px: u32) -> Self {
        self.config.formatter_image_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    /// Retries per model call, at most 10.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn figure_variant(mut self, v: impl Into<String>) -> Self {
        self.config.figure_variant = v.into();
        self
    }

    pub fn formatter_variant(mut self, v: impl Into<String>) -> Self {
        self.config.formatter_variant = v.into();
        self
    }

    pub fn variants(mut self, table: VariantTable) -> Self {
        self.config.variants = table;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn min_text_chars(mut self, n: usize) -> Self {
        self.config.min_text_chars = n;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// Variant names are checked against the table here, so a typo fails
    /// before any document is touched.
    pub fn build(self) -> Result<ParserConfig, DocParseError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(DocParseError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(DocParseError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.work_dir.as_os_str().is_empty() {
            return Err(DocParseError::InvalidConfig("work_dir must not be empty".into()));
        }
        c.variants
            .resolve(crate::models::ModelRole::FigureInterpreter, &c.figure_variant)?;
        c.variants
            .resolve(crate::models::ModelRole::PageFormatter, &c.formatter_variant)?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How to separate pages in the exported markdown.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; pages joined with "\n\n".
    None,
    /// Horizontal rule: "\n\n---\n\n" (default)
    #[default]
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before page `page_num` (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ParserConfig::default();
        assert_eq!(c.figure_max_pixels, 560);
        assert_eq!(c.preview_jpeg_quality, 20);
        assert_eq!(c.formatter_image_pixels, 1080);
        assert_eq!(c.page_separator, PageSeparator::HorizontalRule);
        assert_eq!(c.figure_variant, "base");
    }

    #[test]
    fn setters_clamp() {
        let c = ParserConfig::builder()
            .dpi(10)
            .concurrency(0)
            .preview_jpeg_quality(0)
            .max_retries(u32::MAX)
            .build()
            .unwrap();
        assert_eq!(c.max_retries, 10);
        assert_eq!(c.dpi, 72);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.preview_jpeg_quality, 1);
    }

    #[test]
    fn unknown_variant_fails_build() {
        let err = ParserConfig::builder()
            .formatter_variant("unsloth")
            .build()
            .unwrap_err();
        assert!(matches!(err, DocParseError::UnknownModelVariant { .. }));
    }

    #[test]
    fn separator_rendering() {
        assert_eq!(PageSeparator::HorizontalRule.render(2), "\n\n---\n\n");
        assert_eq!(PageSeparator::Comment.render(3), "\n\n<!-- page 3 -->\n\n");
        assert_eq!(PageSeparator::None.render(1), "\n\n");
    }

    #[test]
    fn debug_hides_trait_objects() {
        let dbg = format!("{:?}", ParserConfig::default());
        assert!(dbg.contains("ParserConfig"));
        assert!(dbg.contains("provider: None"));
    }
}
