//! Error types for the docparse library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocParseError`] — **Fatal to the request**: the source cannot be read
//!   or rasterised, a pipeline stage raised, or the model manager was asked
//!   for a role/variant it does not know. Returned as `Err(DocParseError)`
//!   from [`crate::pipeline::Pipeline::process`] and the `parse*` entry points.
//!
//! * [`PageError`] — **Non-fatal**: one page could not be extracted or
//!   formatted, but every other page is fine. Stored on the failed
//!   [`crate::context::Page`] next to its `failed` status so callers can retry
//!   just that page instead of losing the whole document.
//!
//! Stage failures are wrapped in [`DocParseError::Stage`], so the caller
//! always learns *which* stage aborted the run.

use std::path::PathBuf;
use thiserror::Error;

/// All request-fatal errors returned by the docparse library.
#[derive(Debug, Error)]
pub enum DocParseError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Source file was not found at the given path.
    #[error("Source file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file is neither a PDF, a raster image, nor a spreadsheet.
    #[error("Unsupported source '{path}': {detail}")]
    UnsupportedSource { path: PathBuf, detail: String },

    // ── Source errors ─────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("Source '{path}' is corrupt: {detail}")]
    CorruptSource { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// No pdfium shared library could be loaded.
    #[error("pdfium library not available: {0}\nSet PDFIUM_LIB_PATH to an existing libpdfium.")]
    PdfiumUnavailable(String),

    /// The whole source could not be rasterised into pages.
    #[error("Rasterisation failed for '{path}': {detail}")]
    RasterisationFailed { path: PathBuf, detail: String },

    /// The OCR engine could not produce a searchable copy of the source.
    #[error("OCR failed for '{path}': {detail}")]
    OcrFailed { path: PathBuf, detail: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// A stage ran on a context that lacks the data it needs.
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// A pipeline stage raised; the remaining stages were skipped and the
    /// partially-built context was discarded.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<DocParseError>,
    },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The model manager does not know this role.
    #[error("Unknown model role '{0}' (expected figure_interpreter or page_formatter)")]
    UnknownModelRole(String),

    /// The variant table has no entry for this `(role, variant)` pair.
    #[error("Unknown variant '{variant}' for model role '{role}'")]
    UnknownModelVariant { role: String, variant: String },

    /// Constructing a model variant failed; the role's slot stays empty.
    #[error("Failed to construct '{variant}' for model role '{role}': {detail}")]
    ModelConstructionFailed {
        role: String,
        variant: String,
        detail: String,
    },

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not read or write a working file (page raster, figure crop).
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create or write an export file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (e.g. a blocking task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocParseError {
    /// Name of the stage that aborted the pipeline, if this is a stage error.
    pub fn stage(&self) -> Option<&str> {
        match self {
            DocParseError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// True for role/variant lookup failures, which are caller errors.
    pub fn is_config_error(&self) -> bool {
        match self {
            DocParseError::UnknownModelRole(_)
            | DocParseError::UnknownModelVariant { .. }
            | DocParseError::InvalidConfig(_) => true,
            DocParseError::Stage { source, .. } => source.is_config_error(),
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DocParseError::Io {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored on [`crate::context::Page`] when the page is marked failed.
/// The pipeline keeps processing the other pages.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// The structural extractor failed on this page.
    #[error("Page {page}: structural extraction failed: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    /// The page formatter failed after retries.
    #[error("Page {page}: formatter failed after {retries} retries: {detail}")]
    FormatterFailed {
        page: usize,
        retries: u32,
        detail: String,
    },

    /// The page formatter hit its token budget; output was discarded.
    #[error("Page {page}: formatter output truncated at {max_new_tokens} tokens")]
    FormatterTruncated { page: usize, max_new_tokens: usize },
}
