//! # docparse
//!
//! Turn paginated documents (PDFs, scanned images, spreadsheets) into
//! structured markdown plus a machine-readable element list.
//!
//! ## Why this crate?
//!
//! No single extraction pass is reliable on real documents: layout engines
//! split tables across blocks, image detectors report the same figure twice,
//! vision models truncate or wrap their answers in fences. This crate is the
//! orchestration layer that threads one typed document model through a
//! staged pipeline, reconciles what the passes report, and keeps exactly one
//! heavyweight model resident per role.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source
//!  │
//!  ├─ OCR                    searchable copy of scanned PDFs (idempotent)
//!  ├─ Split                  rasterise pages (pdfium, spawn_blocking)
//!  ├─ Extract Elements       structural extraction + reconciliation
//!  ├─ Extract Images         figure interpreter → type / caption / data
//!  ├─ Format Extracted Text  prune, concatenate, OCR cleanup
//!  └─ Format Markdown        page formatter → envelope strip → polish
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docparse::{DocParserService, ParserConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from EDGEQUAKE_LLM_PROVIDER / OPENAI_API_KEY / ...
//!     let config = ParserConfig::builder().formatter_variant("quantized").build()?;
//!     let service = DocParserService::new(config);
//!     let paths = service.parse_to_dir("report.pdf", None, "out").await?;
//!     eprintln!("wrote {} and {}", paths.json.display(), paths.markdown.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docparse` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docparse = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PageSeparator, ParserConfig, ParserConfigBuilder};
pub use context::{
    BoundingBox, DocumentContext, Element, ElementKind, Figure, ImageMetadata, Page, Status,
};
pub use convert::{parse_sync, DocParserService};
pub use error::{DocParseError, PageError};
pub use models::{
    DeviceReclaimer, FigureInterpreter, Generation, ModelCallError, ModelFactory, ModelHandle,
    ModelLease, ModelManager, ModelRole, PageFormatter, VariantSpec, VariantTable,
};
pub use output::{export_to_dir, render_markdown, DocumentExport, ExportPaths};
pub use pipeline::input::{resolve_source, SourceKind};
pub use pipeline::layout::{FigureDetector, RawElement, StructuralExtractor};
pub use pipeline::ocr::OcrEngine;
pub use pipeline::render::Rasterizer;
pub use pipeline::{Pipeline, PipelineKind, Stage};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
