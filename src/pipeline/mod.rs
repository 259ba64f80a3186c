//! The step pipeline and its stages.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. Each stage takes the
//! [`DocumentContext`] by value and returns its replacement; stages run
//! strictly one after another, while a stage may fan its own per-page work
//! out concurrently.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ OCR ──▶ Split ──▶ Extract Elements ──▶ Extract Images ──▶ Format Extracted Text ──▶ Format Markdown
//! (kind)  (ocr.rs) (render)  (layout+reconcile)    (figure)          (postprocess::clean_text)  (postprocess::polish)
//! ```
//!
//! 1. [`input`]       — validate and classify the source
//! 2. [`ocr`]         — searchable copy of scanned PDFs (idempotent)
//! 3. [`render`]      — rasterise pages; pdfium runs in `spawn_blocking`
//! 4. [`layout`]      — raw structural elements per page
//! 5. [`reconcile`]   — dense elements, fused tables, queued figures
//! 6. [`figure`]      — decode figure-interpreter output
//! 7. [`postprocess`] — OCR text cleanup, envelope stripping, markdown polish
//!
//! A failing stage aborts the run; the error names the stage and the
//! partially processed context is dropped.

pub mod encode;
pub mod figure;
pub mod input;
pub mod layout;
pub mod ocr;
pub mod postprocess;
pub mod reconcile;
pub mod render;
pub mod steps;
pub mod table;

use crate::context::DocumentContext;
use crate::error::DocParseError;
use crate::pipeline::input::SourceKind;
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// One transformation over the whole document context.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in timings, progress events and errors.
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: DocumentContext) -> Result<DocumentContext, DocParseError>;
}

/// The four stage lists assembled by [`crate::DocParserService::pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    OcrOnly,
    SplitOnly,
    /// Everything except final markdown formatting.
    ExtractOnly,
    Full,
}

impl PipelineKind {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::OcrOnly => "ocr_only",
            PipelineKind::SplitOnly => "split_only",
            PipelineKind::ExtractOnly => "extract_only",
            PipelineKind::Full => "full",
        }
    }

    /// Caller-side selection: spreadsheets have no page image worth
    /// formatting, so they stop after text formatting.
    pub fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Spreadsheet => PipelineKind::ExtractOnly,
            SourceKind::Pdf | SourceKind::Image => PipelineKind::Full,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineKind {
    type Err = DocParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ocr" | "ocr_only" => Ok(PipelineKind::OcrOnly),
            "split" | "split_only" => Ok(PipelineKind::SplitOnly),
            "extract" | "extract_only" => Ok(PipelineKind::ExtractOnly),
            "full" => Ok(PipelineKind::Full),
            other => Err(DocParseError::InvalidConfig(format!(
                "unknown pipeline '{}' (expected ocr, split, extract or full)",
                other
            ))),
        }
    }
}

pub struct Pipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    progress: Option<ProgressCallback>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            progress: None,
        }
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order.
    ///
    /// Each stage's wall-clock time lands in `stage_timings`; their sum is
    /// added to `processing_time_ms` once the last stage has finished.
    pub async fn process(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        info!(
            "Pipeline '{}': {} stages on {}",
            self.name,
            self.stages.len(),
            ctx.source.display()
        );
        if let Some(cb) = &self.progress {
            cb.on_pipeline_start(&self.name, self.stages.len());
        }

        let mut total_ms = 0u64;
        for stage in &self.stages {
            let name = stage.name();
            if let Some(cb) = &self.progress {
                cb.on_stage_start(name);
            }
            let start = Instant::now();
            ctx = stage
                .run(ctx)
                .await
                .map_err(|e| DocParseError::Stage {
                    stage: name.to_string(),
                    source: Box::new(e),
                })?;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            ctx.stage_timings.insert(name.to_string(), elapsed_ms);
            total_ms += elapsed_ms;
            info!("Stage '{}' done in {}ms", name, elapsed_ms);
            if let Some(cb) = &self.progress {
                cb.on_stage_complete(name, elapsed_ms);
            }
        }

        ctx.processing_time_ms += total_ms;
        info!(
            "Pipeline '{}' complete: {} pages, {} failed, {}ms",
            self.name,
            ctx.pages.len(),
            ctx.failed_pages(),
            total_ms
        );
        if let Some(cb) = &self.progress {
            cb.on_pipeline_complete(&self.name, total_ms);
        }
        Ok(ctx)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Page;
    use crate::progress::PipelineProgressCallback;
    use std::sync::Mutex;

    struct AddPage;

    #[async_trait]
    impl Stage for AddPage {
        fn name(&self) -> &'static str {
            "Add Page"
        }

        async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
            let idx = ctx.pages.len();
            ctx.pages.push(Page::new(idx, format!("p{idx}.png")));
            Ok(ctx)
        }
    }

    struct Boom;

    #[async_trait]
    impl Stage for Boom {
        fn name(&self) -> &'static str {
            "Boom"
        }

        async fn run(&self, _ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
            Err(DocParseError::MissingPrerequisite("nothing to do".into()))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PipelineProgressCallback for Recorder {
        fn on_stage_start(&self, stage: &str) {
            self.0.lock().unwrap().push(format!("start {stage}"));
        }

        fn on_stage_complete(&self, stage: &str, _elapsed_ms: u64) {
            self.0.lock().unwrap().push(format!("done {stage}"));
        }
    }

    #[tokio::test]
    async fn stages_run_in_order_and_are_timed() {
        let rec = Arc::new(Recorder::default());
        let pipeline = Pipeline::new("test")
            .with_stage(Arc::new(AddPage))
            .with_stage(Arc::new(AddPage))
            .with_progress(Some(rec.clone()));

        let ctx = pipeline
            .process(DocumentContext::new("in.pdf", "/tmp/w"))
            .await
            .unwrap();
        assert_eq!(ctx.pages.len(), 2);
        assert_eq!(ctx.pages[1].index, 1);
        assert!(ctx.stage_timings.contains_key("Add Page"));
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec!["start Add Page", "done Add Page", "start Add Page", "done Add Page"]
        );
    }

    #[tokio::test]
    async fn failing_stage_is_named_and_stops_the_run() {
        let rec = Arc::new(Recorder::default());
        let pipeline = Pipeline::new("test")
            .with_stage(Arc::new(Boom))
            .with_stage(Arc::new(AddPage))
            .with_progress(Some(rec.clone()));

        let err = pipeline
            .process(DocumentContext::new("in.pdf", "/tmp/w"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some("Boom"));
        assert!(err.to_string().contains("Stage 'Boom' failed"));
        assert_eq!(*rec.0.lock().unwrap(), vec!["start Boom"]);
    }

    #[test]
    fn pipeline_kind_selection_and_parsing() {
        assert_eq!(PipelineKind::for_source(SourceKind::Spreadsheet), PipelineKind::ExtractOnly);
        assert_eq!(PipelineKind::for_source(SourceKind::Image), PipelineKind::Full);
        assert_eq!("OCR".parse::<PipelineKind>().unwrap(), PipelineKind::OcrOnly);
        assert_eq!("extract_only".parse::<PipelineKind>().unwrap(), PipelineKind::ExtractOnly);
        assert!("everything".parse::<PipelineKind>().is_err());
    }
}
