//! Request-level entry points.
//!
//! [`DocParserService`] owns everything that outlives one document: the
//! configuration, the [`ModelManager`] (so resident models are reused across
//! requests) and the external collaborators. Each `parse*` call
//!
//! 1. resolves and classifies the source,
//! 2. creates a per-request scratch directory under `config.work_dir`,
//! 3. assembles the requested [`Pipeline`] and runs it.
//!
//! Which pipeline to run is the caller's decision; [`PipelineKind::for_source`]
//! is the usual choice and is what [`DocParserService::parse_auto`] uses.

use crate::config::ParserConfig;
use crate::context::DocumentContext;
use crate::error::DocParseError;
use crate::models::{DeviceReclaimer, ModelFactory, ModelManager, TracingReclaimer, VlmModelFactory};
use crate::output::{export_to_dir, ExportPaths};
use crate::pipeline::input::{resolve_source, SourceKind};
use crate::pipeline::layout::{DefaultStructuralExtractor, FigureDetector, StructuralExtractor};
use crate::pipeline::ocr::{OcrEngine, OcrmypdfEngine};
use crate::pipeline::reconcile::ReconcileOptions;
use crate::pipeline::render::{DefaultRasterizer, Rasterizer};
use crate::pipeline::steps::{
    ExtractElementsStage, FormatTextStage, InterpretFiguresStage, MarkdownStage, OcrStage,
    SplitStage,
};
use crate::pipeline::{Pipeline, PipelineKind, Stage};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Long-lived parser: shares one model manager across requests.
///
/// # Example
/// ```rust,no_run
/// use docparse::{DocParserService, ParserConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let service = DocParserService::new(ParserConfig::default());
/// let ctx = service.parse_auto("report.pdf").await?;
/// for page in &ctx.pages {
///     println!("page {}: {:?}", page.index, page.status());
/// }
/// # Ok(())
/// # }
/// ```
pub struct DocParserService {
    config: ParserConfig,
    manager: Arc<ModelManager>,
    rasterizer: Arc<dyn Rasterizer>,
    extractor: Arc<dyn StructuralExtractor>,
    detector: Option<Arc<dyn FigureDetector>>,
    ocr: Arc<dyn OcrEngine>,
}

impl std::fmt::Debug for DocParserService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocParserService")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .field("detector", &self.detector.as_ref().map(|_| "<dyn FigureDetector>"))
            .finish()
    }
}

impl DocParserService {
    /// Service with the default adapters: pdfium rasteriser, native
    /// structural extractor, `ocrmypdf`, and VLM-backed models.
    pub fn new(config: ParserConfig) -> Self {
        let factory: Arc<dyn ModelFactory> = Arc::new(VlmModelFactory::from_config(&config));
        let manager = Arc::new(ModelManager::new(
            config.variants.clone(),
            factory,
            Arc::new(TracingReclaimer),
        ));
        Self {
            rasterizer: Arc::new(DefaultRasterizer::new(
                config.dpi,
                config.max_rendered_pixels,
                config.password.clone(),
            )),
            extractor: Arc::new(DefaultStructuralExtractor::new(config.password.clone())),
            detector: None,
            ocr: Arc::new(OcrmypdfEngine::default()),
            manager,
            config,
        }
    }

    /// Replace the model factory and device reclaimer. Drops any resident models.
    pub fn with_models(
        mut self,
        factory: Arc<dyn ModelFactory>,
        reclaimer: Arc<dyn DeviceReclaimer>,
    ) -> Self {
        self.manager = Arc::new(ModelManager::new(
            self.config.variants.clone(),
            factory,
            reclaimer,
        ));
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn StructuralExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn FigureDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_ocr_engine(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    /// Assemble one of the four pipeline configurations.
    pub fn pipeline(&self, kind: PipelineKind) -> Pipeline {
        let c = &self.config;
        let progress = c.progress_callback.clone();

        let ocr: Arc<dyn Stage> = Arc::new(OcrStage::new(Arc::clone(&self.ocr)));
        let split: Arc<dyn Stage> = Arc::new(SplitStage::new(Arc::clone(&self.rasterizer)));
        let extract: Arc<dyn Stage> = Arc::new(ExtractElementsStage::new(
            Arc::clone(&self.extractor),
            self.detector.clone(),
            ReconcileOptions {
                figure_max_pixels: c.figure_max_pixels,
                preview_jpeg_quality: c.preview_jpeg_quality,
            },
            c.concurrency,
            progress.clone(),
        ));
        let figures: Arc<dyn Stage> = Arc::new(InterpretFiguresStage::new(
            Arc::clone(&self.manager),
            c.figure_variant.clone(),
            c.concurrency,
        ));
        let text: Arc<dyn Stage> = Arc::new(FormatTextStage::new(c.min_text_chars, progress.clone()));

        let stages: Vec<Arc<dyn Stage>> = match kind {
            PipelineKind::OcrOnly => vec![ocr],
            PipelineKind::SplitOnly => vec![split],
            PipelineKind::ExtractOnly => vec![split, extract, figures, text],
            PipelineKind::Full => {
                let markdown: Arc<dyn Stage> = Arc::new(MarkdownStage::new(
                    Arc::clone(&self.manager),
                    c.formatter_variant.clone(),
                    c.formatter_image_pixels,
                    c.concurrency,
                    progress.clone(),
                ));
                vec![split, extract, figures, text, markdown]
            }
        };

        stages
            .into_iter()
            .fold(Pipeline::new(kind.name()), |p, s| p.with_stage(s))
            .with_progress(progress)
    }

    /// Parse `source` with an explicit pipeline configuration.
    pub async fn parse(
        &self,
        source: impl AsRef<Path>,
        kind: PipelineKind,
    ) -> Result<DocumentContext, DocParseError> {
        let resolved = resolve_source(source)?;
        let ctx = self.new_context(&resolved.path, resolved.kind)?;
        self.run(ctx, kind).await
    }

    /// Parse `source` with the pipeline [`PipelineKind::for_source`] picks.
    pub async fn parse_auto(&self, source: impl AsRef<Path>) -> Result<DocumentContext, DocParseError> {
        let resolved = resolve_source(source)?;
        let kind = PipelineKind::for_source(resolved.kind);
        let ctx = self.new_context(&resolved.path, resolved.kind)?;
        self.run(ctx, kind).await
    }

    /// Run a pipeline over an existing context, e.g. `full` after `ocr_only`.
    pub async fn run(
        &self,
        ctx: DocumentContext,
        kind: PipelineKind,
    ) -> Result<DocumentContext, DocParseError> {
        info!("Parsing {} ({:?}) with '{}'", ctx.source.display(), ctx.kind, kind);
        self.pipeline(kind).process(ctx).await
    }

    /// Parse in-memory bytes.
    ///
    /// `file_name` supplies the extension used for classification (spreadsheets
    /// are recognised by extension only). The bytes are written to a managed
    /// [`tempfile`] that is removed when this call returns.
    pub async fn parse_bytes(
        &self,
        bytes: &[u8],
        file_name: &str,
        kind: Option<PipelineKind>,
    ) -> Result<DocumentContext, DocParseError> {
        let suffix = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let mut tmp = tempfile::Builder::new()
            .prefix("docparse-upload-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| DocParseError::Internal(format!("tempfile: {e}")))?;
        tmp.write_all(bytes)
            .map_err(|e| DocParseError::Internal(format!("tempfile write: {e}")))?;

        let resolved = resolve_source(tmp.path())?;
        let kind = kind.unwrap_or_else(|| PipelineKind::for_source(resolved.kind));
        let ctx = self.new_context(&resolved.path, resolved.kind)?;
        // `tmp` lives until the pipeline has finished reading it.
        let result = self.run(ctx, kind).await;
        drop(tmp);
        result
    }

    /// Parse and export `<stem>.json` + `<stem>.md` into `out_dir`.
    pub async fn parse_to_dir(
        &self,
        source: impl AsRef<Path>,
        kind: Option<PipelineKind>,
        out_dir: impl AsRef<Path>,
    ) -> Result<ExportPaths, DocParseError> {
        let source = source.as_ref();
        let resolved = resolve_source(source)?;
        let kind = kind.unwrap_or_else(|| PipelineKind::for_source(resolved.kind));
        let ctx = self.new_context(&resolved.path, resolved.kind)?;
        let ctx = self.run(ctx, kind).await?;
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        export_to_dir(&ctx, kind.name(), &self.config.page_separator, out_dir, stem).await
    }

    fn new_context(&self, source: &Path, kind: SourceKind) -> Result<DocumentContext, DocParseError> {
        let root = &self.config.work_dir;
        std::fs::create_dir_all(root).map_err(|e| DocParseError::io(root, e))?;
        let work_dir = tempfile::Builder::new()
            .prefix("req-")
            .tempdir_in(root)
            .map_err(|e| DocParseError::io(root, e))?
            .keep();
        Ok(DocumentContext::new(source, work_dir).with_kind(kind))
    }
}

/// Synchronous wrapper around [`DocParserService::parse_auto`].
///
/// Creates a temporary tokio runtime internally.
pub fn parse_sync(
    source: impl AsRef<Path>,
    config: ParserConfig,
) -> Result<DocumentContext, DocParseError> {
    let service = DocParserService::new(config);
    tokio::runtime::Runtime::new()
        .map_err(|e| DocParseError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(service.parse_auto(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> DocParserService {
        DocParserService::new(ParserConfig::default())
    }

    #[test]
    fn pipeline_configurations() {
        let s = service();
        assert_eq!(s.pipeline(PipelineKind::OcrOnly).stage_names(), vec!["OCR"]);
        assert_eq!(s.pipeline(PipelineKind::SplitOnly).stage_names(), vec!["Split"]);
        assert_eq!(
            s.pipeline(PipelineKind::ExtractOnly).stage_names(),
            vec!["Split", "Extract Elements", "Extract Images", "Format Extracted Text"]
        );
        assert_eq!(
            s.pipeline(PipelineKind::Full).stage_names(),
            vec![
                "Split",
                "Extract Elements",
                "Extract Images",
                "Format Extracted Text",
                "Format Markdown"
            ]
        );
        assert_eq!(s.pipeline(PipelineKind::Full).name(), "full");
    }

    #[tokio::test]
    async fn missing_source_fails_before_any_stage() {
        let err = service()
            .parse_auto("/no/such/file.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, DocParseError::FileNotFound { .. }));
        assert_eq!(err.stage(), None);
    }

    #[tokio::test]
    async fn each_request_gets_its_own_work_dir() {
        let root = tempfile::tempdir().unwrap();
        let config = ParserConfig::builder().work_dir(root.path()).build().unwrap();
        let s = DocParserService::new(config);
        let a = s.new_context(Path::new("a.pdf"), SourceKind::Pdf).unwrap();
        let b = s.new_context(Path::new("b.csv"), SourceKind::Spreadsheet).unwrap();
        assert_ne!(a.work_dir, b.work_dir);
        assert!(a.work_dir.starts_with(root.path()));
        assert_eq!(b.kind, SourceKind::Spreadsheet);
    }
}
