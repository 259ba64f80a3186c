//! The stage vocabulary shared by every pipeline configuration.
//!
//! | Stage                     | Name                    |
//! |---------------------------|-------------------------|
//! | [`OcrStage`]              | `OCR`                   |
//! | [`SplitStage`]            | `Split`                 |
//! | [`ExtractElementsStage`]  | `Extract Elements`      |
//! | [`InterpretFiguresStage`] | `Extract Images`        |
//! | [`FormatTextStage`]       | `Format Extracted Text` |
//! | [`MarkdownStage`]         | `Format Markdown`       |
//!
//! Per-page work is fanned out with `buffer_unordered`, bounded by the
//! configured concurrency. Model calls additionally hold the role's call
//! gate from [`ModelManager::call_gate`], so one resident model never sees
//! two requests at once.

use crate::context::{DocumentContext, Element, Figure, Page, Status};
use crate::error::{DocParseError, PageError};
use crate::models::{FigureInterpreter, Generation, ModelCallError, ModelManager, ModelRole, PageFormatter};
use crate::pipeline::encode::fit_longest_side;
use crate::pipeline::figure::decode_figure_output;
use crate::pipeline::layout::{FigureDetector, PageInput, StructuralExtractor};
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::postprocess::{clean_text, polish_markdown, strip_envelope};
use crate::pipeline::reconcile::{prune_orphan_figures, reconcile_page, ReconcileOptions};
use crate::pipeline::input::SourceKind;
use crate::pipeline::render::Rasterizer;
use crate::pipeline::Stage;
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const OCR: &str = "OCR";
pub const SPLIT: &str = "Split";
pub const EXTRACT_ELEMENTS: &str = "Extract Elements";
pub const EXTRACT_IMAGES: &str = "Extract Images";
pub const FORMAT_TEXT: &str = "Format Extracted Text";
pub const FORMAT_MARKDOWN: &str = "Format Markdown";

fn require_pages(ctx: &DocumentContext, stage: &str) -> Result<(), DocParseError> {
    if ctx.pages.is_empty() {
        return Err(DocParseError::MissingPrerequisite(format!(
            "'{}' needs rasterised pages; run '{}' first",
            stage, SPLIT
        )));
    }
    Ok(())
}

fn notify_page(progress: &Option<ProgressCallback>, stage: &str, page: &Page) {
    if let Some(cb) = progress {
        cb.on_page_complete(stage, page.index, page.status());
    }
}

// ── OCR ──────────────────────────────────────────────────────────────────

pub struct OcrStage {
    engine: Arc<dyn OcrEngine>,
}

impl OcrStage {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &'static str {
        OCR
    }

    async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        if let Some(done) = &ctx.ocr_source {
            debug!("OCR already applied ({}), skipping", done.display());
            return Ok(ctx);
        }
        if ctx.kind != SourceKind::Pdf {
            debug!("OCR skipped for {:?} source", ctx.kind);
            return Ok(ctx);
        }
        let out_dir = ctx.work_dir.join("ocr");
        let searchable = self.engine.ocr(&ctx.source, &out_dir).await?;
        ctx.ocr_source = Some(searchable);
        Ok(ctx)
    }
}

// ── Split ────────────────────────────────────────────────────────────────

pub struct SplitStage {
    rasterizer: Arc<dyn Rasterizer>,
}

impl SplitStage {
    pub fn new(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self { rasterizer }
    }
}

#[async_trait]
impl Stage for SplitStage {
    fn name(&self) -> &'static str {
        SPLIT
    }

    async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        let out_dir = ctx.work_dir.join("pages");
        let mut pages = self
            .rasterizer
            .rasterize(ctx.working_source(), ctx.kind, &out_dir)
            .await?;
        pages.sort_by_key(|p| p.index);
        if pages.iter().enumerate().any(|(i, p)| p.index != i) {
            return Err(DocParseError::RasterisationFailed {
                path: ctx.working_source().to_path_buf(),
                detail: "rasteriser returned non-contiguous page indices".into(),
            });
        }
        ctx.pages = pages;
        ctx.figures.clear();
        Ok(ctx)
    }
}

// ── Extract Elements ─────────────────────────────────────────────────────

pub struct ExtractElementsStage {
    extractor: Arc<dyn StructuralExtractor>,
    detector: Option<Arc<dyn FigureDetector>>,
    options: ReconcileOptions,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl ExtractElementsStage {
    pub fn new(
        extractor: Arc<dyn StructuralExtractor>,
        detector: Option<Arc<dyn FigureDetector>>,
        options: ReconcileOptions,
        concurrency: usize,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            extractor,
            detector,
            options,
            concurrency: concurrency.max(1),
            progress,
        }
    }
}

type PageExtraction = Result<(Vec<Element>, Vec<Figure>), String>;

#[async_trait]
impl Stage for ExtractElementsStage {
    fn name(&self) -> &'static str {
        EXTRACT_ELEMENTS
    }

    async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        require_pages(&ctx, EXTRACT_ELEMENTS)?;
        let crop_dir = ctx.work_dir.join("figures");
        let source = ctx.working_source().to_path_buf();
        let kind = ctx.kind;

        let jobs: Vec<(usize, usize, PathBuf)> = ctx
            .pages
            .iter()
            .enumerate()
            .map(|(pos, p)| (pos, p.index, p.image.clone()))
            .collect();

        let results: Vec<(usize, PageExtraction)> = stream::iter(jobs.into_iter().map(
            |(pos, page_index, page_image)| {
                let source = &source;
                let crop_dir = &crop_dir;
                async move {
                    let input = PageInput {
                        source,
                        kind,
                        page_index,
                        page_image: &page_image,
                        crop_dir,
                    };
                    (pos, self.extract_page(&input).await)
                }
            },
        ))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;

        let mut figures: Vec<Figure> = Vec::new();
        for (pos, result) in results {
            let page = &mut ctx.pages[pos];
            match result {
                Ok((elements, page_figures)) => {
                    debug!(
                        "Page {}: {} elements, {} figures",
                        page.index,
                        elements.len(),
                        page_figures.len()
                    );
                    page.elements = elements;
                    figures.extend(page_figures);
                }
                Err(detail) => {
                    warn!("Page {}: extraction failed: {}", page.index, detail);
                    page.elements.clear();
                    page.mark_failed(PageError::ExtractionFailed {
                        page: page.index,
                        detail,
                    });
                }
            }
            notify_page(&self.progress, EXTRACT_ELEMENTS, page);
        }

        figures.sort_by_key(|f| (f.page_index, f.element_index));
        ctx.figures = figures;
        prune_orphan_figures(&mut ctx);
        Ok(ctx)
    }
}

impl ExtractElementsStage {
    async fn extract_page(&self, input: &PageInput<'_>) -> PageExtraction {
        let raw = self
            .extractor
            .extract(input)
            .await
            .map_err(|e| e.to_string())?;

        let regions = match &self.detector {
            Some(detector) => detector.detect(input).await.unwrap_or_else(|e| {
                warn!("Page {}: figure detection failed: {}", input.page_index, e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let page_index = input.page_index;
        let options = self.options;
        tokio::task::spawn_blocking(move || reconcile_page(page_index, raw, &regions, options))
            .await
            .map_err(|e| format!("reconcile task panicked: {}", e))
    }
}

// ── Extract Images ───────────────────────────────────────────────────────

pub struct InterpretFiguresStage {
    manager: Arc<ModelManager>,
    variant: String,
    concurrency: usize,
}

impl InterpretFiguresStage {
    pub fn new(manager: Arc<ModelManager>, variant: impl Into<String>, concurrency: usize) -> Self {
        Self {
            manager,
            variant: variant.into(),
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl Stage for InterpretFiguresStage {
    fn name(&self) -> &'static str {
        EXTRACT_IMAGES
    }

    async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        require_pages(&ctx, EXTRACT_IMAGES)?;
        let pending: Vec<usize> = ctx
            .figures
            .iter()
            .enumerate()
            .filter(|(_, f)| f.status == Status::Pending)
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            debug!("No figures to interpret");
            return Ok(ctx);
        }

        // The lease pins the model for the whole stage.
        let lease = self.manager.figure_interpreter(&self.variant).await?;
        let interpreter: &dyn FigureInterpreter = &*lease;
        let gate = self.manager.call_gate(ModelRole::FigureInterpreter);
        info!("Interpreting {} figures with '{}'", pending.len(), self.variant);

        let jobs: Vec<(usize, Arc<image::DynamicImage>)> = pending
            .iter()
            .map(|&i| (i, Arc::clone(&ctx.figures[i].image)))
            .collect();
        let results: Vec<(usize, Result<Generation, ModelCallError>)> =
            stream::iter(jobs.into_iter().map(|(i, img)| {
                let gate = Arc::clone(&gate);
                async move {
                    let _serialised = gate.lock().await;
                    (i, interpreter.interpret(&img).await)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (i, result) in results {
            let (page_index, element_index) = {
                let f = &ctx.figures[i];
                (f.page_index, f.element_index)
            };
            match result {
                Ok(generation) => {
                    let decoded = decode_figure_output(&generation.text);
                    let figure = &mut ctx.figures[i];
                    figure.generated_text = generation.text;
                    figure.status = generation.status;
                    if let Some(element) = ctx.element_mut(page_index, element_index) {
                        element.status = generation.status;
                        element.text = decoded.data;
                        if let Some(meta) = element.image.as_mut() {
                            meta.image_type = decoded.image_type;
                            meta.caption = decoded.caption;
                            meta.description = decoded.description;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Figure ({}, {}) interpretation failed: {}",
                        page_index, element_index, e
                    );
                    ctx.figures[i].status = Status::Failed;
                    if let Some(element) = ctx.element_mut(page_index, element_index) {
                        element.status = Status::Failed;
                    }
                }
            }
        }
        Ok(ctx)
    }
}

// ── Format Extracted Text ────────────────────────────────────────────────

pub struct FormatTextStage {
    min_text_chars: usize,
    progress: Option<ProgressCallback>,
}

impl FormatTextStage {
    pub fn new(min_text_chars: usize, progress: Option<ProgressCallback>) -> Self {
        Self {
            min_text_chars,
            progress,
        }
    }
}

#[async_trait]
impl Stage for FormatTextStage {
    fn name(&self) -> &'static str {
        FORMAT_TEXT
    }

    async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        require_pages(&ctx, FORMAT_TEXT)?;
        let mut remap: HashMap<(usize, usize), usize> = HashMap::new();

        for page in ctx.pages.iter_mut() {
            let min = self.min_text_chars;
            let page_index = page.index;
            let kept: Vec<Element> = std::mem::take(&mut page.elements)
                .into_iter()
                .filter(|e| e.is_image() || e.text.trim().chars().count() >= min)
                .collect();
            page.elements = kept
                .into_iter()
                .enumerate()
                .map(|(new_index, mut e)| {
                    remap.insert((page_index, e.index), new_index);
                    e.index = new_index;
                    e
                })
                .collect();

            let joined: String = page
                .elements
                .iter()
                .filter(|e| !e.text.trim().is_empty())
                .map(|e| format!("{}\n\n", e.text))
                .collect();
            page.text = clean_text(&joined);
            page.markdown = page.text.clone();
            notify_page(&self.progress, FORMAT_TEXT, page);
        }

        for figure in ctx.figures.iter_mut() {
            if let Some(&new_index) = remap.get(&(figure.page_index, figure.element_index)) {
                figure.element_index = new_index;
            }
        }
        prune_orphan_figures(&mut ctx);
        Ok(ctx)
    }
}

// ── Format Markdown ──────────────────────────────────────────────────────

pub struct MarkdownStage {
    manager: Arc<ModelManager>,
    variant: String,
    image_pixels: u32,
    concurrency: usize,
    progress: Option<ProgressCallback>,
}

impl MarkdownStage {
    pub fn new(
        manager: Arc<ModelManager>,
        variant: impl Into<String>,
        image_pixels: u32,
        concurrency: usize,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            manager,
            variant: variant.into(),
            image_pixels,
            concurrency: concurrency.max(1),
            progress,
        }
    }
}

#[async_trait]
impl Stage for MarkdownStage {
    fn name(&self) -> &'static str {
        FORMAT_MARKDOWN
    }

    async fn run(&self, mut ctx: DocumentContext) -> Result<DocumentContext, DocParseError> {
        require_pages(&ctx, FORMAT_MARKDOWN)?;
        let lease = self.manager.page_formatter(&self.variant).await?;
        let formatter: &dyn PageFormatter = &*lease;
        let gate = self.manager.call_gate(ModelRole::PageFormatter);
        let budget = formatter.max_new_tokens();

        let jobs: Vec<(usize, String, PathBuf)> = ctx
            .pages
            .iter()
            .enumerate()
            .map(|(pos, p)| (pos, p.text.clone(), p.image.clone()))
            .collect();
        let max_px = self.image_pixels;

        let results: Vec<(usize, Result<Generation, ModelCallError>)> =
            stream::iter(jobs.into_iter().map(|(pos, text, image_path)| {
                let gate = Arc::clone(&gate);
                async move {
                    let loaded = tokio::task::spawn_blocking(move || {
                        image::open(&image_path)
                            .map(|img| fit_longest_side(&img, max_px))
                            .map_err(|e| format!("{}: {}", image_path.display(), e))
                    })
                    .await
                    .map_err(|e| format!("image task panicked: {}", e))
                    .and_then(|r| r);
                    let img = match loaded {
                        Ok(img) => img,
                        Err(detail) => return (pos, Err(ModelCallError::new(0, detail))),
                    };
                    let _serialised = gate.lock().await;
                    (pos, formatter.format(&text, &img).await)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (pos, result) in results {
            let page = &mut ctx.pages[pos];
            match result {
                Ok(generation) if generation.is_truncated() => {
                    warn!("Page {}: formatter hit its {} token budget", page.index, budget);
                    page.mark_failed(PageError::FormatterTruncated {
                        page: page.index,
                        max_new_tokens: budget,
                    });
                    page.markdown = page.text.clone();
                }
                Ok(generation) => {
                    let markdown = polish_markdown(&strip_envelope(&generation.text));
                    page.markdown = if markdown.trim().is_empty() {
                        page.text.clone()
                    } else {
                        markdown
                    };
                }
                Err(e) => {
                    warn!("Page {}: {}", page.index, e);
                    page.mark_failed(PageError::FormatterFailed {
                        page: page.index,
                        retries: e.retries,
                        detail: e.detail,
                    });
                    page.markdown = page.text.clone();
                }
            }
            notify_page(&self.progress, FORMAT_MARKDOWN, page);
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ImageMetadata;

    struct CountingOcr(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl OcrEngine for CountingOcr {
        async fn ocr(
            &self,
            _source: &std::path::Path,
            out_dir: &std::path::Path,
        ) -> Result<PathBuf, DocParseError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(out_dir.join("x.ocr.pdf"))
        }
    }

    #[tokio::test]
    async fn ocr_is_idempotent() {
        let engine = Arc::new(CountingOcr(Default::default()));
        let stage = OcrStage::new(engine.clone());
        let ctx = stage
            .run(DocumentContext::new("x.pdf", "/tmp/w"))
            .await
            .unwrap();
        assert_eq!(ctx.ocr_source, Some(PathBuf::from("/tmp/w/ocr/x.ocr.pdf")));
        let again = stage.run(ctx.clone()).await.unwrap();
        assert_eq!(again.ocr_source, ctx.ocr_source);
        assert_eq!(engine.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn format_text_prunes_reindexes_and_remaps_figures() {
        let mut ctx = DocumentContext::new("x.pdf", "/tmp/w");
        let mut page = Page::new(0, "p.png");
        page.elements = vec![
            Element::text(0, "x", None),
            Element::text(1, "Hello  ,world", None),
            Element::image(2, ImageMetadata::default(), None),
            Element::text(3, "End of exam-\nple", None),
        ];
        ctx.pages.push(page);
        ctx.figures
            .push(Figure::new(0, 2, image::DynamicImage::new_rgb8(1, 1)));

        let ctx = FormatTextStage::new(2, None).run(ctx).await.unwrap();
        let page = &ctx.pages[0];
        assert_eq!(page.elements.len(), 3);
        assert!(page.has_dense_indices());
        assert_eq!(ctx.figures[0].element_index, 1);
        assert!(page.elements[1].is_image());
        assert_eq!(page.text, "Hello,world\n\nEnd of example");
        assert_eq!(page.markdown, page.text);
    }

    #[tokio::test]
    async fn stages_need_pages() {
        let err = FormatTextStage::new(2, None)
            .run(DocumentContext::new("x.pdf", "/tmp/w"))
            .await
            .unwrap_err();
        assert!(matches!(err, DocParseError::MissingPrerequisite(_)));
    }
}
