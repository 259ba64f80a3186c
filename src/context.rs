//! The document model threaded through the pipeline.
//!
//! A [`DocumentContext`] is created once per request, handed to each stage by
//! value and replaced by the stage's output. Stages never share internals
//! with each other; everything they communicate goes through these types.
//!
//! ```text
//! DocumentContext
//!  ├─ pages:   Vec<Page>      one per rasterised source unit
//!  │            └─ elements: Vec<Element>   dense 0..n indices
//!  │                 └─ image: Option<ImageMetadata>   image elements only
//!  └─ figures: Vec<Figure>    pending interpretations, keyed by
//!                             (page_index, element_index)
//! ```

use crate::error::PageError;
use crate::pipeline::input::SourceKind;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── Status ───────────────────────────────────────────────────────────────

/// Processing status of a page, element or figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Awaiting interpretation (figures only).
    Pending,
    #[default]
    Success,
    Failed,
}

// ── Elements ─────────────────────────────────────────────────────────────

/// Structural type of an [`Element`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Text,
    Table,
    Image,
}

/// Axis-aligned box `[x0, y0, x1, y1]` in page pixel space.
///
/// Synthetic elements (fused tables, full-page images) carry the zero box.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f32; 4]);

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self([x0, y0, x1, y1])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

/// Interpretation of an image element.
///
/// Everything except `ocr_text` stays empty until the figure interpreter has
/// run; `ocr_text` is whatever raw text the detector saw inside the region.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub image_type: String,
    pub caption: String,
    pub description: String,
    pub ocr_text: String,
    /// `data:image/jpeg;base64,...` thumbnail of the cropped region.
    pub preview_base64: String,
}

/// One structural unit on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub index: usize,
    pub kind: ElementKind,
    pub status: Status,
    #[serde(default)]
    pub bbox: BoundingBox,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageMetadata>,
}

impl Element {
    pub fn text(index: usize, text: impl Into<String>, bbox: Option<BoundingBox>) -> Self {
        Self {
            index,
            kind: ElementKind::Text,
            status: Status::Success,
            bbox: bbox.unwrap_or_default(),
            text: text.into(),
            image: None,
        }
    }

    pub fn table(index: usize, markdown: impl Into<String>, bbox: Option<BoundingBox>) -> Self {
        Self {
            index,
            kind: ElementKind::Table,
            status: Status::Success,
            bbox: bbox.unwrap_or_default(),
            text: markdown.into(),
            image: None,
        }
    }

    pub fn image(index: usize, metadata: ImageMetadata, bbox: Option<BoundingBox>) -> Self {
        Self {
            index,
            kind: ElementKind::Image,
            status: Status::Success,
            bbox: bbox.unwrap_or_default(),
            text: String::new(),
            image: Some(metadata),
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == ElementKind::Image
    }
}

// ── Page ─────────────────────────────────────────────────────────────────

/// One rasterised unit of the source document.
///
/// The status only moves `success → failed`; there is deliberately no way
/// to flip a failed page back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub index: usize,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<PageError>,
    /// Rendered raster, or the source itself for spreadsheets.
    pub image: PathBuf,
    pub text: String,
    pub markdown: String,
    pub elements: Vec<Element>,
}

impl Page {
    pub fn new(index: usize, image: impl Into<PathBuf>) -> Self {
        Self {
            index,
            status: Status::Success,
            error: None,
            image: image.into(),
            text: String::new(),
            markdown: String::new(),
            elements: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    /// The first non-recoverable condition reported for this page.
    pub fn error(&self) -> Option<&PageError> {
        self.error.as_ref()
    }

    /// Mark the page failed. The first recorded error wins.
    pub fn mark_failed(&mut self, error: PageError) {
        self.status = Status::Failed;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// True if element indices are exactly `0..elements.len()`.
    pub fn has_dense_indices(&self) -> bool {
        self.elements.iter().enumerate().all(|(i, e)| e.index == i)
    }
}

// ── Figure ───────────────────────────────────────────────────────────────

/// A detected image region awaiting interpretation.
///
/// Linked to its owning element by `(page_index, element_index)` rather than
/// by reference; the pair is resolved against the page list when needed.
#[derive(Clone, Serialize)]
pub struct Figure {
    pub page_index: usize,
    pub element_index: usize,
    #[serde(skip)]
    pub image: Arc<DynamicImage>,
    pub generated_text: String,
    pub status: Status,
}

impl Figure {
    pub fn new(page_index: usize, element_index: usize, image: DynamicImage) -> Self {
        Self {
            page_index,
            element_index,
            image: Arc::new(image),
            generated_text: String::new(),
            status: Status::Pending,
        }
    }
}

impl fmt::Debug for Figure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Figure")
            .field("page_index", &self.page_index)
            .field("element_index", &self.element_index)
            .field(
                "image",
                &format_args!("{}x{}", self.image.width(), self.image.height()),
            )
            .field("generated_text", &self.generated_text)
            .field("status", &self.status)
            .finish()
    }
}

// ── DocumentContext ──────────────────────────────────────────────────────

/// Root aggregate for one request.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentContext {
    pub source: PathBuf,
    pub kind: SourceKind,
    /// Searchable copy produced by OCR. Once set, OCR is never re-run.
    pub ocr_source: Option<PathBuf>,
    pub pages: Vec<Page>,
    pub figures: Vec<Figure>,
    /// Wall-clock milliseconds per stage name.
    pub stage_timings: BTreeMap<String, u64>,
    /// Sum of stage timings over every pipeline run on this context.
    pub processing_time_ms: u64,
    /// Per-request scratch directory for page rasters, crops and OCR output.
    #[serde(skip)]
    pub work_dir: PathBuf,
}

impl DocumentContext {
    /// A PDF context; use [`with_kind`](Self::with_kind) for other sources.
    pub fn new(source: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            kind: SourceKind::Pdf,
            ocr_source: None,
            pages: Vec::new(),
            figures: Vec::new(),
            stage_timings: BTreeMap::new(),
            processing_time_ms: 0,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// The file later stages should read: the OCR'd copy when present.
    pub fn working_source(&self) -> &Path {
        self.ocr_source.as_deref().unwrap_or(&self.source)
    }

    pub fn element(&self, page_index: usize, element_index: usize) -> Option<&Element> {
        self.pages
            .iter()
            .find(|p| p.index == page_index)
            .and_then(|p| p.elements.iter().find(|e| e.index == element_index))
    }

    pub fn element_mut(&mut self, page_index: usize, element_index: usize) -> Option<&mut Element> {
        self.pages
            .iter_mut()
            .find(|p| p.index == page_index)
            .and_then(|p| p.elements.iter_mut().find(|e| e.index == element_index))
    }

    pub fn failed_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_failed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_page_never_reverts() {
        let mut page = Page::new(0, "p0.png");
        assert_eq!(page.status(), Status::Success);
        page.mark_failed(PageError::ExtractionFailed {
            page: 0,
            detail: "first".into(),
        });
        page.mark_failed(PageError::FormatterTruncated {
            page: 0,
            max_new_tokens: 10,
        });
        assert!(page.is_failed());
        assert!(matches!(
            page.error(),
            Some(PageError::ExtractionFailed { .. })
        ));
    }

    #[test]
    fn statuses_serialise_lowercase() {
        let el = Element::text(0, "hello", None);
        let json = serde_json::to_value(&el).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["kind"], "text");
        assert_eq!(json["bbox"], serde_json::json!([0.0, 0.0, 0.0, 0.0]));
        assert!(json.get("image").is_none());
    }

    #[test]
    fn working_source_prefers_ocr_copy() {
        let mut ctx = DocumentContext::new("in.pdf", "/tmp/w");
        assert_eq!(ctx.working_source(), Path::new("in.pdf"));
        ctx.ocr_source = Some("in.ocr.pdf".into());
        assert_eq!(ctx.working_source(), Path::new("in.ocr.pdf"));
    }

    #[test]
    fn figure_debug_does_not_dump_pixels() {
        let fig = Figure::new(1, 2, DynamicImage::new_rgb8(4, 3));
        let dbg = format!("{fig:?}");
        assert!(dbg.contains("4x3"), "got: {dbg}");
        assert_eq!(fig.status, Status::Pending);
    }

    #[test]
    fn element_lookup_by_pair() {
        let mut ctx = DocumentContext::new("in.pdf", "/tmp/w");
        let mut page = Page::new(3, "p3.png");
        page.elements.push(Element::text(0, "a", None));
        page.elements
            .push(Element::image(1, ImageMetadata::default(), None));
        ctx.pages.push(page);

        assert!(ctx.element(3, 1).map(|e| e.is_image()).unwrap_or(false));
        assert!(ctx.element(3, 2).is_none());
        assert!(ctx.element(0, 0).is_none());
    }
}
