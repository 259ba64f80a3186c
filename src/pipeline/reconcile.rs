//! Reconciliation engine: raw extractor output → final page elements.
//!
//! Walks the raw elements of one page in order and
//!
//! * drops text elements that are empty after trimming (they do not break
//!   table adjacency),
//! * fuses consecutive table fragments whose column counts agree, flushing
//!   each fused table through [`format_table`],
//! * loads and downsizes image crops, attaching a JPEG preview and queueing
//!   a [`Figure`] for interpretation,
//! * suppresses image elements that land in a detector region already
//!   claimed by an earlier element,
//! * assigns dense indices as elements are emitted.
//!
//! ```text
//! raw:   [text] [table 3] [table 3] [table 4] [image] [ ]
//! out:   0:text 1:table(fused) 2:table 3:image
//! ```

use crate::context::{
    BoundingBox, DocumentContext, Element, ElementKind, Figure, ImageMetadata, Status,
};
use crate::pipeline::encode::{encode_preview, fit_longest_side};
use crate::pipeline::layout::RawElement;
use crate::pipeline::table::{column_count, filter_table, format_table};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Pixel slack when testing whether an element sits inside a region.
pub const REGION_TOLERANCE: f32 = 20.0;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub figure_max_pixels: u32,
    pub preview_jpeg_quality: u8,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            figure_max_pixels: 560,
            preview_jpeg_quality: 20,
        }
    }
}

/// Reconcile one page. Returns the final elements and the figures queued
/// for interpretation, in structural order.
pub fn reconcile_page(
    page_index: usize,
    raw: Vec<RawElement>,
    regions: &[BoundingBox],
    opts: ReconcileOptions,
) -> (Vec<Element>, Vec<Figure>) {
    let mut elements: Vec<Element> = Vec::new();
    let mut figures: Vec<Figure> = Vec::new();
    let mut pending_table: Option<PendingTable> = None;
    let mut claimed: Vec<bool> = vec![false; regions.len()];

    for el in raw {
        match el.kind {
            ElementKind::Text => {
                if el.text.trim().is_empty() {
                    continue;
                }
                flush_table(&mut pending_table, &mut elements);
                let index = elements.len();
                elements.push(Element::text(index, el.text, el.bbox));
            }
            ElementKind::Table => {
                let markdown = match &el.table {
                    Some(t) => filter_table(&t.to_markdown()),
                    None => filter_table(&el.text),
                };
                if markdown.is_empty() {
                    continue;
                }
                let columns = column_count(&markdown);
                match pending_table.as_mut() {
                    Some(p) if p.columns == columns => {
                        p.markdown.push('\n');
                        p.markdown.push_str(&markdown);
                        p.fused = true;
                    }
                    _ => {
                        flush_table(&mut pending_table, &mut elements);
                        pending_table = Some(PendingTable {
                            markdown,
                            columns,
                            bbox: el.bbox,
                            fused: false,
                        });
                    }
                }
            }
            ElementKind::Image => {
                let mut bbox = el.bbox;
                if let Some(b) = bbox {
                    match region_of(&b, regions) {
                        Some(r) if claimed[r] => {
                            debug!("Page {}: image inside claimed region {}, skipped", page_index, r);
                            continue;
                        }
                        Some(r) => {
                            claimed[r] = true;
                            bbox = Some(regions[r]);
                        }
                        None => {}
                    }
                }
                flush_table(&mut pending_table, &mut elements);
                let index = elements.len();
                let (element, figure) = build_image(page_index, index, el, bbox, opts);
                elements.push(element);
                figures.extend(figure);
            }
        }
    }
    flush_table(&mut pending_table, &mut elements);

    (elements, figures)
}

struct PendingTable {
    markdown: String,
    columns: usize,
    bbox: Option<BoundingBox>,
    fused: bool,
}

fn flush_table(pending: &mut Option<PendingTable>, elements: &mut Vec<Element>) {
    if let Some(t) = pending.take() {
        let index = elements.len();
        // A fused table spans several regions; it gets the zero box.
        let bbox = if t.fused { None } else { t.bbox };
        elements.push(Element::table(index, format_table(&t.markdown), bbox));
    }
}

/// Index of the first region containing `bbox` within the tolerance.
pub fn region_of(bbox: &BoundingBox, regions: &[BoundingBox]) -> Option<usize> {
    regions.iter().position(|r| contains(r, bbox, REGION_TOLERANCE))
}

fn contains(outer: &BoundingBox, inner: &BoundingBox, tol: f32) -> bool {
    let [ox0, oy0, ox1, oy1] = outer.0;
    let [ix0, iy0, ix1, iy1] = inner.0;
    ix0 >= ox0 - tol && iy0 >= oy0 - tol && ix1 <= ox1 + tol && iy1 <= oy1 + tol
}

fn build_image(
    page_index: usize,
    index: usize,
    raw: RawElement,
    bbox: Option<BoundingBox>,
    opts: ReconcileOptions,
) -> (Element, Option<Figure>) {
    let mut metadata = ImageMetadata {
        ocr_text: raw.text.trim().to_string(),
        ..Default::default()
    };

    let loaded = raw
        .image_path
        .as_ref()
        .ok_or_else(|| "no crop path".to_string())
        .and_then(|p| image::open(p).map_err(|e| format!("{}: {}", p.display(), e)));

    let img = match loaded {
        Ok(img) => fit_longest_side(&img, opts.figure_max_pixels),
        Err(e) => {
            warn!("Page {}: image element {} unreadable: {}", page_index, index, e);
            let mut element = Element::image(index, metadata, bbox);
            element.status = Status::Failed;
            return (element, None);
        }
    };

    match encode_preview(&img, opts.preview_jpeg_quality) {
        Ok(preview) => metadata.preview_base64 = preview,
        Err(e) => warn!("Page {}: preview for element {} failed: {}", page_index, index, e),
    }

    let element = Element::image(index, metadata, bbox);
    (element, Some(Figure::new(page_index, index, img)))
}

/// Drop figures whose `(page, element)` pair no longer resolves to an image
/// element. Returns how many were removed.
pub fn prune_orphan_figures(ctx: &mut DocumentContext) -> usize {
    let live: HashSet<(usize, usize)> = ctx
        .pages
        .iter()
        .flat_map(|p| {
            p.elements
                .iter()
                .filter(|e| e.is_image())
                .map(move |e| (p.index, e.index))
        })
        .collect();
    let before = ctx.figures.len();
    ctx.figures
        .retain(|f| live.contains(&(f.page_index, f.element_index)));
    let removed = before - ctx.figures.len();
    if removed > 0 {
        debug!("Pruned {} orphan figures", removed);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Page;
    use crate::pipeline::encode::PREVIEW_PREFIX;
    use crate::pipeline::table::RawTable;

    fn table(cols: usize, cell: &str) -> RawElement {
        RawElement::table(RawTable::Rows(vec![vec![cell.to_string(); cols]]), None)
    }

    #[test]
    fn fuses_equal_width_fragments_only() {
        let raw = vec![table(3, "a"), table(3, "b"), table(4, "c")];
        let (els, figs) = reconcile_page(0, raw, &[], ReconcileOptions::default());
        assert!(figs.is_empty());
        assert_eq!(els.len(), 2);
        assert_eq!(
            els[0].text,
            "| a | a | a |\n| --- | --- | --- |\n| b | b | b |"
        );
        assert_eq!(els[1].text, "| c | c | c | c |\n| --- | --- | --- | --- |");
        assert_eq!(els[1].index, 1);
    }

    #[test]
    fn pipe_inside_cell_keeps_column_count() {
        let rows = |r: &[&[&str]]| {
            RawTable::Rows(
                r.iter()
                    .map(|row| row.iter().map(|c| c.to_string()).collect())
                    .collect(),
            )
        };
        let raw = vec![
            RawElement::table(rows(&[&["a|b", "c"], &["1", "2"]]), None),
            RawElement::table(rows(&[&["3", "4"]]), None),
        ];
        let (els, _) = reconcile_page(0, raw, &[], ReconcileOptions::default());
        assert_eq!(els.len(), 1);
        assert_eq!(
            els[0].text,
            "| a\\|b | c |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |"
        );
    }

    #[test]
    fn empty_text_does_not_break_table_run() {
        let raw = vec![
            RawElement::text("Intro", None),
            table(2, "a"),
            RawElement::text("   ", None),
            table(2, "b"),
            RawElement::text("Outro", None),
        ];
        let (els, _) = reconcile_page(0, raw, &[], ReconcileOptions::default());
        let kinds: Vec<ElementKind> = els.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ElementKind::Text, ElementKind::Table, ElementKind::Text]
        );
        assert!(els.iter().enumerate().all(|(i, e)| e.index == i));
    }

    #[test]
    fn image_gets_preview_and_figure() {
        let dir = tempfile::tempdir().unwrap();
        let crop = dir.path().join("fig.png");
        image::DynamicImage::new_rgb8(1200, 600).save(&crop).unwrap();

        let raw = vec![
            RawElement::text("Caption above", None),
            RawElement::image(&crop, None, " label "),
        ];
        let (els, figs) = reconcile_page(2, raw, &[], ReconcileOptions::default());
        assert_eq!(figs.len(), 1);
        assert_eq!((figs[0].page_index, figs[0].element_index), (2, 1));
        assert_eq!(figs[0].image.width(), 560);
        assert_eq!(figs[0].status, Status::Pending);
        let meta = els[1].image.as_ref().unwrap();
        assert!(meta.preview_base64.starts_with(PREVIEW_PREFIX));
        assert_eq!(meta.ocr_text, "label");
    }

    #[test]
    fn unreadable_crop_fails_element_without_figure() {
        let raw = vec![RawElement::image("/no/such/crop.png", None, "")];
        let (els, figs) = reconcile_page(0, raw, &[], ReconcileOptions::default());
        assert_eq!(els.len(), 1);
        assert_eq!(els[0].status, Status::Failed);
        assert!(figs.is_empty());
    }

    #[test]
    fn duplicate_inside_claimed_region_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let crop = dir.path().join("fig.png");
        image::DynamicImage::new_rgb8(10, 10).save(&crop).unwrap();

        let region = BoundingBox::new(100.0, 100.0, 400.0, 400.0);
        let raw = vec![
            RawElement::image(&crop, Some(BoundingBox::new(90.0, 110.0, 300.0, 300.0)), ""),
            RawElement::image(&crop, Some(BoundingBox::new(200.0, 200.0, 410.0, 390.0)), ""),
            RawElement::image(&crop, Some(BoundingBox::new(500.0, 500.0, 600.0, 600.0)), ""),
        ];
        let (els, figs) = reconcile_page(0, raw, &[region], ReconcileOptions::default());
        assert_eq!(els.len(), 2);
        assert_eq!(figs.len(), 2);
        assert_eq!(els[0].bbox, region);
        assert_eq!(els[1].bbox, BoundingBox::new(500.0, 500.0, 600.0, 600.0));
    }

    #[test]
    fn orphans_are_pruned() {
        let mut ctx = DocumentContext::new("x.pdf", "/tmp");
        let mut page = Page::new(0, "p.png");
        page.elements.push(Element::text(0, "t", None));
        page.elements
            .push(Element::image(1, ImageMetadata::default(), None));
        ctx.pages.push(page);
        let img = image::DynamicImage::new_rgb8(1, 1);
        ctx.figures.push(Figure::new(0, 1, img.clone()));
        ctx.figures.push(Figure::new(0, 0, img.clone()));
        ctx.figures.push(Figure::new(5, 1, img));

        assert_eq!(prune_orphan_figures(&mut ctx), 2);
        assert_eq!(ctx.figures.len(), 1);
        assert_eq!(ctx.figures[0].element_index, 1);
    }
}
