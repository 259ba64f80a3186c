//! Structural extraction: one page in, a list of raw elements out.
//!
//! The extractor is a seam. [`DefaultStructuralExtractor`] reads what the
//! source itself exposes (the PDF text layer and embedded image objects,
//! spreadsheet cells, or a bare raster) and can be swapped for a layout
//! model through [`crate::DocParserService::with_extractor`].
//!
//! Raw elements are *not* final: the reconciliation engine
//! ([`super::reconcile`]) fuses table fragments, drops empty text, crops
//! figures and assigns dense indices.

use crate::context::{BoundingBox, ElementKind};
use crate::error::DocParseError;
use crate::pipeline::input::{sheet_format, SheetFormat, SourceKind};
use crate::pipeline::render::bind_pdfium;
use crate::pipeline::table::RawTable;
use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Reader};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One element as reported by an extractor, in reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawElement {
    pub kind: ElementKind,
    pub bbox: Option<BoundingBox>,
    pub text: String,
    pub table: Option<RawTable>,
    /// Cropped region on disk, image elements only.
    pub image_path: Option<PathBuf>,
}

impl RawElement {
    pub fn text(text: impl Into<String>, bbox: Option<BoundingBox>) -> Self {
        Self {
            kind: ElementKind::Text,
            bbox,
            text: text.into(),
            table: None,
            image_path: None,
        }
    }

    pub fn table(table: RawTable, bbox: Option<BoundingBox>) -> Self {
        Self {
            kind: ElementKind::Table,
            bbox,
            text: String::new(),
            table: Some(table),
            image_path: None,
        }
    }

    /// `ocr_text` is whatever text the extractor saw inside the region.
    pub fn image(
        path: impl Into<PathBuf>,
        bbox: Option<BoundingBox>,
        ocr_text: impl Into<String>,
    ) -> Self {
        Self {
            kind: ElementKind::Image,
            bbox,
            text: ocr_text.into(),
            table: None,
            image_path: Some(path.into()),
        }
    }
}

/// What an extractor gets to see of one page.
#[derive(Debug, Clone, Copy)]
pub struct PageInput<'a> {
    /// The working source (OCR'd copy when present).
    pub source: &'a Path,
    pub kind: SourceKind,
    pub page_index: usize,
    /// Rendered raster, or the source itself for spreadsheets.
    pub page_image: &'a Path,
    /// Directory for cropped figures of this request.
    pub crop_dir: &'a Path,
}

#[async_trait]
pub trait StructuralExtractor: Send + Sync {
    async fn extract(&self, page: &PageInput<'_>) -> Result<Vec<RawElement>, DocParseError>;
}

/// Optional region detector used to suppress duplicate image elements.
///
/// Each returned box is a figure region in page pixel space. When regions
/// are present, an image element that falls inside a region already claimed
/// by an earlier element is treated as a duplicate.
#[async_trait]
pub trait FigureDetector: Send + Sync {
    async fn detect(&self, page: &PageInput<'_>) -> Result<Vec<BoundingBox>, DocParseError>;
}

/// Extractor that relies on what the source format exposes natively.
#[derive(Debug, Clone, Default)]
pub struct DefaultStructuralExtractor {
    pub password: Option<String>,
}

impl DefaultStructuralExtractor {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl StructuralExtractor for DefaultStructuralExtractor {
    async fn extract(&self, page: &PageInput<'_>) -> Result<Vec<RawElement>, DocParseError> {
        match page.kind {
            SourceKind::Image => Ok(vec![whole_page_image(page.page_image)?]),
            SourceKind::Spreadsheet => {
                let path = page.source.to_path_buf();
                tokio::task::spawn_blocking(move || read_spreadsheet(&path))
                    .await
                    .map_err(|e| DocParseError::Internal(format!("Sheet task panicked: {}", e)))?
            }
            SourceKind::Pdf => {
                let source = page.source.to_path_buf();
                let image = page.page_image.to_path_buf();
                let crop_dir = page.crop_dir.to_path_buf();
                let index = page.page_index;
                let password = self.password.clone();
                tokio::task::spawn_blocking(move || {
                    extract_pdf_page(&source, password.as_deref(), index, &image, &crop_dir)
                })
                .await
                .map_err(|e| DocParseError::Internal(format!("Extract task panicked: {}", e)))?
            }
        }
    }
}

fn whole_page_image(page_image: &Path) -> Result<RawElement, DocParseError> {
    let (w, h) = image::image_dimensions(page_image).map_err(|e| DocParseError::CorruptSource {
        path: page_image.to_path_buf(),
        detail: e.to_string(),
    })?;
    Ok(RawElement::image(
        page_image,
        Some(BoundingBox::new(0.0, 0.0, w as f32, h as f32)),
        "",
    ))
}

// ── PDF ──────────────────────────────────────────────────────────────────

fn extract_pdf_page(
    source: &Path,
    password: Option<&str>,
    page_index: usize,
    page_image: &Path,
    crop_dir: &Path,
) -> Result<Vec<RawElement>, DocParseError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(source, password)
        .map_err(|e| DocParseError::CorruptSource {
            path: source.to_path_buf(),
            detail: format!("{:?}", e),
        })?;
    let pages = document.pages();
    let page = pages
        .get(page_index as u16)
        .map_err(|e| DocParseError::CorruptSource {
            path: source.to_path_buf(),
            detail: format!("page {}: {:?}", page_index + 1, e),
        })?;

    let page_w = page.width().value.max(1.0);
    let page_h = page.height().value;
    let scale = match image::image_dimensions(page_image) {
        Ok((w, _)) => w as f32 / page_w,
        Err(_) => 1.0,
    };
    // PDF space is bottom-up points; pixel space is top-down.
    let to_px = |left: f32, top: f32, right: f32, bottom: f32| {
        BoundingBox::new(
            left * scale,
            (page_h - top) * scale,
            right * scale,
            (page_h - bottom) * scale,
        )
    };

    let mut elements: Vec<RawElement> = Vec::new();

    if let Ok(text_page) = page.text() {
        let mut lines = Vec::new();
        for segment in text_page.segments().iter() {
            let text = segment.text();
            if text.trim().is_empty() {
                continue;
            }
            let b = segment.bounds();
            lines.push((
                text,
                to_px(b.left().value, b.top().value, b.right().value, b.bottom().value),
            ));
        }
        elements.extend(
            group_paragraphs(lines)
                .into_iter()
                .map(|(text, bbox)| RawElement::text(text, Some(bbox))),
        );
    }

    std::fs::create_dir_all(crop_dir).map_err(|e| DocParseError::io(crop_dir, e))?;
    for (i, object) in page.objects().iter().enumerate() {
        let Some(image_object) = object.as_image_object() else {
            continue;
        };
        let raw = match image_object.get_raw_image() {
            Ok(img) => img,
            Err(e) => {
                warn!("Page {}: unreadable image object {}: {:?}", page_index + 1, i, e);
                continue;
            }
        };
        let bbox = object
            .bounds()
            .ok()
            .map(|b| to_px(b.left().value, b.top().value, b.right().value, b.bottom().value));
        let crop = crop_dir.join(format!("page_{:04}_obj_{:03}.png", page_index, i));
        raw.save(&crop).map_err(|e| DocParseError::Io {
            path: crop.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;
        elements.push(RawElement::image(crop, bbox, ""));
    }

    sort_reading_order(&mut elements);
    debug!("Page {}: {} raw elements", page_index + 1, elements.len());
    Ok(elements)
}

/// Merge text lines into paragraphs when the vertical gap is under one line.
fn group_paragraphs(lines: Vec<(String, BoundingBox)>) -> Vec<(String, BoundingBox)> {
    let mut out: Vec<(String, BoundingBox)> = Vec::new();
    for (text, bbox) in lines {
        let line_height = (bbox.0[3] - bbox.0[1]).abs().max(1.0);
        match out.last_mut() {
            Some((para, pb)) if bbox.0[1] - pb.0[3] <= line_height * 0.8 => {
                para.push(if bbox.0[1] < pb.0[3] - line_height * 0.5 { ' ' } else { '\n' });
                para.push_str(text.trim());
                *pb = BoundingBox::new(
                    pb.0[0].min(bbox.0[0]),
                    pb.0[1].min(bbox.0[1]),
                    pb.0[2].max(bbox.0[2]),
                    pb.0[3].max(bbox.0[3]),
                );
            }
            _ => out.push((text.trim().to_string(), bbox)),
        }
    }
    out
}

fn sort_reading_order(elements: &mut [RawElement]) {
    elements.sort_by(|a, b| {
        let ka = a.bbox.map(|b| (b.0[1], b.0[0])).unwrap_or((f32::MAX, 0.0));
        let kb = b.bbox.map(|b| (b.0[1], b.0[0])).unwrap_or((f32::MAX, 0.0));
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    });
}

// ── Spreadsheets ─────────────────────────────────────────────────────────

fn read_spreadsheet(path: &Path) -> Result<Vec<RawElement>, DocParseError> {
    match sheet_format(path) {
        Some(SheetFormat::Csv) => read_delimited(path, ','),
        Some(SheetFormat::Tsv) => read_delimited(path, '\t'),
        Some(SheetFormat::Workbook) => read_workbook(path),
        None => Err(DocParseError::UnsupportedSource {
            path: path.to_path_buf(),
            detail: "not a spreadsheet".into(),
        }),
    }
}

fn read_delimited(path: &Path, delimiter: char) -> Result<Vec<RawElement>, DocParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| DocParseError::io(path, e))?;
    let rows = parse_delimited(&content, delimiter);
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![RawElement::table(RawTable::Rows(rows), None)])
}

/// Split delimited text into records, honouring double quotes and `""`
/// escapes. Line breaks inside quotes belong to the field; blank lines
/// outside quotes are skipped.
pub fn parse_delimited(content: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut chars = content.chars().peekable();

    let mut end_record = |record: &mut Vec<String>, field: &mut String, quoted: bool| {
        let blank = record.is_empty() && field.trim().is_empty() && !quoted;
        record.push(std::mem::take(field));
        let done = std::mem::take(record);
        if !blank {
            rows.push(done);
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            '\r' if !in_quotes && chars.peek() == Some(&'\n') => {}
            '\n' if !in_quotes => {
                end_record(&mut record, &mut field, quoted);
                quoted = false;
            }
            c if c == delimiter && !in_quotes => {
                record.push(std::mem::take(&mut field));
                quoted = false;
            }
            c => field.push(c),
        }
    }
    if !record.is_empty() || !field.is_empty() || quoted {
        end_record(&mut record, &mut field, quoted);
    }
    rows
}

fn read_workbook(path: &Path) -> Result<Vec<RawElement>, DocParseError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| DocParseError::CorruptSource {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let names: Vec<String> = workbook.sheet_names().to_vec();
    let mut elements = Vec::new();
    for name in &names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) => {
                warn!("Sheet '{}' unreadable: {}", name, e);
                continue;
            }
        };
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
            .filter(|cells| cells.iter().any(|c| !c.is_empty()))
            .collect();
        if rows.is_empty() {
            continue;
        }
        if names.len() > 1 {
            elements.push(RawElement::text(format!("## {}", name), None));
        }
        elements.push(RawElement::table(RawTable::Rows(rows), None));
    }
    Ok(elements)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 => format!("{:.0}", f),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => dt.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn quoted_fields_keep_delimiters() {
        assert_eq!(
            parse_delimited(r#"a,"b, c","say ""hi""",,"#, ','),
            vec![vec!["a", "b, c", r#"say "hi""#, "", ""]]
        );
        assert_eq!(parse_delimited("x\ty\r\n", '\t'), vec![vec!["x", "y"]]);
    }

    #[test]
    fn quoted_line_break_stays_in_its_field() {
        let rows = parse_delimited("name,notes\napple,\"line one\nline two\"\npear,ok", ',');
        assert_eq!(
            rows,
            vec![
                vec!["name", "notes"],
                vec!["apple", "line one\nline two"],
                vec!["pear", "ok"],
            ]
        );
        assert_eq!(
            RawTable::Rows(rows).to_markdown(),
            "| name | notes |\n| apple | line one<br>line two |\n| pear | ok |"
        );
    }

    #[test]
    fn csv_becomes_one_table() {
        let mut f = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        f.write_all(b"name,qty\napple,3\n\npear,4\n").unwrap();
        let els = read_spreadsheet(f.path()).unwrap();
        assert_eq!(els.len(), 1);
        assert_eq!(els[0].kind, ElementKind::Table);
        assert_eq!(
            els[0].table.as_ref().unwrap().to_markdown(),
            "| name | qty |\n| apple | 3 |\n| pear | 4 |"
        );
    }

    #[test]
    fn close_lines_join_into_paragraphs() {
        let lines = vec![
            ("First line".to_string(), BoundingBox::new(10.0, 10.0, 200.0, 20.0)),
            ("second line".to_string(), BoundingBox::new(10.0, 22.0, 180.0, 32.0)),
            ("New paragraph".to_string(), BoundingBox::new(10.0, 60.0, 150.0, 70.0)),
        ];
        let paras = group_paragraphs(lines);
        assert_eq!(paras.len(), 2);
        assert_eq!(paras[0].0, "First line\nsecond line");
        assert_eq!(paras[0].1, BoundingBox::new(10.0, 10.0, 200.0, 32.0));
        assert_eq!(paras[1].0, "New paragraph");
    }

    #[test]
    fn reading_order_is_top_down_then_left_right() {
        let mut els = vec![
            RawElement::text("c", Some(BoundingBox::new(0.0, 50.0, 1.0, 60.0))),
            RawElement::text("b", Some(BoundingBox::new(300.0, 10.0, 400.0, 20.0))),
            RawElement::text("a", Some(BoundingBox::new(0.0, 10.0, 100.0, 20.0))),
            RawElement::text("z", None),
        ];
        sort_reading_order(&mut els);
        let order: Vec<&str> = els.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "z"]);
    }

    #[tokio::test]
    async fn image_source_is_one_full_page_figure() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("p.png");
        image::DynamicImage::new_rgb8(40, 30).save(&img).unwrap();
        let input = PageInput {
            source: &img,
            kind: SourceKind::Image,
            page_index: 0,
            page_image: &img,
            crop_dir: dir.path(),
        };
        let els = DefaultStructuralExtractor::default().extract(&input).await.unwrap();
        assert_eq!(els.len(), 1);
        assert_eq!(els[0].kind, ElementKind::Image);
        assert_eq!(els[0].bbox, Some(BoundingBox::new(0.0, 0.0, 40.0, 30.0)));
    }
}
