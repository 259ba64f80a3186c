//! Export of a processed [`DocumentContext`].
//!
//! Two artefacts per document: a JSON record (source, per-page records,
//! timings) and a markdown file with pages joined by the configured
//! separator. Both are written atomically (temp file, then rename) so a
//! crashed run never leaves a half-written file behind.

use crate::config::PageSeparator;
use crate::context::{DocumentContext, Element, Status};
use crate::error::{DocParseError, PageError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Serialisable view of one page.
#[derive(Debug, Clone, Serialize)]
pub struct PageExport {
    pub index: usize,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
    pub image: PathBuf,
    pub text: String,
    pub markdown: String,
    pub elements: Vec<Element>,
}

/// The JSON document written by [`export_to_dir`].
#[derive(Debug, Clone, Serialize)]
pub struct DocumentExport {
    pub source: PathBuf,
    pub ocr_source: Option<PathBuf>,
    pub pipeline: String,
    pub processing_time_ms: u64,
    pub stage_timings: BTreeMap<String, u64>,
    pub failed_pages: usize,
    pub pages: Vec<PageExport>,
}

impl DocumentExport {
    pub fn from_context(ctx: &DocumentContext, pipeline: &str) -> Self {
        Self {
            source: ctx.source.clone(),
            ocr_source: ctx.ocr_source.clone(),
            pipeline: pipeline.to_string(),
            processing_time_ms: ctx.processing_time_ms,
            stage_timings: ctx.stage_timings.clone(),
            failed_pages: ctx.failed_pages(),
            pages: ctx
                .pages
                .iter()
                .map(|p| PageExport {
                    index: p.index,
                    status: p.status(),
                    error: p.error().cloned(),
                    image: p.image.clone(),
                    text: p.text.clone(),
                    markdown: p.markdown.clone(),
                    elements: p.elements.clone(),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, DocParseError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DocParseError::Internal(format!("JSON export failed: {}", e)))
    }
}

/// Join page markdown with `separator` between consecutive pages.
pub fn render_markdown(ctx: &DocumentContext, separator: &PageSeparator) -> String {
    let mut out = String::new();
    for (i, page) in ctx.pages.iter().enumerate() {
        if i > 0 {
            out.push_str(&separator.render(page.index + 1));
        }
        out.push_str(page.markdown.trim());
    }
    out.push('\n');
    out
}

/// Paths written by [`export_to_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// Write `<stem>.json` and `<stem>.md` into `dir`.
pub async fn export_to_dir(
    ctx: &DocumentContext,
    pipeline: &str,
    separator: &PageSeparator,
    dir: impl AsRef<Path>,
    stem: &str,
) -> Result<ExportPaths, DocParseError> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DocParseError::OutputWriteFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let paths = ExportPaths {
        json: dir.join(format!("{}.json", stem)),
        markdown: dir.join(format!("{}.md", stem)),
    };
    let json = DocumentExport::from_context(ctx, pipeline).to_json()?;
    write_atomic(&paths.json, json.as_bytes()).await?;
    write_atomic(&paths.markdown, render_markdown(ctx, separator).as_bytes()).await?;

    info!(
        "Exported {} pages → {}, {}",
        ctx.pages.len(),
        paths.json.display(),
        paths.markdown.display()
    );
    Ok(paths)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DocParseError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| DocParseError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| DocParseError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Page;

    fn two_pages() -> DocumentContext {
        let mut ctx = DocumentContext::new("doc.pdf", "/tmp/w");
        for (i, md) in ["# One\n", "Two"].iter().enumerate() {
            let mut p = Page::new(i, format!("p{i}.png"));
            p.markdown = md.to_string();
            ctx.pages.push(p);
        }
        ctx.pages[1].mark_failed(PageError::FormatterTruncated {
            page: 1,
            max_new_tokens: 8,
        });
        ctx
    }

    #[test]
    fn markdown_has_one_separator_between_pages() {
        let md = render_markdown(&two_pages(), &PageSeparator::HorizontalRule);
        assert_eq!(md, "# One\n\n---\n\nTwo\n");
        let md = render_markdown(&two_pages(), &PageSeparator::Comment);
        assert!(md.contains("<!-- page 2 -->"));
    }

    #[test]
    fn json_carries_page_status_and_error() {
        let export = DocumentExport::from_context(&two_pages(), "full");
        let v: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(v["pipeline"], "full");
        assert_eq!(v["failed_pages"], 1);
        assert_eq!(v["pages"][0]["status"], "success");
        assert!(v["pages"][0].get("error").is_none());
        assert_eq!(v["pages"][1]["status"], "failed");
        assert_eq!(v["pages"][1]["error"]["kind"], "formatter_truncated");
    }

    #[tokio::test]
    async fn export_writes_both_files_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = export_to_dir(
            &two_pages(),
            "full",
            &PageSeparator::default(),
            dir.path(),
            "doc",
        )
        .await
        .unwrap();
        assert!(paths.json.exists());
        assert!(paths.markdown.exists());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 2);
    }
}
