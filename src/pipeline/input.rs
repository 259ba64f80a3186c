//! Source intake: validate the path and classify the source kind.
//!
//! The kind decides two things outside the pipeline proper: which pipeline
//! configuration the caller picks ([`crate::pipeline::PipelineKind::for_source`])
//! and how the default rasteriser and extractor read the file. Magic bytes
//! win over the extension, so a mislabelled PDF is still read as a PDF.

use crate::error::DocParseError;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Broad family of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pdf,
    Image,
    Spreadsheet,
}

/// Spreadsheet container format, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetFormat {
    Csv,
    Tsv,
    /// xlsx / xlsm / xls / ods, read through calamine.
    Workbook,
}

const SHEET_EXTENSIONS: &[&str] = &["csv", "tsv", "xlsx", "xlsm", "xls", "ods"];

/// A validated, classified source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub path: PathBuf,
    pub kind: SourceKind,
}

/// Validate that `path` exists and is readable, then classify it.
pub fn resolve_source(path: impl AsRef<Path>) -> Result<ResolvedSource, DocParseError> {
    let path = path.as_ref().to_path_buf();
    if !path.exists() {
        return Err(DocParseError::FileNotFound { path });
    }

    let mut magic = [0u8; 16];
    let read = match std::fs::File::open(&path) {
        Ok(mut f) => f.read(&mut magic).unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(DocParseError::PermissionDenied { path });
        }
        Err(_) => return Err(DocParseError::FileNotFound { path }),
    };

    let kind = classify(&path, &magic[..read])?;
    debug!("Resolved {} as {:?}", path.display(), kind);
    Ok(ResolvedSource { path, kind })
}

/// Classify without touching the filesystem beyond what the caller read.
pub fn classify(path: &Path, head: &[u8]) -> Result<SourceKind, DocParseError> {
    if head.starts_with(b"%PDF") {
        return Ok(SourceKind::Pdf);
    }
    if sheet_format(path).is_some() {
        return Ok(SourceKind::Spreadsheet);
    }
    if image::guess_format(head).is_ok() || image::ImageFormat::from_path(path).is_ok() {
        return Ok(SourceKind::Image);
    }
    if extension(path).as_deref() == Some("pdf") {
        return Err(DocParseError::CorruptSource {
            path: path.to_path_buf(),
            detail: format!("missing %PDF header, first bytes {:?}", &head[..head.len().min(4)]),
        });
    }
    Err(DocParseError::UnsupportedSource {
        path: path.to_path_buf(),
        detail: "expected a PDF, a raster image, or a csv/tsv/xlsx/xls/ods spreadsheet".into(),
    })
}

/// Re-read and classify a path; used by adapters that only get a path.
pub fn detect_kind(path: &Path) -> Result<SourceKind, DocParseError> {
    resolve_source(path).map(|r| r.kind)
}

pub fn sheet_format(path: &Path) -> Option<SheetFormat> {
    let ext = extension(path)?;
    if !SHEET_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    Some(match ext.as_str() {
        "csv" => SheetFormat::Csv,
        "tsv" => SheetFormat::Tsv,
        _ => SheetFormat::Workbook,
    })
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
