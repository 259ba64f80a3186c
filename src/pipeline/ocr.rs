//! OCR: produce a searchable copy of a scanned PDF.
//!
//! The default engine shells out to `ocrmypdf`. `--skip-text` leaves pages
//! that already carry a text layer untouched, so running it on a born-digital
//! PDF is cheap.

use crate::error::DocParseError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// OCR `source` into `out_dir`, returning the searchable output path.
    async fn ocr(&self, source: &Path, out_dir: &Path) -> Result<PathBuf, DocParseError>;
}

#[derive(Debug, Clone)]
pub struct OcrmypdfEngine {
    pub program: String,
    /// Tesseract language codes, e.g. `eng+deu`.
    pub language: String,
}

impl Default for OcrmypdfEngine {
    fn default() -> Self {
        Self {
            program: "ocrmypdf".to_string(),
            language: "eng".to_string(),
        }
    }
}

impl OcrmypdfEngine {
    pub fn output_path(source: &Path, out_dir: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        out_dir.join(format!("{}.ocr.pdf", stem))
    }
}

#[async_trait]
impl OcrEngine for OcrmypdfEngine {
    async fn ocr(&self, source: &Path, out_dir: &Path) -> Result<PathBuf, DocParseError> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| DocParseError::io(out_dir, e))?;
        let target = Self::output_path(source, out_dir);

        info!("Running {} on {}", self.program, source.display());
        let output = Command::new(&self.program)
            .arg("--skip-text")
            .arg("-l")
            .arg(&self.language)
            .arg(source)
            .arg(&target)
            .output()
            .await
            .map_err(|e| DocParseError::OcrFailed {
                path: source.to_path_buf(),
                detail: format!("could not start '{}': {}", self.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DocParseError::OcrFailed {
                path: source.to_path_buf(),
                detail: format!("{} ({})", stderr.trim(), output.status),
            });
        }
        debug!("OCR output → {}", target.display());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_named_after_source() {
        assert_eq!(
            OcrmypdfEngine::output_path(Path::new("/in/report.pdf"), Path::new("/w")),
            PathBuf::from("/w/report.ocr.pdf")
        );
    }

    #[tokio::test]
    async fn missing_program_is_ocr_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = OcrmypdfEngine {
            program: "docparse-no-such-ocr-binary".into(),
            ..Default::default()
        };
        let err = engine
            .ocr(Path::new("in.pdf"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DocParseError::OcrFailed { .. }));
    }
}
