//! Rasterisation: turn a source document into ordered page images on disk.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and must not run on Tokio worker threads. Rendering and PNG
//! encoding are moved onto the blocking pool.
//!
//! ## Why cap pixels, not DPI?
//!
//! An A0 poster at 150 DPI is roughly 12,000 × 17,000 px. The longest edge
//! is capped at `max_rendered_pixels` regardless of physical size, which
//! keeps memory bounded and matches what vision models accept.

use crate::context::Page;
use crate::error::DocParseError;
use crate::pipeline::encode::fit_longest_side;
use crate::pipeline::input::SourceKind;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source → ordered pages. A failure on the whole source is fatal.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn rasterize(
        &self,
        source: &Path,
        kind: SourceKind,
        out_dir: &Path,
    ) -> Result<Vec<Page>, DocParseError>;
}

/// pdfium for PDFs, `image` for rasters, pass-through for spreadsheets.
#[derive(Debug, Clone)]
pub struct DefaultRasterizer {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    pub password: Option<String>,
}

impl DefaultRasterizer {
    pub fn new(dpi: u32, max_rendered_pixels: u32, password: Option<String>) -> Self {
        Self {
            dpi,
            max_rendered_pixels,
            password,
        }
    }
}

impl Default for DefaultRasterizer {
    fn default() -> Self {
        Self::new(150, 1440, None)
    }
}

#[async_trait]
impl Rasterizer for DefaultRasterizer {
    async fn rasterize(
        &self,
        source: &Path,
        kind: SourceKind,
        out_dir: &Path,
    ) -> Result<Vec<Page>, DocParseError> {
        std::fs::create_dir_all(out_dir).map_err(|e| DocParseError::io(out_dir, e))?;

        let pages = match kind {
            // The sheet itself is the page; there is nothing to render.
            SourceKind::Spreadsheet => vec![Page::new(0, source)],
            SourceKind::Image => {
                let (src, out, max) = (
                    source.to_path_buf(),
                    out_dir.to_path_buf(),
                    self.max_rendered_pixels,
                );
                tokio::task::spawn_blocking(move || normalise_image(&src, &out, max))
                    .await
                    .map_err(|e| DocParseError::Internal(format!("Render task panicked: {}", e)))??
            }
            SourceKind::Pdf => {
                let (src, out, dpi, max, pwd) = (
                    source.to_path_buf(),
                    out_dir.to_path_buf(),
                    self.dpi,
                    self.max_rendered_pixels,
                    self.password.clone(),
                );
                tokio::task::spawn_blocking(move || {
                    render_pdf_blocking(&src, &out, dpi, max, pwd.as_deref())
                })
                    .await
                    .map_err(|e| DocParseError::Internal(format!("Render task panicked: {}", e)))??
            }
        };

        if pages.is_empty() {
            return Err(DocParseError::RasterisationFailed {
                path: source.to_path_buf(),
                detail: "source has no pages".into(),
            });
        }
        info!("Rasterised {} → {} pages", source.display(), pages.len());
        Ok(pages)
    }
}

pub fn page_image_path(out_dir: &Path, index: usize) -> PathBuf {
    out_dir.join(format!("page_{:04}.png", index))
}

fn normalise_image(source: &Path, out_dir: &Path, max_pixels: u32) -> Result<Vec<Page>, DocParseError> {
    let img = image::open(source).map_err(|e| DocParseError::CorruptSource {
        path: source.to_path_buf(),
        detail: e.to_string(),
    })?;
    let img = fit_longest_side(&img, max_pixels);
    let target = page_image_path(out_dir, 0);
    img.save(&target)
        .map_err(|e| DocParseError::RasterisationFailed {
            path: source.to_path_buf(),
            detail: e.to_string(),
        })?;
    debug!("Normalised image → {}x{} px", img.width(), img.height());
    Ok(vec![Page::new(0, target)])
}

/// Bind pdfium: `PDFIUM_LIB_PATH` first, then the working directory, then
/// the system library search path.
pub(crate) fn bind_pdfium() -> Result<Pdfium, DocParseError> {
    if let Ok(path) = std::env::var("PDFIUM_LIB_PATH") {
        return Pdfium::bind_to_library(&path)
            .map(Pdfium::new)
            .map_err(|e| DocParseError::PdfiumUnavailable(format!("{path}: {e:?}")));
    }
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| DocParseError::PdfiumUnavailable(format!("{e:?}")))
}

fn render_pdf_blocking(
    source: &Path,
    out_dir: &Path,
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
) -> Result<Vec<Page>, DocParseError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium.load_pdf_from_file(source, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.to_lowercase().contains("password") {
            if password.is_some() {
                DocParseError::WrongPassword {
                    path: source.to_path_buf(),
                }
            } else {
                DocParseError::PasswordRequired {
                    path: source.to_path_buf(),
                }
            }
        } else {
            DocParseError::CorruptSource {
                path: source.to_path_buf(),
                detail: err_str,
            }
        }
    })?;

    let mut pages = Vec::new();
    for (idx, page) in document.pages().iter().enumerate() {
        // Points are 1/72 inch; the longest side never exceeds `max_pixels`.
        let target_w = ((page.width().value * dpi as f32 / 72.0) as i32).clamp(1, max_pixels as i32);
        let render_config = PdfRenderConfig::new()
            .set_target_width(target_w)
            .set_maximum_height(max_pixels as i32);
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            DocParseError::RasterisationFailed {
                path: source.to_path_buf(),
                detail: format!("page {}: {:?}", idx + 1, e),
            }
        })?;
        let image = bitmap.as_image();
        let target = page_image_path(out_dir, idx);
        image
            .save(&target)
            .map_err(|e| DocParseError::RasterisationFailed {
                path: source.to_path_buf(),
                detail: format!("page {}: {}", idx + 1, e),
            })?;
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        pages.push(Page::new(idx, target));
    }

    Ok(pages)
}
