//! Document rendering: PDF pages and image files → normalised page images.
//!
//! ## Why a channel of capacity 1?
//!
//! `pdfium-render` keeps the open document on the thread that loaded it, and
//! a page bitmap at 150 DPI can be tens of megabytes. Rendering runs on one
//! `spawn_blocking` thread that hands each finished page over a bounded
//! channel and then blocks until the consumer takes it. At most two pages are
//! alive at once (the one being encoded and the one just rendered), and
//! dropping the [`PageStream`] stops the renderer at the next page boundary.
//!
//! ## Resize policy
//!
//! Small targets (≤ 640 px) are downscaled to fit and never upscaled; the
//! small modes would waste visual tokens on padding. Larger targets are
//! aspect-fitted and centred on a white square canvas so grounding boxes
//! have a consistent coordinate frame.

use crate::error::OcrError;
use crate::modes::ModeId;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// Render DPI used when rasterising PDF pages.
pub const DEFAULT_DPI: u32 = 150;

/// Targets at or below this size are fitted without padding.
pub const PAD_THRESHOLD_PX: u32 = 640;

const PAD_FILL: Rgb<u8> = Rgb([255, 255, 255]);

/// Estimated text tokens per PDF page.
const TOKENS_PER_PAGE: usize = 500;
/// Estimated text tokens per MB of an unreadable PDF.
const TOKENS_PER_MB: f64 = 200.0;
/// Pixels per estimated text token for images.
const PIXELS_PER_TOKEN: u64 = 5000;
/// Estimate for an image whose header cannot be read.
const UNREADABLE_IMAGE_TOKENS: usize = 500;
/// PDF rasters never exceed this multiple of the target resolution per side.
const MAX_RASTER_FACTOR: u32 = 3;

/// One rendered page, owned by whoever holds it.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based page index within the document.
    pub index: usize,
    pub image: DynamicImage,
}

impl PageImage {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

/// Lazy sequence of rendered pages.
///
/// Finite and not restartable; call the renderer again for a fresh pass.
#[derive(Debug)]
pub struct PageStream {
    rx: mpsc::Receiver<Result<PageImage, OcrError>>,
}

impl PageStream {
    /// Wait for the next page from an async context.
    pub async fn next_page(&mut self) -> Option<Result<PageImage, OcrError>> {
        self.rx.recv().await
    }
}

impl Stream for PageStream {
    type Item = Result<PageImage, OcrError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Renders documents at a fixed DPI.
#[derive(Debug, Clone, Copy)]
pub struct DocumentRenderer {
    dpi: u32,
}

impl Default for DocumentRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_DPI)
    }
}

impl DocumentRenderer {
    pub fn new(dpi: u32) -> Self {
        Self { dpi }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Stream the pages of a PDF, each resized to `target` px.
    ///
    /// Must be called from within a Tokio runtime. Open and render failures
    /// arrive as `Err(OcrError::Render)` items on the stream.
    pub fn render_pdf(
        &self,
        path: &Path,
        max_pages: Option<usize>,
        target: u32,
    ) -> Result<PageStream, OcrError> {
        ensure_exists(path)?;
        let (tx, rx) = mpsc::channel(1);
        let path = path.to_path_buf();
        let dpi = self.dpi;

        tokio::task::spawn_blocking(move || {
            if let Err(e) = render_pdf_blocking(&path, dpi, max_pages, target, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(PageStream { rx })
    }

    /// Render a single image file resized to `target` px.
    pub fn render_image(&self, path: &Path, target: u32) -> Result<PageImage, OcrError> {
        ensure_exists(path)?;
        let img = image::open(path).map_err(|e| render_error(path, e))?;
        let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
        let resized = resize_to_target(rgb, target);
        info!(
            "Rendered image: {} -> {}x{}",
            file_name(path),
            resized.width(),
            resized.height()
        );
        Ok(PageImage {
            index: 0,
            image: resized,
        })
    }

    /// Stream any supported document: PDFs page by page, images as one page.
    pub fn render_document(
        &self,
        path: &Path,
        max_pages: Option<usize>,
        target: u32,
    ) -> Result<PageStream, OcrError> {
        ensure_exists(path)?;
        if is_pdf(path) {
            return self.render_pdf(path, max_pages, target);
        }

        let (tx, rx) = mpsc::channel(1);
        let path = path.to_path_buf();
        let renderer = *self;
        tokio::task::spawn_blocking(move || {
            let _ = tx.blocking_send(renderer.render_image(&path, target));
        });
        Ok(PageStream { rx })
    }

    /// Number of pages `render_document` will yield, honouring `max_pages`.
    pub fn page_count(&self, path: &Path, max_pages: Option<usize>) -> Result<usize, OcrError> {
        ensure_exists(path)?;
        let total = if is_pdf(path) {
            count_pdf_pages(path).map_err(|e| render_error(path, format!("{:?}", e)))?
        } else {
            1
        };
        Ok(max_pages.map_or(total, |m| m.min(total)))
    }

    /// Approximate text-token count from structural signals only.
    ///
    /// Never touches the model: used to pick a mode before any accelerator
    /// memory is committed.
    pub fn estimate_complexity(&self, path: &Path) -> Result<usize, OcrError> {
        ensure_exists(path)?;
        let size_mb = std::fs::metadata(path)
            .map(|m| m.len() as f64 / 1e6)
            .unwrap_or(0.0);

        let estimated = if is_pdf(path) {
            match count_pdf_pages(path) {
                Ok(pages) => pages * TOKENS_PER_PAGE,
                Err(e) => {
                    debug!("Page count unavailable ({:?}), estimating from size", e);
                    (size_mb * TOKENS_PER_MB) as usize
                }
            }
        } else {
            match image::image_dimensions(path) {
                Ok((w, h)) => ((w as u64 * h as u64) / PIXELS_PER_TOKEN) as usize,
                Err(_) => UNREADABLE_IMAGE_TOKENS,
            }
        };

        debug!(
            "Estimated complexity for {}: {} tokens",
            file_name(path),
            estimated
        );
        Ok(estimated)
    }
}

/// Target resolution for a mode name; unknown names fall back to 640.
pub fn resolution_for_mode(mode: &str) -> u32 {
    mode.parse::<ModeId>()
        .map(|m| m.config().resolution)
        .unwrap_or(PAD_THRESHOLD_PX)
}

/// Apply the two-strategy resize policy for a square `target`.
pub fn resize_to_target(image: DynamicImage, target: u32) -> DynamicImage {
    let (w, h) = (image.width(), image.height());
    if w == 0 || h == 0 {
        return image;
    }

    if target <= PAD_THRESHOLD_PX {
        if w > target || h > target {
            return image.resize(target, target, FilterType::Lanczos3);
        }
        return image;
    }

    let ratio = f64::min(target as f64 / w as f64, target as f64 / h as f64);
    let new_w = ((w as f64 * ratio) as u32).clamp(1, target);
    let new_h = ((h as f64 * ratio) as u32).clamp(1, target);
    let fitted = image.resize_exact(new_w, new_h, FilterType::Lanczos3).to_rgb8();

    let mut canvas = RgbImage::from_pixel(target, target, PAD_FILL);
    let x = (target - new_w) / 2;
    let y = (target - new_h) / 2;
    imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
    DynamicImage::ImageRgb8(canvas)
}

/// True when the path has a `.pdf` extension or starts with `%PDF`.
pub fn is_pdf(path: &Path) -> bool {
    if path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
    {
        return true;
    }
    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == b"%PDF")
        .unwrap_or(false)
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then the working directory, then the system.
pub(crate) fn bind_pdfium() -> Result<Pdfium, PdfiumError> {
    if let Ok(lib) = std::env::var("PDFIUM_LIB_PATH") {
        return Pdfium::bind_to_library(lib).map(Pdfium::new);
    }
    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
}

fn raster_cap(target: u32) -> Pixels {
    let cap = target.saturating_mul(MAX_RASTER_FACTOR).max(1);
    Pixels::try_from(cap).unwrap_or(Pixels::MAX)
}

/// Render at `dpi`, but bound each side so huge page boxes stay near `target`.
fn pdf_render_config(dpi: u32, target: u32) -> PdfRenderConfig {
    let cap = raster_cap(target);
    PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(cap)
        .set_maximum_height(cap)
}

fn count_pdf_pages(path: &Path) -> Result<usize, PdfiumError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium.load_pdf_from_file(path, None)?;
    let pages = document.pages().len() as usize;
    Ok(pages)
}

fn render_pdf_blocking(
    path: &Path,
    dpi: u32,
    max_pages: Option<usize>,
    target: u32,
    tx: &mpsc::Sender<Result<PageImage, OcrError>>,
) -> Result<(), OcrError> {
    let pdfium = bind_pdfium().map_err(|e| render_error(path, format!("{:?}", e)))?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| render_error(path, format!("{:?}", e)))?;

    let pages = document.pages();
    let total = pages.len() as usize;
    let to_render = max_pages.map_or(total, |m| m.min(total));
    info!(
        "Rendering PDF: {} ({}/{} pages)",
        file_name(path),
        to_render,
        total
    );

    let render_config = pdf_render_config(dpi, target);

    for index in 0..to_render {
        let page = pages
            .get(index as u16)
            .map_err(|e| render_error(path, format!("page {}: {:?}", index + 1, e)))?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| render_error(path, format!("page {}: {:?}", index + 1, e)))?;

        let image = resize_to_target(DynamicImage::ImageRgb8(bitmap.as_image().to_rgb8()), target);
        debug!(
            "Rendered page {} → {}x{} px",
            index + 1,
            image.width(),
            image.height()
        );

        if tx.blocking_send(Ok(PageImage { index, image })).is_err() {
            warn!("Page consumer went away after page {}, stopping render", index + 1);
            return Ok(());
        }
    }

    info!("Completed rendering {} pages", to_render);
    Ok(())
}

fn ensure_exists(path: &Path) -> Result<(), OcrError> {
    if path.exists() {
        Ok(())
    } else {
        Err(OcrError::FileNotFound {
            path: path.to_path_buf(),
        })
    }
}

fn render_error(path: &Path, detail: impl ToString) -> OcrError {
    OcrError::Render {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
