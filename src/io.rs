use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageEncoder, RgbImage, RgbaImage};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::canvas::{ImageStore, Layer, Page};
use crate::compositor;
use crate::ops::text::{FontLookup, draw_text_box};
use crate::session::EditorSession;
use crate::textbox::{DEFAULT_FONT_NAME, TextBox};

/// Version written into project and autosave documents.
pub const PROJECT_VERSION: u32 = 3;

/// Returns the platform-specific directory used for auto-save files.
///
/// `%APPDATA%\SlideFE\autosave\`       (Windows)
/// `~/.local/share/SlideFE/autosave/`  (Linux)
/// `~/Library/Application Support/SlideFE/autosave/`  (macOS)
pub fn autosave_dir() -> PathBuf {
    crate::logger::data_dir().join("SlideFE").join("autosave")
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Image(image::ImageError),
    InvalidFormat(String),
    NoPages,
}

impl std::fmt::Display for ProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {}", e),
            ProjectError::Json(e) => write!(f, "Malformed project file: {}", e),
            ProjectError::Image(e) => write!(f, "Image error: {}", e),
            ProjectError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
            ProjectError::NoPages => write!(f, "Project contains no loadable pages"),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Json(e)
    }
}

impl From<image::ImageError> for ProjectError {
    fn from(e: image::ImageError) -> Self {
        ProjectError::Image(e)
    }
}

// ============================================================================
// PROJECT DOCUMENT
// ============================================================================

#[derive(Serialize)]
struct ProjectOut {
    version: u32,
    pages: Vec<PageOut>,
    current_page: usize,
}

#[derive(Serialize)]
struct PageOut {
    original_path: PathBuf,
    original_size: (u32, u32),
    edit_scale: f32,
    bg_path: Option<PathBuf>,
    bg_original_path: Option<PathBuf>,
    text_boxes: Vec<TextBox>,
    layers: Vec<Layer>,
}

#[derive(Deserialize)]
struct ProjectIn {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    pages: Vec<PageIn>,
    #[serde(default)]
    current_page: usize,
}

/// Lists are kept as raw values so one bad entry does not sink the page.
#[derive(Deserialize)]
struct PageIn {
    original_path: PathBuf,
    #[serde(default)]
    original_size: Option<(u32, u32)>,
    #[serde(default)]
    bg_path: Option<PathBuf>,
    #[serde(default)]
    bg_original_path: Option<PathBuf>,
    #[serde(default)]
    text_boxes: Vec<serde_json::Value>,
    #[serde(default)]
    layers: Vec<serde_json::Value>,
}

/// Pages read back from a project file.
#[derive(Debug)]
pub struct LoadedProject {
    pub pages: Vec<Page>,
    pub current_page: usize,
    /// Pages that were listed but could not be loaded
    pub skipped: usize,
}

/// Build the document for `pages`. Pages without a backing file (blank pages)
/// have their base image written into `assets_dir` and refer to that copy.
fn build_document(pages: &[Page], current_page: usize, assets_dir: &Path) -> Result<ProjectOut, ProjectError> {
    let mut out = Vec::with_capacity(pages.len());
    for page in pages {
        let original_path = if page.original_path.as_os_str().is_empty() {
            fs::create_dir_all(assets_dir)?;
            let path = assets_dir.join(format!("page_{}.png", page.id.simple()));
            page.base.save(&path)?;
            path
        } else {
            page.original_path.clone()
        };
        out.push(PageOut {
            original_path,
            original_size: page.original_size,
            edit_scale: page.edit_scale,
            bg_path: page.bg_path.clone(),
            bg_original_path: page.bg_original_path.clone(),
            text_boxes: page.text_boxes.clone(),
            layers: page.layers.clone(),
        });
    }
    Ok(ProjectOut { version: PROJECT_VERSION, pages: out, current_page })
}

fn write_json(doc: &ProjectOut, path: &Path) -> Result<(), ProjectError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(writer, doc)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write the session as a version-3 project. Blank pages get their base
/// image stored in `<project stem>_pages/` beside the project file and are
/// re-pointed at it.
pub fn save_project(session: &mut EditorSession, path: &Path) -> Result<(), ProjectError> {
    session.save_current_page();
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "project".into());
    let assets = path.with_file_name(format!("{}_pages", stem));
    let doc = build_document(&session.pages, session.current_page_index, &assets)?;
    write_json(&doc, path)?;
    for (page, saved) in session.pages.iter_mut().zip(&doc.pages) {
        page.original_path = saved.original_path.clone();
    }
    crate::log_info!("saved project {} ({} pages)", path.display(), doc.pages.len());
    Ok(())
}

/// Decode an image and shrink it so its longest edge is at most `max_edge`.
/// Returns the working image and the scale applied (1.0 when untouched).
pub fn load_page_image(path: &Path, max_edge: u32) -> Result<(RgbaImage, f32), ProjectError> {
    let img = image::open(path)?.to_rgba8();
    let (w, h) = img.dimensions();
    let longest = w.max(h);
    if max_edge == 0 || longest <= max_edge {
        return Ok((img, 1.0));
    }
    let scale = max_edge as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    Ok((imageops::resize(&img, nw, nh, FilterType::Lanczos3), scale))
}

/// A new page backed by an image file.
pub fn page_from_image(path: &Path, max_edge: u32) -> Result<Page, ProjectError> {
    let (base, scale) = load_page_image(path, max_edge)?;
    let original = ((base.width() as f32 / scale).round() as u32, (base.height() as f32 / scale).round() as u32);
    Ok(Page::new(path, base, original, scale))
}

fn resolve(dir: &Path, p: &Path) -> PathBuf {
    if p.is_relative() && !p.as_os_str().is_empty() { dir.join(p) } else { p.to_path_buf() }
}

/// Read a project (or autosave) document. Relative paths are taken relative
/// to the document's folder. Pages whose image is missing are skipped with a
/// warning; text boxes and layers that do not parse are dropped.
pub fn load_project(path: &Path, max_edge: u32) -> Result<LoadedProject, ProjectError> {
    let reader = BufReader::new(File::open(path)?);
    let value: serde_json::Value = serde_json::from_reader(reader)?;
    if !value.is_object() {
        return Err(ProjectError::InvalidFormat("expected a JSON object".into()));
    }
    let doc: ProjectIn = serde_json::from_value(value)?;
    match doc.version {
        Some(v) if v > PROJECT_VERSION => {
            crate::log_warn!("project version {} is newer than {}; loading what is understood", v, PROJECT_VERSION)
        }
        None => crate::log_warn!("project has no version field"),
        _ => {}
    }
    let dir = path.parent().unwrap_or(Path::new(""));

    let listed = doc.pages.len();
    let mut pages = Vec::with_capacity(listed);
    for (i, record) in doc.pages.into_iter().enumerate() {
        let original = resolve(dir, &record.original_path);
        let (base, scale) = match load_page_image(&original, max_edge) {
            Ok(loaded) => loaded,
            Err(e) => {
                crate::log_warn!("page {}: skipping {}: {}", i + 1, original.display(), e);
                continue;
            }
        };
        let original_size = record.original_size.unwrap_or((
            (base.width() as f32 / scale).round() as u32,
            (base.height() as f32 / scale).round() as u32,
        ));
        let mut page = Page::new(original, base, original_size, scale);
        page.bg_path = record.bg_path.map(|p| resolve(dir, &p));
        page.bg_original_path = record.bg_original_path;
        page.text_boxes = record
            .text_boxes
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<TextBox>(v) {
                Ok(tb) => Some(tb),
                Err(e) => {
                    crate::log_err!("page {}: dropping text box: {}", i + 1, e);
                    None
                }
            })
            .collect();
        page.layers = record
            .layers
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<Layer>(v) {
                Ok(mut layer) => {
                    layer.path = resolve(dir, &layer.path);
                    Some(layer)
                }
                Err(e) => {
                    crate::log_warn!("page {}: dropping layer: {}", i + 1, e);
                    None
                }
            })
            .collect();
        pages.push(page);
    }

    if pages.is_empty() {
        return Err(ProjectError::NoPages);
    }
    let current_page = doc.current_page.min(pages.len() - 1);
    let skipped = listed - pages.len();
    crate::log_info!("loaded {} ({} pages, {} skipped)", path.display(), pages.len(), skipped);
    Ok(LoadedProject { pages, current_page, skipped })
}

// ============================================================================
// AUTOSAVE
// ============================================================================

/// Write `autosave_<millis>.json` into `dir` and keep only the `keep` newest.
/// Blank pages are stored under `dir/pages/`.
pub fn write_autosave(session: &mut EditorSession, dir: &Path, keep: usize) -> Result<PathBuf, ProjectError> {
    session.save_current_page();
    let doc = build_document(&session.pages, session.current_page_index, &dir.join("pages"))?;
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    let path = dir.join(format!("autosave_{:013}.json", millis));
    write_json(&doc, &path)?;
    prune_autosaves(dir, keep.max(1));
    crate::log_info!("autosaved to {}", path.display());
    Ok(path)
}

/// Autosave files in `dir`, oldest first.
pub fn list_autosaves(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("autosave_*.json");
    let mut files: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            crate::log_warn!("autosave: bad pattern {}: {}", pattern.display(), e);
            Vec::new()
        }
    };
    files.sort();
    files
}

pub fn latest_autosave(dir: &Path) -> Option<PathBuf> {
    list_autosaves(dir).pop()
}

fn prune_autosaves(dir: &Path, keep: usize) {
    let files = list_autosaves(dir);
    let excess = files.len().saturating_sub(keep);
    for old in &files[..excess] {
        if let Err(e) = fs::remove_file(old) {
            crate::log_warn!("autosave: could not remove {}: {}", old.display(), e);
        }
    }
}

// ============================================================================
// IMAGE EXPORT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Png,
    Jpeg,
    Webp,
    Bmp,
}

impl ExportFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "png" => Some(ExportFormat::Png),
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg),
            "webp" => Some(ExportFormat::Webp),
            "bmp" => Some(ExportFormat::Bmp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Webp => "webp",
            ExportFormat::Bmp => "bmp",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// JPEG quality, 1-100
    pub quality: u8,
    pub include_text: bool,
    /// Zero-based page indices; `None` exports every page
    pub pages: Option<Vec<usize>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { format: ExportFormat::Png, quality: 95, include_text: true, pages: None }
    }
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub written: Vec<PathBuf>,
    /// `(page index, reason)`
    pub failed: Vec<(usize, String)>,
}

impl ExportReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Composite a page and draw its text boxes on top. The result is opaque;
/// a transparent base never leaks an alpha channel into exported files.
pub fn render_page(page: &Page, store: &dyn ImageStore, fonts: &dyn FontLookup, include_text: bool) -> RgbImage {
    let flat = compositor::composite(page, store);
    let boxes: Vec<&TextBox> = page.text_boxes.iter().filter(|tb| !tb.text.trim().is_empty()).collect();
    if !include_text || boxes.is_empty() {
        return flat;
    }
    let mut canvas = DynamicImage::ImageRgb8(flat).to_rgba8();
    for tb in boxes {
        let font = fonts
            .font(&tb.font_name, tb.bold, tb.italic)
            .or_else(|| fonts.font(DEFAULT_FONT_NAME, tb.bold, tb.italic));
        match font {
            Some(font) => draw_text_box(&mut canvas, tb, &font),
            None => crate::log_warn!("export: no font for '{}', text skipped", tb.font_name),
        }
    }
    compositor::flatten(canvas)
}

/// Encode and write an RGB image to a file.
pub fn encode_and_write(image: &RgbImage, path: &Path, format: ExportFormat, quality: u8) -> Result<(), ProjectError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let (w, h) = image.dimensions();

    match format {
        ExportFormat::Png => {
            PngEncoder::new(&mut writer).write_image(image.as_raw(), w, h, image::ColorType::Rgb8)?;
        }
        ExportFormat::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
            encoder.encode(image.as_raw(), w, h, image::ColorType::Rgb8)?;
        }
        ExportFormat::Webp => {
            drop(writer);
            DynamicImage::ImageRgb8(image.clone()).save_with_format(path, image::ImageFormat::WebP)?;
        }
        ExportFormat::Bmp => {
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(image.as_raw(), w, h, image::ColorType::Rgb8)?;
        }
    }
    Ok(())
}

/// Export pages as `page_NNN.<ext>` into `dir`. Pages are rendered in
/// parallel; a failing page is reported and the rest still export.
pub fn export_page_images(
    pages: &[Page],
    store: &(dyn ImageStore + Sync),
    dir: &Path,
    options: &ExportOptions,
    fonts: &(dyn FontLookup + Sync),
) -> Result<ExportReport, ProjectError> {
    fs::create_dir_all(dir)?;
    let selected: Vec<usize> = match &options.pages {
        Some(list) => list.clone(),
        None => (0..pages.len()).collect(),
    };

    let results: Vec<(usize, Result<PathBuf, String>)> = selected
        .par_iter()
        .map(|&index| {
            let Some(page) = pages.get(index) else {
                return (index, Err(format!("no page {}", index + 1)));
            };
            let image = render_page(page, store, fonts, options.include_text);
            let path = dir.join(format!("page_{:03}.{}", index + 1, options.format.extension()));
            let written = encode_and_write(&image, &path, options.format, options.quality)
                .map(|_| path)
                .map_err(|e| e.to_string());
            (index, written)
        })
        .collect();

    let mut report = ExportReport::default();
    for (index, result) in results {
        match result {
            Ok(path) => report.written.push(path),
            Err(e) => {
                crate::log_err!("export: page {} failed: {}", index + 1, e);
                report.failed.push((index, e));
            }
        }
    }
    Ok(report)
}
