use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::textbox::TextBox;

/// Number of decoded images the file-backed store keeps around.
const IMAGE_CACHE_CAPACITY: usize = 20;

// ============================================================================
// IMAGE STORE: resolves layer/background paths to pixels
// ============================================================================

/// Source of raster images referenced by path from pages and layers.
///
/// Lookups that fail (missing file, decode error) return `None`; callers treat
/// that as "absent" rather than as an error.
pub trait ImageStore {
    fn load_rgba(&self, path: &Path) -> Option<Arc<RgbaImage>>;

    /// Persist a generated image under `path` and make it resolvable.
    fn save_rgba(&self, path: &Path, image: RgbaImage) -> Result<Arc<RgbaImage>, String>;

    fn exists(&self, path: &Path) -> bool {
        self.load_rgba(path).is_some()
    }
}

struct CachedImage {
    modified: Option<SystemTime>,
    image: Arc<RgbaImage>,
}

/// Decodes images from disk, keeping the most recently used ones in memory.
/// Entries are keyed by path and invalidated when the file's mtime changes.
pub struct FsImageStore {
    cache: Mutex<(HashMap<PathBuf, CachedImage>, VecDeque<PathBuf>)>,
    capacity: usize,
}

impl Default for FsImageStore {
    fn default() -> Self {
        Self::new(IMAGE_CACHE_CAPACITY)
    }
}

impl FsImageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new((HashMap::new(), VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut guard) = self.cache.lock() {
            let (map, order) = &mut *guard;
            map.remove(path);
            order.retain(|p| p != path);
        }
    }

    fn decode(path: &Path) -> Option<RgbaImage> {
        match image::open(path) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                crate::log_warn!("could not decode image {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl ImageStore for FsImageStore {
    fn load_rgba(&self, path: &Path) -> Option<Arc<RgbaImage>> {
        let modified = std::fs::metadata(path).ok()?.modified().ok();
        let mut guard = self.cache.lock().ok()?;
        let (map, order) = &mut *guard;

        if let Some(hit) = map.get(path)
            && hit.modified == modified
        {
            let image = Arc::clone(&hit.image);
            order.retain(|p| p != path);
            order.push_back(path.to_path_buf());
            return Some(image);
        }

        let image = Arc::new(Self::decode(path)?);
        map.insert(path.to_path_buf(), CachedImage { modified, image: Arc::clone(&image) });
        order.retain(|p| p != path);
        order.push_back(path.to_path_buf());
        while order.len() > self.capacity {
            if let Some(old) = order.pop_front() {
                map.remove(&old);
            }
        }
        Some(image)
    }

    fn save_rgba(&self, path: &Path, image: RgbaImage) -> Result<Arc<RgbaImage>, String> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| format!("create {}: {}", parent.display(), e))?;
        }
        image.save(path).map_err(|e| format!("save {}: {}", path.display(), e))?;
        let modified = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        let image = Arc::new(image);
        if let Ok(mut guard) = self.cache.lock() {
            let (map, order) = &mut *guard;
            map.insert(path.to_path_buf(), CachedImage { modified, image: Arc::clone(&image) });
            order.retain(|p| p != path);
            order.push_back(path.to_path_buf());
            while order.len() > self.capacity {
                if let Some(old) = order.pop_front() {
                    map.remove(&old);
                }
            }
        }
        Ok(image)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// In-memory store for generated content and tests.
#[derive(Default)]
pub struct MemoryImageStore {
    images: Mutex<HashMap<PathBuf, Arc<RgbaImage>>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, image: RgbaImage) {
        if let Ok(mut map) = self.images.lock() {
            map.insert(path.into(), Arc::new(image));
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut map) = self.images.lock() {
            map.remove(path);
        }
    }
}

impl ImageStore for MemoryImageStore {
    fn load_rgba(&self, path: &Path) -> Option<Arc<RgbaImage>> {
        self.images.lock().ok()?.get(path).cloned()
    }

    fn save_rgba(&self, path: &Path, image: RgbaImage) -> Result<Arc<RgbaImage>, String> {
        let image = Arc::new(image);
        self.images
            .lock()
            .map_err(|_| "image store poisoned".to_string())?
            .insert(path.to_path_buf(), Arc::clone(&image));
        Ok(image)
    }
}

// ============================================================================
// LAYER
// ============================================================================

/// Crop rectangle in the layer's native (pre-scale) pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl CropRect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Clamp to `[0, native]` on each axis. Returns `(x0, y0, x1, y1)` or
    /// `None` when the clamped rectangle is empty.
    pub fn clamped(&self, native_w: u32, native_h: u32) -> Option<(u32, u32, u32, u32)> {
        let w = native_w as i64;
        let h = native_h as i64;
        let x0 = (self.x0 as i64).clamp(0, w);
        let y0 = (self.y0 as i64).clamp(0, h);
        let x1 = (self.x1 as i64).clamp(0, w);
        let y1 = (self.y1 as i64).clamp(0, h);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }
}

/// Returned by transform setters when the layer is locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerLocked {
    pub name: String,
}

impl std::fmt::Display for LayerLocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer '{}' is locked", self.name)
    }
}

impl std::error::Error for LayerLocked {}

/// Image overlay placed on a page. Index 0 of a page's layer list is the
/// topmost layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "LayerRecord")]
pub struct Layer {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub crop: Option<CropRect>,
    pub opacity: f32,
    pub visible: bool,
    pub locked: bool,
}

impl Layer {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
            x: 0,
            y: 0,
            scale: 1.0,
            crop: None,
            opacity: 1.0,
            visible: true,
            locked: false,
        }
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    /// Scale used for rendering; non-positive or non-finite scales count as 1.0.
    pub fn effective_scale(&self) -> f32 {
        if self.scale.is_finite() && self.scale > 0.0 { self.scale } else { 1.0 }
    }

    pub fn effective_opacity(&self) -> f32 {
        if self.opacity.is_finite() { self.opacity.clamp(0.0, 1.0) } else { 1.0 }
    }

    /// Clamp numeric fields once at the boundary (deserialization, imports).
    pub fn normalized(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            crate::log_warn!("layer '{}' has invalid scale {}, using 1.0", self.name, self.scale);
            self.scale = 1.0;
        }
        self.opacity = self.effective_opacity();
        if let Some(c) = self.crop
            && (c.x1 <= c.x0 || c.y1 <= c.y0)
        {
            self.crop = None;
        }
        self
    }

    /// Native sub-rectangle that gets painted, after crop clamping.
    pub fn source_rect(&self, native_w: u32, native_h: u32) -> (u32, u32, u32, u32) {
        self.crop
            .and_then(|c| c.clamped(native_w, native_h))
            .unwrap_or((0, 0, native_w, native_h))
    }

    /// On-page size of the layer given its native pixel size.
    pub fn placed_size(&self, native_w: u32, native_h: u32) -> (u32, u32) {
        let (x0, y0, x1, y1) = self.source_rect(native_w, native_h);
        let scale = self.effective_scale();
        let (w, h) = (x1 - x0, y1 - y0);
        if scale == 1.0 {
            return (w.max(1), h.max(1));
        }
        (
            ((w as f32 * scale).round() as u32).max(1),
            ((h as f32 * scale).round() as u32).max(1),
        )
    }

    fn guard(&self) -> Result<(), LayerLocked> {
        if self.locked {
            return Err(LayerLocked { name: self.name.clone() });
        }
        Ok(())
    }

    pub fn set_position(&mut self, x: i32, y: i32) -> Result<(), LayerLocked> {
        self.guard()?;
        self.x = x;
        self.y = y;
        Ok(())
    }

    pub fn set_scale(&mut self, scale: f32) -> Result<(), LayerLocked> {
        self.guard()?;
        self.scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        Ok(())
    }

    pub fn set_crop(&mut self, crop: Option<CropRect>) -> Result<(), LayerLocked> {
        self.guard()?;
        self.crop = crop;
        Ok(())
    }
}

/// Lenient wire shape for layers; missing fields take the defaults a freshly
/// imported layer would have.
#[derive(Deserialize)]
struct LayerRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    path: PathBuf,
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
    #[serde(default = "one")]
    scale: f32,
    #[serde(default)]
    crop: Option<CropRect>,
    #[serde(default = "one")]
    opacity: f32,
    #[serde(default = "yes")]
    visible: bool,
    #[serde(default)]
    locked: bool,
}

fn one() -> f32 {
    1.0
}
fn yes() -> bool {
    true
}

impl From<LayerRecord> for Layer {
    fn from(r: LayerRecord) -> Self {
        Layer {
            id: r.id,
            name: r.name,
            path: r.path,
            x: r.x,
            y: r.y,
            scale: r.scale,
            crop: r.crop,
            opacity: r.opacity,
            visible: r.visible,
            locked: r.locked,
        }
        .normalized()
    }
}

/// Layers from top to bottom (the order a user sees in the layer list).
pub fn visual_order(layers: &[Layer]) -> impl Iterator<Item = (usize, &Layer)> {
    layers.iter().enumerate()
}

/// Layers from bottom to top (the order they must be painted in).
pub fn paint_order(layers: &[Layer]) -> impl Iterator<Item = (usize, &Layer)> {
    layers.iter().enumerate().rev()
}

/// Page-space bounding box `(x0, y0, x1, y1)` of a layer, accounting for crop
/// and scale. `None` if the layer image cannot be resolved.
pub fn layer_bbox(layer: &Layer, store: &dyn ImageStore) -> Option<(i32, i32, i32, i32)> {
    let native = store.load_rgba(&layer.path)?;
    let (w, h) = layer.placed_size(native.width(), native.height());
    let w = i32::try_from(w).unwrap_or(i32::MAX);
    let h = i32::try_from(h).unwrap_or(i32::MAX);
    Some((layer.x, layer.y, layer.x.saturating_add(w), layer.y.saturating_add(h)))
}

/// Index of the topmost visible layer under `(x, y)`.
pub fn hit_test(layers: &[Layer], store: &dyn ImageStore, x: i32, y: i32) -> Option<usize> {
    visual_order(layers)
        .filter(|(_, l)| l.visible)
        .find(|(_, l)| {
            layer_bbox(l, store).is_some_and(|(x0, y0, x1, y1)| x >= x0 && x < x1 && y >= y0 && y < y1)
        })
        .map(|(i, _)| i)
}

// ============================================================================
// PAGE
// ============================================================================

/// One slide: a base image, an optional replacement background of the same
/// size, text annotations, and an ordered layer list.
#[derive(Clone, Debug)]
pub struct Page {
    pub id: Uuid,
    pub original_path: PathBuf,
    pub original_size: (u32, u32),
    pub edit_scale: f32,
    pub base: Arc<RgbaImage>,
    pub bg_path: Option<PathBuf>,
    pub bg_original_path: Option<PathBuf>,
    pub text_boxes: Vec<TextBox>,
    pub layers: Vec<Layer>,
    generation: u64,
}

impl Page {
    pub fn new(original_path: impl Into<PathBuf>, base: RgbaImage, original_size: (u32, u32), edit_scale: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_path: original_path.into(),
            original_size,
            edit_scale,
            base: Arc::new(base),
            bg_path: None,
            bg_original_path: None,
            text_boxes: Vec::new(),
            layers: Vec::new(),
            generation: 0,
        }
    }

    /// White page with no backing file.
    pub fn blank(width: u32, height: u32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let base = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        Self::new(PathBuf::new(), base, (width, height), 1.0)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.base.width(), self.base.height())
    }

    pub fn visual_order(&self) -> impl Iterator<Item = (usize, &Layer)> {
        visual_order(&self.layers)
    }

    pub fn paint_order(&self) -> impl Iterator<Item = (usize, &Layer)> {
        paint_order(&self.layers)
    }

    /// Monotonic counter bumped on every stored mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}
