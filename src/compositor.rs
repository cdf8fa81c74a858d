//! Flattens a page (background + layers) into a single opaque raster.
//!
//! Layers are stored top-first, so painting walks [`paint_order`] (bottom
//! first) and lets each later layer cover the earlier ones.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, RgbaImage};
use rayon::prelude::*;
use uuid::Uuid;

use crate::canvas::{ImageStore, Layer, Page, paint_order};

/// Longest edge of page thumbnails in the page strip.
pub const THUMBNAIL_MAX: (u32, u32) = (110, 70);

/// Composite a page into an RGB image. Pure with respect to `page`.
pub fn composite(page: &Page, store: &dyn ImageStore) -> RgbImage {
    flatten(composite_rgba(page, store))
}

/// Composite a page but keep the RGBA working canvas (used as the source
/// image for inpainting, which wants "what the user currently sees").
pub fn composite_rgba(page: &Page, store: &dyn ImageStore) -> RgbaImage {
    composite_layers(&page.base, page.bg_path.as_deref(), &page.layers, store)
}

/// Composite loose parts: the live editing buffers are not a `Page` until
/// they are synced back, so the session calls this directly.
pub fn composite_layers(
    base: &RgbaImage,
    bg_path: Option<&Path>,
    layers: &[Layer],
    store: &dyn ImageStore,
) -> RgbaImage {
    let mut canvas = background_canvas(base, bg_path, store);

    for (index, layer) in paint_order(layers) {
        if !layer.visible {
            continue;
        }
        let Some(native) = store.load_rgba(&layer.path) else {
            crate::log_warn!("layer {} '{}' image missing: {}", index, layer.name, layer.path.display());
            continue;
        };
        let prepared = prepare_layer(layer, &native);
        paste_over(&mut canvas, &prepared, layer.x as i64, layer.y as i64);
    }

    canvas
}

/// Drop the alpha channel.
pub fn flatten(rgba: RgbaImage) -> RgbImage {
    DynamicImage::ImageRgba8(rgba).to_rgb8()
}

/// Small preview of a composited page, aspect preserved.
pub fn fit_thumbnail(full: &RgbImage, max_w: u32, max_h: u32) -> RgbImage {
    let (w, h) = full.dimensions();
    let scale = (max_w as f32 / w as f32).min(max_h as f32 / h as f32).min(1.0);
    if scale >= 1.0 {
        return full.clone();
    }
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(full, nw, nh, FilterType::Lanczos3)
}

fn background_canvas(base: &RgbaImage, bg_path: Option<&Path>, store: &dyn ImageStore) -> RgbaImage {
    let bg = bg_path.and_then(|p| {
        let img = store.load_rgba(p);
        if img.is_none() {
            crate::log_warn!("background {} not found, using base image", p.display());
        }
        img
    });
    match bg {
        Some(bg) if bg.dimensions() != base.dimensions() => {
            crate::log_warn!(
                "background {}x{} does not match base {}x{}, resizing",
                bg.width(),
                bg.height(),
                base.width(),
                base.height()
            );
            imageops::resize(bg.as_ref(), base.width(), base.height(), FilterType::Lanczos3)
        }
        Some(bg) => bg.as_ref().clone(),
        None => base.clone(),
    }
}

/// Apply crop, scale and opacity to a layer's native pixels.
pub fn prepare_layer<'a>(layer: &Layer, native: &'a RgbaImage) -> Cow<'a, RgbaImage> {
    let (nw, nh) = native.dimensions();
    let (x0, y0, x1, y1) = layer.source_rect(nw, nh);
    let mut img: Cow<'a, RgbaImage> = if (x0, y0, x1, y1) == (0, 0, nw, nh) {
        Cow::Borrowed(native)
    } else {
        Cow::Owned(imageops::crop_imm(native, x0, y0, x1 - x0, y1 - y0).to_image())
    };

    if layer.effective_scale() != 1.0 {
        let (tw, th) = layer.placed_size(nw, nh);
        img = Cow::Owned(imageops::resize(img.as_ref(), tw, th, FilterType::Lanczos3));
    }

    let opacity = layer.effective_opacity();
    if opacity < 1.0 {
        let owned = img.to_mut();
        for px in owned.pixels_mut() {
            px[3] = (px[3] as f32 * opacity).round() as u8;
        }
    }
    img
}

/// Alpha-over paste of `top` onto `canvas` at `(x, y)`. Portions outside the
/// canvas are ignored.
pub fn paste_over(canvas: &mut RgbaImage, top: &RgbaImage, x: i64, y: i64) {
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);
    let (tw, th) = (top.width() as i64, top.height() as i64);
    let dst_x0 = x.max(0);
    let dst_y0 = y.max(0);
    let dst_x1 = (x + tw).min(cw);
    let dst_y1 = (y + th).min(ch);
    if dst_x1 <= dst_x0 || dst_y1 <= dst_y0 {
        return;
    }

    let stride = cw as usize * 4;
    let top_stride = tw as usize * 4;
    let top_raw = top.as_raw();
    let span = (dst_x1 - dst_x0) as usize;

    canvas
        .par_chunks_mut(stride)
        .enumerate()
        .skip(dst_y0 as usize)
        .take((dst_y1 - dst_y0) as usize)
        .for_each(|(row, dst_row)| {
            let src_y = (row as i64 - y) as usize;
            let src_start = src_y * top_stride + (dst_x0 - x) as usize * 4;
            let dst_start = dst_x0 as usize * 4;
            let src = &top_raw[src_start..src_start + span * 4];
            let dst = &mut dst_row[dst_start..dst_start + span * 4];
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let out = blend_over([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]]);
                d.copy_from_slice(&out);
            }
        });
}

/// Straight-alpha "over" operator.
pub fn blend_over(base: [u8; 4], top: [u8; 4]) -> [u8; 4] {
    if top[3] == 0 {
        return base;
    }
    if top[3] == 255 {
        return top;
    }
    let ta = top[3] as f32 / 255.0;
    let ba = base[3] as f32 / 255.0;
    let out_a = ta + ba * (1.0 - ta);
    if out_a <= 0.0 {
        return [0, 0, 0, 0];
    }
    let mut out = [0u8; 4];
    for c in 0..3 {
        let v = (top[c] as f32 * ta + base[c] as f32 * ba * (1.0 - ta)) / out_a;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    out
}

// ============================================================================
// COMPOSITE CACHE
// ============================================================================

/// Memoized composites keyed by page identity and the page's generation
/// counter. Files changed on disk behind the cache's back are not noticed;
/// call [`CompositeCache::invalidate`] after writing a referenced image.
#[derive(Default)]
pub struct CompositeCache {
    entries: HashMap<Uuid, (u64, Arc<RgbImage>)>,
}

impl CompositeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_render(&mut self, page: &Page, store: &dyn ImageStore) -> Arc<RgbImage> {
        if let Some((generation, img)) = self.entries.get(&page.id)
            && *generation == page.generation()
        {
            return Arc::clone(img);
        }
        let img = Arc::new(composite(page, store));
        self.entries.insert(page.id, (page.generation(), Arc::clone(&img)));
        img
    }

    pub fn invalidate(&mut self, page_id: Uuid) {
        self.entries.remove(&page_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
