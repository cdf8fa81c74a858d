// ============================================================================
// Freehand repair mask: stroke vocabulary and rasterization
// ============================================================================

use image::{GrayImage, Luma};

use crate::textbox::TextBox;

/// Padding around text boxes when building a "remove text" mask.
pub const TEXT_MASK_PADDING: i32 = 5;

const ON: Luma<u8> = Luma([255]);

/// One user gesture on the repair mask. Brush strokes remember the brush
/// size they were drawn with so the mask can be rebuilt exactly.
#[derive(Clone, Debug, PartialEq)]
pub enum MaskStroke {
    Brush { points: Vec<(i32, i32)>, size: u32 },
    Rect { x0: i32, y0: i32, x1: i32, y1: i32 },
}

impl MaskStroke {
    /// Rectangle from two corner points in any order.
    pub fn rect(ax: i32, ay: i32, bx: i32, by: i32) -> Self {
        MaskStroke::Rect { x0: ax.min(bx), y0: ay.min(by), x1: ax.max(bx), y1: ay.max(by) }
    }

    pub fn is_brush(&self) -> bool {
        matches!(self, MaskStroke::Brush { .. })
    }

    /// Paint this stroke onto `mask`.
    pub fn draw(&self, mask: &mut GrayImage) {
        match self {
            MaskStroke::Brush { points, size } => {
                let mut prev: Option<(i32, i32)> = None;
                for &p in points {
                    match prev {
                        Some(a) => stroke_segment(mask, a, p, *size),
                        None => stamp_disc(mask, p.0, p.1, *size),
                    }
                    prev = Some(p);
                }
            }
            MaskStroke::Rect { x0, y0, x1, y1 } => fill_rect(mask, *x0, *y0, *x1, *y1),
        }
    }
}

/// Rebuild a mask of the given size from scratch.
pub fn rasterize(strokes: &[MaskStroke], width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for stroke in strokes {
        stroke.draw(&mut mask);
    }
    mask
}

/// Filled disc of diameter `size` centred on `(cx, cy)`.
pub fn stamp_disc(mask: &mut GrayImage, cx: i32, cy: i32, size: u32) {
    let r = i64::from(size / 2);
    let (cx, cy) = (i64::from(cx), i64::from(cy));
    let (w, h) = (i64::from(mask.width()), i64::from(mask.height()));
    let r2 = r * r;
    for y in (cy - r).max(0)..=(cy + r).min(h - 1) {
        for x in (cx - r).max(0)..=(cx + r).min(w - 1) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= r2 {
                mask.put_pixel(x as u32, y as u32, ON);
            }
        }
    }
}

/// Thick line from `a` to `b`, drawn as discs at one-pixel steps.
pub fn stroke_segment(mask: &mut GrayImage, a: (i32, i32), b: (i32, i32), size: u32) {
    let dx = i64::from(b.0) - i64::from(a.0);
    let dy = i64::from(b.1) - i64::from(a.1);
    let steps = dx.abs().max(dy.abs()).max(1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = f64::from(a.0) + dx as f64 * t;
        let y = f64::from(a.1) + dy as f64 * t;
        stamp_disc(mask, x.round() as i32, y.round() as i32, size);
    }
}

/// Inclusive rectangle fill, clipped to the mask.
pub fn fill_rect(mask: &mut GrayImage, x0: i32, y0: i32, x1: i32, y1: i32) {
    let (w, h) = (mask.width() as i32, mask.height() as i32);
    let (x0, x1) = (x0.min(x1).max(0), x0.max(x1).min(w - 1));
    let (y0, y1) = (y0.min(y1).max(0), y0.max(y1).min(h - 1));
    if x1 < x0 || y1 < y0 {
        return;
    }
    for y in y0..=y1 {
        for x in x0..=x1 {
            mask.put_pixel(x as u32, y as u32, ON);
        }
    }
}

/// Inclusive bounding box `(x_min, y_min, x_max, y_max)` of non-zero pixels.
pub fn mask_bbox(mask: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    let mut bbox: Option<(u32, u32, u32, u32)> = None;
    for (x, y, px) in mask.enumerate_pixels() {
        if px[0] == 0 {
            continue;
        }
        bbox = Some(match bbox {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bbox
}

pub fn is_blank(mask: &GrayImage) -> bool {
    mask.as_raw().iter().all(|&v| v == 0)
}

/// Mask covering every text box, grown by `padding` on each side.
pub fn create_mask_from_boxes(boxes: &[TextBox], width: u32, height: u32, padding: i32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for tb in boxes {
        let x0 = (tb.x.round() as i32 - padding).max(0);
        let y0 = (tb.y.round() as i32 - padding).max(0);
        let x1 = ((tb.x + tb.width).round() as i32 + padding).min(width as i32);
        let y1 = ((tb.y + tb.height).round() as i32 + padding).min(height as i32);
        fill_rect(&mut mask, x0, y0, x1, y1);
    }
    mask
}
