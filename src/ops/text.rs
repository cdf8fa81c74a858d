use ab_glyph::{point, Font, FontArc, GlyphId, ScaleFont};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::compositor::blend_over;
use crate::textbox::{TextAlign, TextBox};

/// Screen DPI used for point/pixel conversion.
pub const SCREEN_DPI: u32 = 96;

pub fn pt_to_px(pt: u32, dpi: u32) -> f32 {
    pt as f32 * dpi as f32 / 72.0
}

// ============================================================================
// FONT LOOKUP
// ============================================================================

/// Resolves a font family name to loaded font data.
pub trait FontLookup {
    fn font(&self, family: &str, bold: bool, italic: bool) -> Option<FontArc>;
}

/// Fonts installed on the system, looked up through font-kit. Results
/// (including misses) are cached per family/style.
#[derive(Default)]
pub struct SystemFontLookup {
    cache: Mutex<HashMap<(String, bool, bool), Option<FontArc>>>,
}

impl SystemFontLookup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FontLookup for SystemFontLookup {
    fn font(&self, family: &str, bold: bool, italic: bool) -> Option<FontArc> {
        let key = (family.to_string(), bold, italic);
        if let Ok(cache) = self.cache.lock()
            && let Some(hit) = cache.get(&key)
        {
            return hit.clone();
        }
        let weight = if bold { 700 } else { 400 };
        let font = load_system_font(family, weight, italic);
        if font.is_none() {
            crate::log_warn!("font '{}' not found on this system", family);
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, font.clone());
        }
        font
    }
}

/// Lookup that never finds a font (headless runs, tests).
pub struct NoFonts;

impl FontLookup for NoFonts {
    fn font(&self, _family: &str, _bold: bool, _italic: bool) -> Option<FontArc> {
        None
    }
}

/// Enumerate system font families (family names only, no weight variants).
pub fn enumerate_system_fonts() -> Vec<String> {
    match font_kit::source::SystemSource::new().all_families() {
        Ok(mut families) => {
            families.sort();
            families.dedup();
            families
        }
        Err(e) => {
            crate::log_warn!("could not enumerate system fonts: {}", e);
            Vec::new()
        }
    }
}

/// Load a font by family name, weight, and style from the system.
/// `weight` is a CSS-style weight value (100=Thin, 400=Regular, 700=Bold, etc.)
pub fn load_system_font(family: &str, weight: u16, italic: bool) -> Option<FontArc> {
    use font_kit::family_name::FamilyName;
    use font_kit::properties::{Properties, Style, Weight};
    use font_kit::source::SystemSource;

    let mut props = Properties::new();
    props.weight = Weight(weight as f32);
    if italic {
        props.style = Style::Italic;
    }

    let handle = SystemSource::new()
        .select_best_match(&[FamilyName::Title(family.to_string()), FamilyName::SansSerif], &props)
        .ok()?;
    let font_data = handle.load().ok()?;
    let bytes: Vec<u8> = (*font_data.copy_font_data()?).clone();
    FontArc::try_from_vec(bytes).ok()
}

// ============================================================================
// MEASUREMENT
// ============================================================================

/// Measures the ink bounding box of a single line of text.
pub trait TextMeasurer {
    /// `(width, height)` in pixels at `px` size, or `None` if measuring failed.
    fn measure(&self, text: &str, px: f32) -> Option<(f32, f32)>;
}

impl TextMeasurer for FontArc {
    fn measure(&self, text: &str, px: f32) -> Option<(f32, f32)> {
        if !(px.is_finite() && px > 0.0) {
            return None;
        }
        let (glyphs, advance, _, _, _) = layout_text(self, text, px, TextAlign::Left);
        let mut bounds: Option<(f32, f32, f32, f32)> = None;
        for (id, gx, gy) in glyphs {
            let glyph = id.with_scale_and_position(px, point(gx, gy));
            let Some(outlined) = self.outline_glyph(glyph) else { continue };
            let b = outlined.px_bounds();
            bounds = Some(match bounds {
                None => (b.min.x, b.min.y, b.max.x, b.max.y),
                Some((x0, y0, x1, y1)) => (x0.min(b.min.x), y0.min(b.min.y), x1.max(b.max.x), y1.max(b.max.y)),
            });
        }
        Some(match bounds {
            Some((x0, y0, x1, y1)) => (x1 - x0, y1 - y0),
            None => (advance, 0.0),
        })
    }
}

/// Lay out a single line of text, returning positioned glyphs and metrics.
/// Returns `(glyphs, total_width, ascent, descent, line_height)`; glyph y is
/// the baseline when the line's top sits at 0.
pub fn layout_text(
    font: &FontArc,
    text: &str,
    font_size: f32,
    alignment: TextAlign,
) -> (Vec<(GlyphId, f32, f32)>, f32, f32, f32, f32) {
    let scaled = font.as_scaled(font_size);
    let ascent = scaled.ascent();
    let descent = scaled.descent();
    let line_height = scaled.height();

    let mut glyphs = Vec::new();
    let mut cursor_x = 0.0f32;
    let mut last_glyph: Option<GlyphId> = None;

    for ch in text.chars() {
        let glyph_id = font.glyph_id(ch);
        if let Some(prev) = last_glyph {
            cursor_x += scaled.kern(prev, glyph_id);
        }
        glyphs.push((glyph_id, cursor_x, ascent));
        cursor_x += scaled.h_advance(glyph_id);
        last_glyph = Some(glyph_id);
    }

    let total_width = cursor_x;
    let offset = match alignment {
        TextAlign::Left => 0.0,
        TextAlign::Center => -total_width * 0.5,
        TextAlign::Right => -total_width,
    };
    for glyph in &mut glyphs {
        glyph.1 += offset;
    }

    (glyphs, total_width, ascent, descent, line_height)
}

// ============================================================================
// FONT FIT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitParams {
    pub min_pt: u32,
    pub max_pt: u32,
    pub dpi: u32,
    pub padding_x: u32,
    pub padding_y: u32,
}

impl Default for FitParams {
    fn default() -> Self {
        Self { min_pt: 8, max_pt: 200, dpi: SCREEN_DPI, padding_x: 6, padding_y: 2 }
    }
}

/// Largest point size at which `text`, rendered on one line, fits inside a
/// `box_w` x `box_h` pixel box. Without a measurer only the box height is
/// used for the estimate.
pub fn fit_font_size(
    text: &str,
    box_w: f32,
    box_h: f32,
    measurer: Option<&dyn TextMeasurer>,
    params: FitParams,
) -> u32 {
    let FitParams { min_pt, max_pt, dpi, padding_x, padding_y } = params;
    let dpi = dpi.max(1) as f32;
    let text = text.trim();
    let (box_w, box_h) = (box_w as i64, box_h as i64);
    if text.is_empty() || box_w <= 0 || box_h <= 0 {
        return min_pt.max(16.min(max_pt));
    }

    let avail_w = (box_w - padding_x as i64).max(1) as f32;
    let avail_h = (box_h - padding_y as i64).max(1) as f32;

    let Some(measurer) = measurer else {
        let est = (avail_h * 72.0 / dpi * 0.95).floor() as i64;
        return est.clamp(min_pt as i64, max_pt.max(min_pt) as i64) as u32;
    };

    let fits = |pt: i64| -> bool {
        let px = ((pt as f32 * dpi / 72.0).round()).max(1.0);
        match measurer.measure(text, px) {
            Some((w, h)) => w <= avail_w && h <= avail_h,
            None => true,
        }
    };

    let mut lo = min_pt as i64;
    let mut hi = (max_pt as i64).min((min_pt as i64).max((avail_h * 72.0 / dpi * 1.8).floor() as i64));
    let mut best = min_pt as i64;
    for _ in 0..12 {
        if lo > hi {
            break;
        }
        let mid = (lo + hi) / 2;
        if fits(mid) {
            best = mid;
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    best.clamp(min_pt as i64, max_pt.max(min_pt) as i64) as u32
}

/// Fit a text box's current text using its own font.
pub fn fit_text_box(tb: &TextBox, fonts: &dyn FontLookup) -> u32 {
    let font = fonts.font(&tb.font_name, tb.bold, tb.italic);
    fit_font_size(
        &tb.text,
        tb.width,
        tb.height,
        font.as_ref().map(|f| f as &dyn TextMeasurer),
        FitParams::default(),
    )
}

// ============================================================================
// DRAWING
// ============================================================================

/// Draw a text box onto `canvas`: one line, aligned horizontally inside the
/// box and centred vertically, the way the editor canvas shows it.
pub fn draw_text_box(canvas: &mut RgbaImage, tb: &TextBox, font: &FontArc) {
    let text = tb.text.replace(['\r', '\n'], " ");
    if text.trim().is_empty() {
        return;
    }
    let px = pt_to_px(tb.font_size, SCREEN_DPI);
    let (glyphs, _, ascent, descent, _) = layout_text(font, &text, px, tb.align);
    let origin_x = match tb.align {
        TextAlign::Left => tb.x,
        TextAlign::Center => tb.x + tb.width * 0.5,
        TextAlign::Right => tb.x + tb.width,
    };
    let text_h = ascent - descent;
    let origin_y = tb.y + (tb.height - text_h) * 0.5;
    let [r, g, b] = tb.rgb();
    let (cw, ch) = (canvas.width() as i32, canvas.height() as i32);

    for (id, gx, gy) in glyphs {
        let glyph = id.with_scale_and_position(px, point(origin_x + gx, origin_y + gy));
        let Some(outlined) = font.outline_glyph(glyph) else { continue };
        let bounds = outlined.px_bounds();
        let baseline = origin_y + gy;
        outlined.draw(|x, y, cov| {
            let mut cx = bounds.min.x + x as f32;
            let cy = bounds.min.y + y as f32;
            if tb.italic {
                cx += (baseline - cy) * 0.2;
            }
            let ix = cx.round() as i32;
            let iy = cy.round() as i32;
            let a = (cov.clamp(0.0, 1.0) * 255.0).round() as u8;
            let strikes = if tb.bold { 2 } else { 1 };
            for dx in 0..strikes {
                let px_x = ix + dx;
                if px_x < 0 || iy < 0 || px_x >= cw || iy >= ch || a == 0 {
                    continue;
                }
                let dst = canvas.get_pixel_mut(px_x as u32, iy as u32);
                dst.0 = blend_over(dst.0, [r, g, b, a]);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Monospace stand-in: every character is 0.6em wide, lines are 1em tall.
    struct Mono;

    impl TextMeasurer for Mono {
        fn measure(&self, text: &str, px: f32) -> Option<(f32, f32)> {
            Some((text.chars().count() as f32 * px * 0.6, px))
        }
    }

    struct Broken;

    impl TextMeasurer for Broken {
        fn measure(&self, _text: &str, _px: f32) -> Option<(f32, f32)> {
            None
        }
    }

    fn fit(text: &str, w: f32, h: f32) -> u32 {
        fit_font_size(text, w, h, Some(&Mono), FitParams::default())
    }

    #[test]
    fn blank_text_uses_default_size() {
        assert_eq!(fit("   ", 100.0, 40.0), 16);
        assert_eq!(fit("x", 0.0, 40.0), 16);
        let tiny = FitParams { max_pt: 10, ..Default::default() };
        assert_eq!(fit_font_size("", 10.0, 10.0, Some(&Mono), tiny), 10);
        let big_min = FitParams { min_pt: 20, ..Default::default() };
        assert_eq!(fit_font_size("", 10.0, 10.0, Some(&Mono), big_min), 20);
    }

    #[test]
    fn result_fits_the_box() {
        let pt = fit("Hello world", 300.0, 60.0);
        let px = (pt as f32 * 96.0 / 72.0).round();
        let (w, h) = Mono.measure("Hello world", px).unwrap();
        assert!(w <= 294.0 && h <= 58.0, "pt {} -> {}x{}", pt, w, h);
        let px_next = ((pt + 1) as f32 * 96.0 / 72.0).round();
        let (w2, h2) = Mono.measure("Hello world", px_next).unwrap();
        assert!(w2 > 294.0 || h2 > 58.0);
    }

    #[test]
    fn wider_box_never_shrinks_text() {
        for w in [40.0, 80.0, 150.0, 400.0] {
            let narrow = fit("Quarterly results", w, 50.0);
            let wide = fit("Quarterly results", w * 2.0, 50.0);
            assert!(wide >= narrow, "{} -> {} vs {}", w, narrow, wide);
        }
    }

    #[test]
    fn height_heuristic_without_font() {
        let pt = fit_font_size("abc", 500.0, 42.0, None, FitParams::default());
        assert_eq!(pt, 28);
        assert_eq!(fit_font_size("abc", 500.0, 4.0, None, FitParams::default()), 8);
        assert_eq!(fit_font_size("abc", 500.0, 9000.0, None, FitParams::default()), 200);
    }

    #[test]
    fn measurement_failure_counts_as_fitting() {
        let pt = fit_font_size("abc", 100.0, 42.0, Some(&Broken), FitParams::default());
        assert_eq!(pt, 54);
    }

    #[test]
    fn fit_text_box_without_fonts_uses_estimate() {
        let tb = TextBox::new(0.0, 0.0, 200.0, 42.0, "Title").unwrap();
        assert_eq!(fit_text_box(&tb, &NoFonts), 28);
    }
}
