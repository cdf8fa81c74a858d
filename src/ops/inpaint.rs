// ============================================================================
// REPAIR (INPAINT) - masked regions are filled by an external service and the
// result is layered over the page, never written into the base image
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbaImage};
use serde::Serialize;
use uuid::Uuid;

use crate::canvas::Layer;
use crate::ops::mask::mask_bbox;
use crate::ops::{ServiceError, png_base64, time_tag, truncate_body};
use crate::session::{EditorSession, Notice};
use crate::settings::EditorSettings;
use crate::worker::{UiPoster, spawn_worker};

pub use crate::ops::mask::{TEXT_MASK_PADDING, create_mask_from_boxes};

/// Gaussian sigma used to feather the seam between repaired and original pixels.
pub const FEATHER_SIGMA: f32 = 3.0;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Fills the white area of `mask` in `image`. Image and mask have equal size.
pub trait InpaintClient {
    fn inpaint(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, ServiceError>;
}

#[derive(Serialize)]
struct InpaintRequest<'a> {
    image: String,
    mask: String,
    ldm_steps: u32,
    hd_strategy: &'a str,
    sd_sampler: &'a str,
}

/// IOPaint-compatible HTTP endpoint. The reply body is the repaired image.
pub struct HttpInpaintClient {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpInpaintClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ServiceError> {
        let client = reqwest::blocking::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { url: url.into(), client })
    }

    pub fn from_settings(settings: &EditorSettings) -> Result<Self, ServiceError> {
        if !settings.inpaint_enabled {
            return Err(ServiceError::Disabled("Background repair".into()));
        }
        Self::new(settings.inpaint_api_url.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl InpaintClient for HttpInpaintClient {
    fn inpaint(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, ServiceError> {
        let body = InpaintRequest {
            image: png_base64(&DynamicImage::ImageRgba8(image.clone()))?,
            mask: png_base64(&DynamicImage::ImageLuma8(mask.clone()))?,
            ldm_steps: 30,
            hd_strategy: "Original",
            sd_sampler: "UniPC",
        };
        crate::log_info!("inpaint: {}x{} crop -> {}", image.width(), image.height(), self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| ServiceError::Connection(format!("{} ({})", e, self.url)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(ServiceError::Status { code: status.as_u16(), body: truncate_body(&text, 200) });
        }
        let bytes = response.bytes()?;
        Ok(image::load_from_memory(&bytes)?.to_rgba8())
    }
}

/// Region sent to the service: the mask's bounding box grown by `padding`,
/// as `(x, y, width, height)` clamped to the mask. `None` for a blank mask.
pub fn crop_box_for_mask(mask: &GrayImage, padding: u32) -> Option<(u32, u32, u32, u32)> {
    let (x_min, y_min, x_max, y_max) = mask_bbox(mask)?;
    let x0 = x_min.saturating_sub(padding);
    let y0 = y_min.saturating_sub(padding);
    let x1 = (x_max + 1 + padding).min(mask.width());
    let y1 = (y_max + 1 + padding).min(mask.height());
    Some((x0, y0, x1 - x0, y1 - y0))
}

/// Repair the masked area of `image`. Only the padded crop around the mask is
/// sent; the reply is feathered into the original through a blurred mask.
/// A blank mask returns the image unchanged.
pub fn inpaint_region(
    client: &dyn InpaintClient,
    image: &RgbaImage,
    mask: &GrayImage,
    padding: u32,
) -> Result<RgbaImage, ServiceError> {
    let mask = fit_mask(mask, image.width(), image.height());
    let Some((x, y, w, h)) = crop_box_for_mask(&mask, padding) else {
        return Ok(image.clone());
    };
    let crop_img = imageops::crop_imm(image, x, y, w, h).to_image();
    let crop_mask = imageops::crop_imm(&mask, x, y, w, h).to_image();

    let mut repaired = client.inpaint(&crop_img, &crop_mask)?;
    if repaired.dimensions() != (w, h) {
        crate::log_warn!(
            "inpaint: reply is {}x{}, expected {}x{}; resizing",
            repaired.width(),
            repaired.height(),
            w,
            h
        );
        repaired = imageops::resize(&repaired, w, h, FilterType::Lanczos3);
    }

    let feather = imageops::blur(&crop_mask, FEATHER_SIGMA);
    let mut out = image.clone();
    for (px, py, orig) in crop_img.enumerate_pixels() {
        let m = feather.get_pixel(px, py)[0] as f32 / 255.0;
        let new = repaired.get_pixel(px, py);
        let mut blended = *orig;
        for c in 0..4 {
            blended[c] = (new[c] as f32 * m + orig[c] as f32 * (1.0 - m)).round() as u8;
        }
        out.put_pixel(x + px, y + py, blended);
    }
    Ok(out)
}

/// Turn a repaired page into an overlay that is opaque only where the mask
/// was painted (feathered), cropped to its visible part. Returns the overlay
/// and its top-left position on the page.
pub fn build_repair_layer_image(repaired: &RgbaImage, mask: &GrayImage) -> Option<(RgbaImage, (i32, i32))> {
    let mask = fit_mask(mask, repaired.width(), repaired.height());
    let alpha = imageops::blur(&mask, FEATHER_SIGMA);
    let (x0, y0, x1, y1) = mask_bbox(&alpha)?;
    let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);
    let mut overlay = imageops::crop_imm(repaired, x0, y0, w, h).to_image();
    for (px, py, pixel) in overlay.enumerate_pixels_mut() {
        let a = alpha.get_pixel(x0 + px, y0 + py)[0];
        pixel[3] = ((pixel[3] as u16 * a as u16) / 255) as u8;
    }
    Some((overlay, (x0 as i32, y0 as i32)))
}

fn fit_mask(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        imageops::resize(mask, width, height, FilterType::Nearest)
    }
}

/// Store the repair overlay and add it as the top layer of the current page.
/// Returns the new layer's id.
pub fn apply_inpaint_result(
    session: &mut EditorSession,
    repaired: &RgbaImage,
    mask: &GrayImage,
    name: &str,
) -> Option<String> {
    let Some((overlay, (x, y))) = build_repair_layer_image(repaired, mask) else {
        session.notify(Notice::Warning("Repair produced no visible change".into()));
        return None;
    };
    let path = session.generated_path("repair");
    if let Err(e) = session.store.save_rgba(&path, overlay) {
        session.notify(Notice::Error(format!("Could not store repair layer: {}", e)));
        return None;
    }
    let id = session.add_layer(Layer::new(name, path).at(x, y));
    session.notify(Notice::Status(format!("Added repair layer '{}'", name)));
    Some(id)
}

/// Snapshot of everything a repair needs, taken on the editor thread.
pub struct RepairJob {
    pub page_id: Uuid,
    pub image: RgbaImage,
    pub mask: GrayImage,
    pub padding: u32,
}

impl RepairJob {
    pub fn run(&self, client: &dyn InpaintClient) -> Result<RgbaImage, ServiceError> {
        inpaint_region(client, &self.image, &self.mask, self.padding)
    }
}

/// Validate and snapshot the current page's composite and mask. Problems
/// are reported as warnings and yield `None`.
pub fn prepare_mask_repair(session: &mut EditorSession) -> Option<RepairJob> {
    if !session.settings.inpaint_enabled {
        session.notify(Notice::Warning("Background repair is disabled in settings".into()));
        return None;
    }
    let Some(mask) = session.current_mask() else {
        session.notify(Notice::Warning("Paint over the area to repair first".into()));
        return None;
    };
    Some(RepairJob {
        page_id: session.current_page().id,
        image: session.composite_current_rgba(),
        mask,
        padding: session.settings.inpaint_crop_padding,
    })
}

/// Apply a finished repair to the page it was started on.
pub fn finish_mask_repair(session: &mut EditorSession, job: &RepairJob, result: Result<RgbaImage, ServiceError>) -> bool {
    let repaired = match result {
        Ok(img) => img,
        Err(e) => {
            session.notify(Notice::Error(format!("Repair failed: {}", e)));
            return false;
        }
    };
    let Some(index) = session.pages.iter().position(|p| p.id == job.page_id) else {
        session.notify(Notice::Warning("The repaired page no longer exists".into()));
        return false;
    };
    session.go_to_page(index);
    let name = format!("Repair {}", time_tag());
    if apply_inpaint_result(session, &repaired, &job.mask, &name).is_none() {
        return false;
    }
    session.clear_mask();
    true
}

/// Repair the painted mask on the calling thread.
pub fn repair_masked_area(session: &mut EditorSession, client: &dyn InpaintClient) -> bool {
    let Some(job) = prepare_mask_repair(session) else { return false };
    session.notify(Notice::Status("Repairing masked area...".into()));
    let result = job.run(client);
    finish_mask_repair(session, &job, result)
}

/// Repair the painted mask on a worker thread; the layer is added when the
/// poster's queue is drained.
pub fn start_mask_repair(
    session: &mut EditorSession,
    client: Arc<dyn InpaintClient + Send + Sync>,
    poster: &UiPoster,
) -> bool {
    let Some(job) = prepare_mask_repair(session) else { return false };
    session.notify(Notice::Status("Repairing masked area...".into()));
    let spawned = spawn_worker("inpaint", poster.clone(), move |poster, progress| {
        progress.report("Waiting for the repair service...");
        let result = job.run(client.as_ref());
        poster.post(move |s| {
            finish_mask_repair(s, &job, result);
        });
    });
    if let Err(e) = spawned {
        session.notify(Notice::Error(format!("Could not start repair: {}", e)));
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{ImageStore, MemoryImageStore, Page};
    use crate::worker::UiQueue;
    use image::{Luma, Rgba};
    use std::sync::Mutex;

    /// Paints the whole crop green and remembers the crop size it was sent.
    struct Green {
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl Green {
        fn new() -> Self {
            Self { seen: Mutex::new(Vec::new()) }
        }
    }

    impl InpaintClient for Green {
        fn inpaint(&self, image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, ServiceError> {
            assert_eq!(image.dimensions(), mask.dimensions());
            self.seen.lock().unwrap().push(image.dimensions());
            Ok(RgbaImage::from_pixel(image.width(), image.height(), Rgba([0, 255, 0, 255])))
        }
    }

    struct Down;

    impl InpaintClient for Down {
        fn inpaint(&self, _: &RgbaImage, _: &GrayImage) -> Result<RgbaImage, ServiceError> {
            Err(ServiceError::Connection("refused".into()))
        }
    }

    fn square_mask(w: u32, h: u32, x0: u32, y0: u32, x1: u32, y1: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x0 && x <= x1 && y >= y0 && y <= y1 { Luma([255]) } else { Luma([0]) }
        })
    }

    #[test]
    fn crop_box_is_padded_and_clamped() {
        let mask = square_mask(100, 80, 10, 20, 19, 29);
        assert_eq!(crop_box_for_mask(&mask, 5), Some((5, 15, 20, 20)));
        assert_eq!(crop_box_for_mask(&mask, 128), Some((0, 0, 100, 80)));
        assert_eq!(crop_box_for_mask(&GrayImage::new(4, 4), 8), None);
    }

    #[test]
    fn region_is_replaced_inside_and_kept_far_outside() {
        let image = RgbaImage::from_pixel(100, 100, Rgba([255, 0, 0, 255]));
        let mask = square_mask(100, 100, 40, 40, 59, 59);
        let client = Green::new();
        let out = inpaint_region(&client, &image, &mask, 10).unwrap();
        assert_eq!(client.seen.lock().unwrap().as_slice(), &[(40, 40)]);
        let centre = out.get_pixel(50, 50);
        assert!(centre[1] >= 250 && centre[0] <= 5);
        assert_eq!(out.get_pixel(5, 5).0, [255, 0, 0, 255]);
        assert!(out.get_pixel(32, 50)[0] >= 250);
    }

    #[test]
    fn blank_mask_skips_the_service() {
        let image = RgbaImage::from_pixel(10, 10, Rgba([1, 2, 3, 255]));
        let out = inpaint_region(&Down, &image, &GrayImage::new(10, 10), 4).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn repair_overlay_is_transparent_outside_mask() {
        let repaired = RgbaImage::from_pixel(60, 60, Rgba([0, 255, 0, 255]));
        let mask = square_mask(60, 60, 20, 20, 39, 39);
        let (overlay, (x, y)) = build_repair_layer_image(&repaired, &mask).unwrap();
        assert!(x < 20 && y < 20);
        assert!(overlay.width() < 60 && overlay.width() > 20);
        let centre = overlay.get_pixel(30 - x as u32, 30 - y as u32);
        assert!(centre[3] >= 250);
        assert!(overlay.get_pixel(0, overlay.height() / 2)[3] < 64);
        assert!(build_repair_layer_image(&repaired, &GrayImage::new(60, 60)).is_none());
    }

    fn session() -> (EditorSession, Arc<MemoryImageStore>) {
        let store = Arc::new(MemoryImageStore::new());
        let page = Page::new("p.png", RgbaImage::from_pixel(80, 60, Rgba([200, 0, 0, 255])), (80, 60), 1.0);
        (EditorSession::new_with_pages(vec![page], EditorSettings::default(), store.clone()), store)
    }

    #[test]
    fn repair_adds_a_layer_and_clears_the_mask() {
        let (mut s, store) = session();
        s.set_mask_mode(true);
        s.add_mask_rect(10, 5, 70, 55);
        assert!(repair_masked_area(&mut s, &Green::new()));

        assert_eq!(s.layers.len(), 1);
        assert!(s.mask_strokes.is_empty());
        let layer = &s.layers[0];
        assert!(store.load_rgba(&layer.path).is_some());
        let shown = s.composite_current();
        assert!(shown.get_pixel(40, 30)[1] >= 250 && shown.get_pixel(40, 30)[0] <= 5);
        assert_eq!(shown.get_pixel(0, 0).0, [200, 0, 0]);

        // Undo the mask clear, then the layer.
        s.undo();
        s.undo();
        assert!(s.layers.is_empty());
    }

    #[test]
    fn failures_leave_the_page_alone() {
        let (mut s, _) = session();
        assert!(!repair_masked_area(&mut s, &Green::new()));
        assert!(matches!(s.take_notices().last(), Some(Notice::Warning(_))));

        s.add_mask_rect(1, 1, 5, 5);
        assert!(!repair_masked_area(&mut s, &Down));
        assert!(s.layers.is_empty());
        assert_eq!(s.mask_strokes.len(), 1);
        assert!(matches!(s.take_notices().last(), Some(Notice::Error(_))));

        s.settings.inpaint_enabled = false;
        assert!(!repair_masked_area(&mut s, &Green::new()));
    }

    #[test]
    fn background_repair_lands_on_its_page() {
        let (mut s, _) = session();
        s.add_page(Page::blank(80, 60));
        s.add_mask_rect(10, 10, 20, 20);
        let queue = UiQueue::new();
        assert!(start_mask_repair(&mut s, Arc::new(Green::new()), &queue.poster()));
        s.go_to_page(1);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while s.pages[0].layers.is_empty() && std::time::Instant::now() < deadline {
            queue.wait_one(&mut s, Duration::from_millis(100));
        }
        assert_eq!(s.current_page_index, 0);
        assert_eq!(s.pages[0].layers.len(), 1);
        assert!(s.pages[1].layers.is_empty());
    }

    #[test]
    fn text_mask_covers_boxes_with_padding() {
        let tb = crate::textbox::TextBox::new(10.0, 10.0, 20.0, 10.0, "hi").unwrap();
        let mask = create_mask_from_boxes(&[tb], 50, 50, TEXT_MASK_PADDING);
        assert_eq!(mask.get_pixel(5, 5)[0], 255);
        assert_eq!(mask.get_pixel(4, 4)[0], 0);
    }
}
