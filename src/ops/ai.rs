// ============================================================================
// AI REGION REPLACE - a selected rectangle is regenerated from a prompt by an
// OpenAI-compatible chat endpoint and placed back as a layer
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbaImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::Layer;
use crate::ops::{ServiceError, decode_base64_image, png_base64, time_tag, truncate_body};
use crate::session::{EditorSession, Notice};
use crate::settings::EditorSettings;
use crate::worker::{UiPoster, spawn_worker};

/// Longest side of images uploaded to the generator.
pub const UPLOAD_MAX_SIDE: u32 = 1920;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces an image from a prompt, optionally guided by a source image and
/// a mask of the area to change.
pub trait ImageGenerator {
    fn generate(
        &self,
        prompt: &str,
        source: Option<&DynamicImage>,
        mask: Option<&GrayImage>,
    ) -> Result<DynamicImage, ServiceError>;
}

// ----------------------------------------------------------------------------
// Chat completions wire format
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<String>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<Content>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Content {
    Text { r#type: String, text: String },
    Image { r#type: String, image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Where the reply says the generated image is.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageRef {
    /// `data:image/...;base64,...`
    Data(String),
    Url(String),
}

/// Find the image in a chat reply: a markdown image with a data URL wins,
/// then a markdown image with an http(s) URL, then a bare data URL.
pub fn extract_image_ref(content: &str) -> Option<ImageRef> {
    let targets = markdown_image_targets(content);
    if let Some(data) = targets.iter().find(|t| t.starts_with("data:image/")) {
        return Some(ImageRef::Data(data.to_string()));
    }
    if let Some(url) = targets.iter().find(|t| t.starts_with("http://") || t.starts_with("https://")) {
        return Some(ImageRef::Url(url.to_string()));
    }
    let trimmed = content.trim();
    trimmed.starts_with("data:image/").then(|| ImageRef::Data(trimmed.to_string()))
}

/// Targets of every `![alt](target)` in `content`, in order.
fn markdown_image_targets(content: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("![") {
        let after = &rest[start + 2..];
        let Some(close) = after.find("](") else { break };
        if after[..close].contains('\n') {
            rest = after;
            continue;
        }
        let target = &after[close + 2..];
        let Some(end) = target.find(')') else { break };
        out.push(target[..end].trim());
        rest = &target[end + 1..];
    }
    out
}

pub struct HttpImageGenerator {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl HttpImageGenerator {
    pub fn new(api_url: &str, api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: format!("{}/chat/completions", api_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn from_settings(settings: &EditorSettings) -> Result<Self, ServiceError> {
        if settings.ai_api_key.trim().is_empty() {
            return Err(ServiceError::Disabled("AI image generation (no API key configured)".into()));
        }
        Self::new(
            &settings.ai_api_url,
            settings.ai_api_key.trim(),
            settings.ai_model.clone(),
            Duration::from_secs(settings.ai_timeout_secs.max(1)),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn download(&self, url: &str) -> Result<DynamicImage, ServiceError> {
        crate::log_info!("ai: downloading result from {}", url);
        let response = self.client.get(url).timeout(DOWNLOAD_TIMEOUT).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status { code: status.as_u16(), body: format!("download of {}", url) });
        }
        let bytes = response.bytes()?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

impl ImageGenerator for HttpImageGenerator {
    fn generate(
        &self,
        prompt: &str,
        source: Option<&DynamicImage>,
        mask: Option<&GrayImage>,
    ) -> Result<DynamicImage, ServiceError> {
        let mut content = vec![Content::Text { r#type: "text".into(), text: prompt.to_string() }];
        let mut attach = |img: DynamicImage| -> Result<(), ServiceError> {
            let b64 = png_base64(&downscale_for_upload(img))?;
            content.push(Content::Image {
                r#type: "image_url".into(),
                image_url: ImageUrl { url: format!("data:image/png;base64,{}", b64) },
            });
            Ok(())
        };
        if let Some(src) = source {
            attach(src.clone())?;
        }
        if let Some(m) = mask {
            attach(DynamicImage::ImageLuma8(m.clone()))?;
        }

        let (size, ratio) = match source {
            Some(src) => suggest_size(src.width(), src.height()),
            None => ("1024x1024", "auto"),
        };
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message { role: "user".into(), content }],
            stream: false,
            size: size.to_string(),
            aspect_ratio: (ratio != "auto").then(|| ratio.to_string()),
        };

        crate::log_info!("ai: {} size={} ratio={}", self.endpoint, size, ratio);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| ServiceError::Connection(format!("{} ({})", e, self.endpoint)))?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| truncate_body(&text, 200));
            return Err(ServiceError::Status { code: status.as_u16(), body: message });
        }

        let reply: ChatResponse = serde_json::from_str(&text)?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        match extract_image_ref(&content) {
            Some(ImageRef::Data(data)) => decode_base64_image(&data),
            Some(ImageRef::Url(url)) => self.download(&url),
            None => Err(ServiceError::Decode("reply did not contain an image".into())),
        }
    }
}

// ----------------------------------------------------------------------------
// Sizing
// ----------------------------------------------------------------------------

fn downscale_for_upload(img: DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w.max(h) <= UPLOAD_MAX_SIDE {
        return img;
    }
    img.resize(UPLOAD_MAX_SIDE, UPLOAD_MAX_SIDE, FilterType::Lanczos3)
}

/// Output size and aspect label to request for a `w` x `h` target, chosen so
/// the result does not have to be upscaled.
pub fn suggest_size(w: u32, h: u32) -> (&'static str, &'static str) {
    let m = w.max(h);
    let size = if m > 1024 {
        "2048x2048"
    } else if m > 512 {
        "1024x1024"
    } else {
        "512x512"
    };
    (size, aspect_label(w, h))
}

fn aspect_label(w: u32, h: u32) -> &'static str {
    if w == 0 || h == 0 {
        return "auto";
    }
    let r = w as f32 / h as f32;
    const CANDIDATES: [(&str, f32); 5] =
        [("1:1", 1.0), ("16:9", 16.0 / 9.0), ("9:16", 9.0 / 16.0), ("4:3", 4.0 / 3.0), ("3:4", 3.0 / 4.0)];
    let mut best = CANDIDATES[0];
    for c in CANDIDATES {
        if (c.1 - r).abs() < (best.1 - r).abs() {
            best = c;
        }
    }
    best.0
}

/// Scale to cover `w` x `h` without distortion, then centre-crop.
pub fn resize_cover(img: &DynamicImage, w: u32, h: u32) -> RgbaImage {
    let (iw, ih) = img.dimensions();
    if (iw, ih) == (w, h) || iw == 0 || ih == 0 {
        return img.to_rgba8();
    }
    let scale = (w as f32 / iw as f32).max(h as f32 / ih as f32);
    let sw = ((iw as f32 * scale).ceil() as u32).max(w);
    let sh = ((ih as f32 * scale).ceil() as u32).max(h);
    let scaled = imageops::resize(&img.to_rgba8(), sw, sh, FilterType::Lanczos3);
    imageops::crop_imm(&scaled, (sw - w) / 2, (sh - h) / 2, w, h).to_image()
}

/// Scale to fit inside `w` x `h` without distortion, centred on a
/// transparent canvas.
pub fn resize_contain(img: &DynamicImage, w: u32, h: u32) -> RgbaImage {
    let (iw, ih) = img.dimensions();
    let mut canvas = RgbaImage::new(w, h);
    if iw == 0 || ih == 0 {
        return canvas;
    }
    let scale = (w as f32 / iw as f32).min(h as f32 / ih as f32);
    let sw = ((iw as f32 * scale).round() as u32).clamp(1, w.max(1));
    let sh = ((ih as f32 * scale).round() as u32).clamp(1, h.max(1));
    let scaled = imageops::resize(&img.to_rgba8(), sw, sh, FilterType::Lanczos3);
    imageops::overlay(&mut canvas, &scaled, ((w - sw) / 2) as i64, ((h - sh) / 2) as i64);
    canvas
}

// ----------------------------------------------------------------------------
// Session glue
// ----------------------------------------------------------------------------

/// Place a generated image over `(x1, y1)-(x2, y2)` of the current page as a
/// new top layer. Returns the layer id.
pub fn apply_ai_result(session: &mut EditorSession, img: &DynamicImage, x1: i32, y1: i32, x2: i32, y2: i32) -> Option<String> {
    let (w, h) = ((x2 - x1).max(0) as u32, (y2 - y1).max(0) as u32);
    if w == 0 || h == 0 {
        session.notify(Notice::Warning("The selected area is empty".into()));
        return None;
    }
    let fitted = resize_cover(img, w, h);
    let path = session.generated_path("ai");
    if let Err(e) = session.store.save_rgba(&path, fitted) {
        session.notify(Notice::Error(format!("Could not store generated image: {}", e)));
        return None;
    }
    let name = format!("AI {}", time_tag());
    let id = session.add_layer(Layer::new(name.clone(), path).at(x1, y1));
    session.notify(Notice::Status(format!("Added layer '{}'", name)));
    Some(id)
}

/// Everything a region replace needs, snapshotted on the editor thread.
pub struct AiReplaceJob {
    pub page_id: Uuid,
    pub prompt: String,
    pub rect: (i32, i32, i32, i32),
    pub source: DynamicImage,
    pub mask: GrayImage,
}

impl AiReplaceJob {
    pub fn run(&self, generator: &dyn ImageGenerator) -> Result<DynamicImage, ServiceError> {
        generator.generate(&self.prompt, Some(&self.source), Some(&self.mask))
    }
}

/// Validate the selection and crop the page's background (or base image)
/// to it. Problems are reported as warnings.
pub fn prepare_ai_replace(session: &mut EditorSession, prompt: &str, x1: i32, y1: i32, x2: i32, y2: i32) -> Option<AiReplaceJob> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        session.notify(Notice::Warning("Enter a prompt first".into()));
        return None;
    }
    let (pw, ph) = session.current_page().size();
    let (ax, bx) = (x1.min(x2).clamp(0, pw as i32), x1.max(x2).clamp(0, pw as i32));
    let (ay, by) = (y1.min(y2).clamp(0, ph as i32), y1.max(y2).clamp(0, ph as i32));
    if bx - ax < 1 || by - ay < 1 {
        session.notify(Notice::Warning("Select an area on the page first".into()));
        return None;
    }

    let page = session.current_page();
    let base = match &session.bg_path {
        Some(p) => session.store.load_rgba(p).filter(|img| img.dimensions() == (pw, ph)),
        None => None,
    }
    .unwrap_or_else(|| Arc::clone(&page.base));
    let (w, h) = ((bx - ax) as u32, (by - ay) as u32);
    let source = imageops::crop_imm(base.as_ref(), ax as u32, ay as u32, w, h).to_image();

    Some(AiReplaceJob {
        page_id: page.id,
        prompt: prompt.to_string(),
        rect: (ax, ay, bx, by),
        source: DynamicImage::ImageRgba8(source),
        mask: GrayImage::from_pixel(w, h, Luma([255])),
    })
}

pub fn finish_ai_replace(session: &mut EditorSession, job: &AiReplaceJob, result: Result<DynamicImage, ServiceError>) -> bool {
    let img = match result {
        Ok(img) => img,
        Err(e) => {
            session.notify(Notice::Error(format!("AI replace failed: {}", e)));
            return false;
        }
    };
    let Some(index) = session.pages.iter().position(|p| p.id == job.page_id) else {
        session.notify(Notice::Warning("The edited page no longer exists".into()));
        return false;
    };
    session.go_to_page(index);
    let (x1, y1, x2, y2) = job.rect;
    apply_ai_result(session, &img, x1, y1, x2, y2).is_some()
}

/// Replace a region on the calling thread.
pub fn replace_region(
    session: &mut EditorSession,
    generator: &dyn ImageGenerator,
    prompt: &str,
    rect: (i32, i32, i32, i32),
) -> bool {
    let Some(job) = prepare_ai_replace(session, prompt, rect.0, rect.1, rect.2, rect.3) else { return false };
    let result = job.run(generator);
    finish_ai_replace(session, &job, result)
}

/// Replace a region on a worker thread.
pub fn start_ai_replace(
    session: &mut EditorSession,
    generator: Arc<dyn ImageGenerator + Send + Sync>,
    poster: &UiPoster,
    prompt: &str,
    rect: (i32, i32, i32, i32),
) -> bool {
    let Some(job) = prepare_ai_replace(session, prompt, rect.0, rect.1, rect.2, rect.3) else { return false };
    session.notify(Notice::Status("Generating...".into()));
    let spawned = spawn_worker("ai-replace", poster.clone(), move |poster, progress| {
        progress.report("Waiting for the image service...");
        let result = job.run(generator.as_ref());
        poster.post(move |s| {
            finish_ai_replace(s, &job, result);
        });
    });
    if let Err(e) = spawned {
        session.notify(Notice::Error(format!("Could not start AI replace: {}", e)));
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{MemoryImageStore, Page};
    use image::Rgba;
    use std::sync::Mutex;

    #[test]
    fn reply_parsing_prefers_data_then_url() {
        let both = "here ![a](https://x.test/i.png) and ![b](data:image/png;base64,AAAA)";
        assert_eq!(extract_image_ref(both), Some(ImageRef::Data("data:image/png;base64,AAAA".into())));
        assert_eq!(
            extract_image_ref("![img](https://x.test/i.png)"),
            Some(ImageRef::Url("https://x.test/i.png".into()))
        );
        assert_eq!(
            extract_image_ref("  data:image/jpeg;base64,BBBB "),
            Some(ImageRef::Data("data:image/jpeg;base64,BBBB".into()))
        );
        assert_eq!(extract_image_ref("sorry, I can't draw that"), None);
        assert_eq!(extract_image_ref("![broken](no-close"), None);
    }

    #[test]
    fn size_suggestions_avoid_upscaling() {
        assert_eq!(suggest_size(300, 300), ("512x512", "1:1"));
        assert_eq!(suggest_size(1000, 562), ("1024x1024", "16:9"));
        assert_eq!(suggest_size(600, 1100), ("2048x2048", "9:16"));
        assert_eq!(suggest_size(400, 300).1, "4:3");
        assert_eq!(suggest_size(0, 10).1, "auto");
    }

    #[test]
    fn cover_fills_and_contain_letterboxes() {
        let wide = DynamicImage::ImageRgba8(RgbaImage::from_pixel(200, 100, Rgba([9, 9, 9, 255])));
        let cover = resize_cover(&wide, 50, 50);
        assert_eq!(cover.dimensions(), (50, 50));
        assert!(cover.pixels().all(|p| p[3] == 255));

        let contain = resize_contain(&wide, 50, 50);
        assert_eq!(contain.dimensions(), (50, 50));
        assert_eq!(contain.get_pixel(25, 2)[3], 0);
        assert_eq!(contain.get_pixel(25, 25)[3], 255);
    }

    struct Solid {
        prompts: Mutex<Vec<String>>,
    }

    impl ImageGenerator for Solid {
        fn generate(&self, prompt: &str, source: Option<&DynamicImage>, mask: Option<&GrayImage>) -> Result<DynamicImage, ServiceError> {
            let source = source.ok_or_else(|| ServiceError::Engine("no source".into()))?;
            assert_eq!(mask.map(|m| m.dimensions()), Some(source.dimensions()));
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 32, Rgba([0, 0, 255, 255]))))
        }
    }

    struct Refuses;

    impl ImageGenerator for Refuses {
        fn generate(&self, _: &str, _: Option<&DynamicImage>, _: Option<&GrayImage>) -> Result<DynamicImage, ServiceError> {
            Err(ServiceError::Status { code: 401, body: "bad key".into() })
        }
    }

    fn session() -> EditorSession {
        let store = Arc::new(MemoryImageStore::new());
        EditorSession::new_with_pages(vec![Page::blank(100, 80)], EditorSettings::default(), store)
    }

    #[test]
    fn generated_region_becomes_a_layer() {
        let mut s = session();
        let generator = Solid { prompts: Mutex::new(Vec::new()) };
        assert!(replace_region(&mut s, &generator, " a blue sky ", (10, 20, 50, 40)));
        assert_eq!(generator.prompts.lock().unwrap().as_slice(), &["a blue sky".to_string()]);

        let layer = &s.layers[0];
        assert_eq!((layer.x, layer.y), (10, 20));
        assert_eq!(s.store.load_rgba(&layer.path).unwrap().dimensions(), (40, 20));
        let shown = s.composite_current();
        assert_eq!(shown.get_pixel(30, 30).0, [0, 0, 255]);
        assert_eq!(shown.get_pixel(5, 5).0, [255, 255, 255]);
        s.undo();
        assert!(s.layers.is_empty());
    }

    #[test]
    fn failed_generation_changes_nothing() {
        let mut s = session();
        let history = s.history.len();
        assert!(!replace_region(&mut s, &Refuses, "sky", (0, 0, 10, 10)));
        assert!(s.layers.is_empty());
        assert_eq!(s.history.len(), history);
        assert!(matches!(s.take_notices().last(), Some(Notice::Error(_))));

        assert!(!replace_region(&mut s, &Refuses, "   ", (0, 0, 10, 10)));
        assert!(!replace_region(&mut s, &Refuses, "sky", (200, 200, 300, 300)));
        assert!(s.take_notices().iter().all(|n| matches!(n, Notice::Warning(_))));
    }

    #[test]
    fn generator_needs_a_key() {
        let settings = EditorSettings::default();
        assert!(matches!(HttpImageGenerator::from_settings(&settings), Err(ServiceError::Disabled(_))));
        let settings = EditorSettings { ai_api_key: "k".into(), ai_api_url: "https://api.test/v1/".into(), ..Default::default() };
        let generator = HttpImageGenerator::from_settings(&settings).unwrap();
        assert_eq!(generator.endpoint(), "https://api.test/v1/chat/completions");
    }
}
