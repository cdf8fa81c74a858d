// ============================================================================
// OCR - text detection/recognition engines feed text boxes
// ============================================================================

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use image::imageops;
use image::{DynamicImage, RgbaImage};
use serde::Deserialize;
use uuid::Uuid;

use crate::components::history::OperationKind;
use crate::ops::ServiceError;
use crate::ops::text::{FontLookup, fit_text_box};
use crate::session::{EditorSession, Notice};
use crate::settings::EditorSettings;
use crate::textbox::TextBox;
use crate::worker::{TempImage, UiPoster, spawn_worker};

/// Fraction of a box's width added on each side before re-recognition.
pub const EXPAND_W: f32 = 0.1;
/// Fraction of a box's height added above and below.
pub const EXPAND_H: f32 = 0.3;

/// One recognized line: its text and outline in image pixels.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct OcrLine {
    pub text: String,
    #[serde(default)]
    pub polygon: Vec<(f32, f32)>,
}

impl OcrLine {
    pub fn new(text: impl Into<String>, polygon: Vec<(f32, f32)>) -> Self {
        Self { text: text.into(), polygon }
    }

    /// Axis-aligned `(x, y, width, height)` of the polygon.
    pub fn bbox(&self) -> Option<(f32, f32, f32, f32)> {
        let first = self.polygon.first()?;
        let (mut x0, mut y0, mut x1, mut y1) = (first.0, first.1, first.0, first.1);
        for &(x, y) in &self.polygon[1..] {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let (w, h) = (x1 - x0, y1 - y0);
        (w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0).then_some((x0, y0, w, h))
    }
}

pub trait OcrEngine {
    fn recognize(&self, image: &RgbaImage) -> Result<Vec<OcrLine>, ServiceError>;
}

/// Runs an external recognizer: `program [args...] <image.png>`. Standard
/// output is JSON, either a list of `{text, polygon}` objects or
/// PaddleOCR-style `{rec_texts, dt_polys}` (optionally wrapped in a list).
pub struct CommandOcrEngine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandOcrEngine {
    /// Build the engine from `ocr_command` (program plus optional leading
    /// arguments, whitespace separated) and `ocr_device`.
    pub fn from_settings(settings: &EditorSettings) -> Result<Self, ServiceError> {
        let mut parts = settings.ocr_command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(ServiceError::Disabled("Text recognition (no ocr_command configured)".into()));
        };
        let mut args: Vec<String> = parts.map(str::to_string).collect();
        args.push("--device".to_string());
        args.push(settings.ocr_device.clone());
        Ok(Self { program: PathBuf::from(program), args })
    }
}

#[derive(Deserialize)]
struct PaddleResult {
    #[serde(default)]
    rec_texts: Vec<String>,
    #[serde(default)]
    dt_polys: Vec<Vec<[f32; 2]>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OcrOutput {
    Lines(Vec<OcrLine>),
    Paddle(PaddleResult),
    PaddleList(Vec<PaddleResult>),
}

/// Parse the JSON printed by a recognizer.
pub fn parse_ocr_output(json: &str) -> Result<Vec<OcrLine>, ServiceError> {
    let from_paddle = |r: PaddleResult| {
        let mut polys = r.dt_polys.into_iter();
        r.rec_texts
            .into_iter()
            .map(|text| {
                let polygon = polys.next().unwrap_or_default().into_iter().map(|[x, y]| (x, y)).collect();
                OcrLine { text, polygon }
            })
            .collect::<Vec<_>>()
    };
    Ok(match serde_json::from_str::<OcrOutput>(json.trim())? {
        OcrOutput::Lines(lines) => lines,
        OcrOutput::Paddle(r) => from_paddle(r),
        OcrOutput::PaddleList(list) => list.into_iter().flat_map(from_paddle).collect(),
    })
}

impl OcrEngine for CommandOcrEngine {
    fn recognize(&self, image: &RgbaImage) -> Result<Vec<OcrLine>, ServiceError> {
        let tmp = TempImage::write_png(&DynamicImage::ImageRgba8(image.clone()))
            .map_err(|e| ServiceError::Engine(format!("could not write crop: {}", e)))?;
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(tmp.path())
            .output()
            .map_err(|e| ServiceError::Engine(format!("could not run {}: {}", self.program.display(), e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Engine(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                crate::ops::truncate_body(stderr.trim(), 200)
            )));
        }
        parse_ocr_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Detect text on the current page and add one box per recognized line,
/// sized to fit. Returns the number of boxes added.
pub fn populate_text_boxes(session: &mut EditorSession, engine: &dyn OcrEngine, fonts: &dyn FontLookup) -> usize {
    let image = session.current_page().base.as_ref().clone();
    let lines = match engine.recognize(&image) {
        Ok(lines) => lines,
        Err(e) => {
            session.notify(Notice::Error(format!("Text detection failed: {}", e)));
            return 0;
        }
    };

    let font_name = session.settings.default_font_name.clone();
    let boxes: Vec<TextBox> = lines
        .iter()
        .filter(|line| !line.text.trim().is_empty())
        .filter_map(|line| {
            let (x, y, w, h) = line.bbox()?;
            let mut tb = TextBox::new(x.round(), y.round(), w.round(), h.round(), line.text.trim()).ok()?;
            tb.font_name = font_name.clone();
            let size = fit_text_box(&tb, fonts);
            tb.set_font_size(size).ok()?;
            Some(tb)
        })
        .collect();

    if boxes.is_empty() {
        session.notify(Notice::Warning("No text found on this page".into()));
        return 0;
    }
    let added = boxes.len();
    session.save_state(OperationKind::TextBoxes);
    session.text_boxes.extend(boxes);
    session.save_current_page();
    session.mark_dirty();
    session.notify(Notice::Status(format!("Detected {} text boxes", added)));
    added
}

/// Crop of the page around a box, grown by [`EXPAND_W`]/[`EXPAND_H`] and
/// clamped to the image.
pub fn expanded_crop(image: &RgbaImage, tb: &TextBox) -> Option<RgbaImage> {
    let (iw, ih) = (image.width() as f32, image.height() as f32);
    let (x, y, w, h) = (tb.x.floor(), tb.y.floor(), tb.width.floor(), tb.height.floor());
    let (ew, eh) = ((w * EXPAND_W).floor(), (h * EXPAND_H).floor());
    let x0 = (x - ew).clamp(0.0, iw);
    let y0 = (y - eh).clamp(0.0, ih);
    let x1 = (x + w + ew).clamp(0.0, iw);
    let y1 = (y + h + eh).clamp(0.0, ih);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }
    Some(imageops::crop_imm(image, x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32).to_image())
}

fn read_box(engine: &dyn OcrEngine, crop: &RgbaImage) -> Result<String, ServiceError> {
    let lines = engine.recognize(crop)?;
    Ok(lines.iter().map(|l| l.text.as_str()).collect::<String>().trim().to_string())
}

fn set_text_and_fit(session: &mut EditorSession, index: usize, text: String, fonts: &dyn FontLookup) {
    let mut candidate = session.text_boxes[index].clone();
    candidate.text = text;
    let size = fit_text_box(&candidate, fonts);
    session.update_text_box(index, move |b| {
        b.text = candidate.text;
        if let Err(e) = b.set_font_size(size) {
            crate::log_warn!("ocr: keeping font size: {}", e);
        }
    });
}

/// Re-read the text inside one box and refit its font size.
pub fn recognize_box(session: &mut EditorSession, engine: &dyn OcrEngine, index: usize, fonts: &dyn FontLookup) -> bool {
    let Some(tb) = session.text_boxes.get(index) else {
        session.notify(Notice::Warning("Select a text box first".into()));
        return false;
    };
    let Some(crop) = expanded_crop(&session.current_page().base, tb) else {
        session.notify(Notice::Warning("The text box is outside the page".into()));
        return false;
    };
    match read_box(engine, &crop) {
        Ok(text) if !text.is_empty() => {
            set_text_and_fit(session, index, text, fonts);
            session.notify(Notice::Status(format!("Recognized text in box {}", index + 1)));
            true
        }
        Ok(_) => {
            session.notify(Notice::Warning("No text recognized".into()));
            false
        }
        Err(e) => {
            session.notify(Notice::Error(format!("Recognition failed: {}", e)));
            false
        }
    }
}

/// Run detection on every page that has no text boxes yet, as done after
/// importing images. The current page is restored afterwards. Returns the
/// total number of boxes added.
pub fn populate_all_pages(session: &mut EditorSession, engine: &dyn OcrEngine, fonts: &dyn FontLookup) -> usize {
    let current = session.current_page_index;
    let mut added = 0;
    for index in 0..session.page_count() {
        session.go_to_page(index);
        if session.text_boxes.is_empty() {
            added += populate_text_boxes(session, engine, fonts);
        }
    }
    session.go_to_page(current);
    session.save_current_page();
    crate::log_info!("text detection added {} box(es) across {} page(s)", added, session.page_count());
    added
}

/// Fill every box that has no text yet. Engine errors on individual boxes
/// are logged and skipped. Returns the number of boxes filled.
pub fn recognize_empty_boxes(session: &mut EditorSession, engine: &dyn OcrEngine, fonts: &dyn FontLookup) -> usize {
    let base = Arc::clone(&session.current_page().base);
    let mut updated = session.text_boxes.clone();
    let mut filled = 0;
    for (i, tb) in updated.iter_mut().enumerate() {
        if !tb.text.is_empty() {
            continue;
        }
        let Some(crop) = expanded_crop(&base, tb) else { continue };
        match read_box(engine, &crop) {
            Ok(text) if !text.is_empty() => {
                tb.text = text;
                let size = fit_text_box(tb, fonts);
                if tb.set_font_size(size).is_ok() {
                    filled += 1;
                }
            }
            Ok(_) => {}
            Err(e) => crate::log_warn!("ocr: box {} skipped: {}", i + 1, e),
        }
    }
    if filled > 0 {
        session.save_state(OperationKind::TextBoxes);
        session.text_boxes = updated;
        session.save_current_page();
        session.mark_dirty();
    }
    session.notify(Notice::Status(format!("Recognized {} text boxes", filled)));
    filled
}

/// Recognize one box on a worker thread. The result is applied only if the
/// box is still where it was when recognition started.
pub fn start_recognize_box(
    session: &mut EditorSession,
    engine: Arc<dyn OcrEngine + Send + Sync>,
    fonts: Arc<dyn FontLookup + Send + Sync>,
    poster: &UiPoster,
    index: usize,
) -> bool {
    let Some(tb) = session.text_boxes.get(index).cloned() else {
        session.notify(Notice::Warning("Select a text box first".into()));
        return false;
    };
    let Some(crop) = expanded_crop(&session.current_page().base, &tb) else {
        session.notify(Notice::Warning("The text box is outside the page".into()));
        return false;
    };
    let page_id: Uuid = session.current_page().id;
    session.notify(Notice::Status(format!("Recognizing box {}...", index + 1)));

    let spawned = spawn_worker("ocr", poster.clone(), move |poster, _| {
        let result = read_box(engine.as_ref(), &crop);
        poster.post(move |s| {
            let text = match result {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => return s.notify(Notice::Warning("No text recognized".into())),
                Err(e) => return s.notify(Notice::Error(format!("Recognition failed: {}", e))),
            };
            let unchanged = s.current_page().id == page_id
                && s.text_boxes.get(index).is_some_and(|b| {
                    (b.x, b.y, b.width, b.height) == (tb.x, tb.y, tb.width, tb.height)
                });
            if !unchanged {
                s.notify(Notice::Warning("The text box changed while it was being read".into()));
                return;
            }
            set_text_and_fit(s, index, text, fonts.as_ref());
            s.notify(Notice::Status(format!("Recognized text in box {}", index + 1)));
        });
    });
    if let Err(e) = spawned {
        session.notify(Notice::Error(format!("Could not start recognition: {}", e)));
        return false;
    }
    true
}
