use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage, RgbaImage};
use uuid::Uuid;

use crate::canvas::{ImageStore, Layer, Page};
use crate::components::history::{HistoryEntry, HistoryManager, HistoryPayload, OperationKind};
use crate::compositor::{self, CompositeCache};
use crate::io::{self, ProjectError};
use crate::ops::mask::{self, MaskStroke};
use crate::settings::EditorSettings;
use crate::textbox::TextBox;

/// Size of the page created when a session would otherwise start empty.
pub const DEFAULT_PAGE_SIZE: (u32, u32) = (1920, 1080);
pub const DEFAULT_MASK_BRUSH: u32 = 20;

/// A user-visible message. A GUI shows these as status-bar text or dialogs.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    Status(String),
    Warning(String),
    Error(String),
}

impl Notice {
    pub fn text(&self) -> &str {
        match self {
            Notice::Status(s) | Notice::Warning(s) | Notice::Error(s) => s,
        }
    }
}

/// Aggregate outcome of an all-pages operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// The open document: pages, the active page's editing buffers, history and
/// user-facing state. All mutation happens on the UI thread.
pub struct EditorSession {
    pub pages: Vec<Page>,
    pub current_page_index: usize,

    // Active buffers for pages[current_page_index]
    pub text_boxes: Vec<TextBox>,
    pub layers: Vec<Layer>,
    pub bg_path: Option<PathBuf>,

    pub selected_box: Option<usize>,
    /// Id of the selected layer
    pub selected_layer: Option<String>,

    // Freehand repair mask
    pub mask_strokes: Vec<MaskStroke>,
    pub mask_mode: bool,
    pub mask_brush_size: u32,
    pub mask: Option<GrayImage>,
    pending_stroke: Option<MaskStroke>,

    pub history: HistoryManager,
    pub settings: EditorSettings,
    pub store: Arc<dyn ImageStore + Send + Sync>,
    /// Where generated images (backgrounds, repair and AI layers) are written
    pub work_dir: PathBuf,
    pub autosave_dir: PathBuf,
    last_autosave: Instant,
    composites: CompositeCache,

    notices: Vec<Notice>,
    pub is_dirty: bool,
    /// `None` until the project has been saved or opened
    pub path: Option<PathBuf>,
    pub name: String,
}

impl EditorSession {
    pub fn new_with_pages(
        mut pages: Vec<Page>,
        settings: EditorSettings,
        store: Arc<dyn ImageStore + Send + Sync>,
    ) -> Self {
        if pages.is_empty() {
            pages.push(Page::blank(DEFAULT_PAGE_SIZE.0, DEFAULT_PAGE_SIZE.1));
        }
        let history = HistoryManager::new(settings.history_capacity);
        let mut session = Self {
            pages,
            current_page_index: 0,
            text_boxes: Vec::new(),
            layers: Vec::new(),
            bg_path: None,
            selected_box: None,
            selected_layer: None,
            mask_strokes: Vec::new(),
            mask_mode: false,
            mask_brush_size: DEFAULT_MASK_BRUSH,
            mask: None,
            pending_stroke: None,
            history,
            settings,
            store,
            work_dir: crate::logger::data_dir().join("SlideFE").join("work"),
            autosave_dir: io::autosave_dir(),
            last_autosave: Instant::now(),
            composites: CompositeCache::new(),
            notices: Vec::new(),
            is_dirty: false,
            path: None,
            name: "Untitled".to_string(),
        };
        session.load_current_page();
        session
    }

    // ========================================================================
    // NOTICES / TITLE
    // ========================================================================

    pub fn notify(&mut self, notice: Notice) {
        match &notice {
            Notice::Status(msg) => crate::log_info!("{}", msg),
            Notice::Warning(msg) => crate::log_warn!("{}", msg),
            Notice::Error(msg) => crate::log_err!("{}", msg),
        }
        self.notices.push(notice);
    }

    fn status(&mut self, msg: impl Into<String>) {
        self.notify(Notice::Status(msg.into()));
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.notify(Notice::Warning(msg.into()));
    }

    /// Drain pending notices (oldest first).
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn update_name_from_path(&mut self) {
        if let Some(ref path) = self.path {
            self.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Untitled".to_string());
        }
    }

    // ========================================================================
    // PAGE STORE <-> ACTIVE BUFFERS
    // ========================================================================

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn current_page(&self) -> &Page {
        &self.pages[self.current_page_index]
    }

    /// Copy the active buffers back into the current page.
    pub fn save_current_page(&mut self) {
        let Some(page) = self.pages.get_mut(self.current_page_index) else { return };
        page.text_boxes = self.text_boxes.clone();
        page.bg_path = self.bg_path.clone();
        page.layers = self.layers.clone();
        page.touch();
    }

    /// Replace the active buffers with the current page's stored state and
    /// reset selection. Mask strokes belong to the page being shown, so they
    /// are cleared too.
    pub fn load_current_page(&mut self) {
        let Some(page) = self.pages.get(self.current_page_index) else { return };
        self.text_boxes = page.text_boxes.clone();
        self.bg_path = page.bg_path.clone();
        self.layers = page.layers.clone();
        self.selected_box = None;
        self.selected_layer = None;
        self.mask_strokes.clear();
        self.pending_stroke = None;
        self.mask = None;
        if self.mask_mode {
            self.rebuild_mask();
        }
    }

    /// Composite what the user currently sees on the active page.
    pub fn composite_current(&self) -> RgbImage {
        compositor::flatten(self.composite_current_rgba())
    }

    pub fn composite_current_rgba(&self) -> RgbaImage {
        let page = self.current_page();
        compositor::composite_layers(&page.base, self.bg_path.as_deref(), &self.layers, self.store.as_ref())
    }

    /// Page-strip preview. Composites are cached per page generation, so
    /// unchanged pages are not re-rendered.
    pub fn page_thumbnail(&mut self, index: usize) -> Option<RgbImage> {
        if index == self.current_page_index {
            let page = self.current_page();
            if page.layers != self.layers || page.bg_path != self.bg_path {
                self.save_current_page();
            }
        }
        let page = self.pages.get(index)?;
        let full = self.composites.get_or_render(page, self.store.as_ref());
        Some(compositor::fit_thumbnail(&full, compositor::THUMBNAIL_MAX.0, compositor::THUMBNAIL_MAX.1))
    }

    /// Fresh path in the work directory for a generated image.
    pub fn generated_path(&self, prefix: &str) -> PathBuf {
        self.work_dir.join(format!("{}_{}.png", prefix, Uuid::new_v4().simple()))
    }

    // ========================================================================
    // NAVIGATION
    // ========================================================================

    pub fn go_to_page(&mut self, index: usize) -> bool {
        if index >= self.pages.len() || index == self.current_page_index {
            return false;
        }
        self.save_current_page();
        self.current_page_index = index;
        self.load_current_page();
        true
    }

    pub fn prev_page(&mut self) -> bool {
        match self.current_page_index.checked_sub(1) {
            Some(i) => self.go_to_page(i),
            None => false,
        }
    }

    pub fn next_page(&mut self) -> bool {
        self.go_to_page(self.current_page_index + 1)
    }

    /// Append a page; returns its index. The current page does not change.
    pub fn add_page(&mut self, page: Page) -> usize {
        self.pages.push(page);
        self.mark_dirty();
        self.pages.len() - 1
    }

    pub fn add_blank_page(&mut self, width: u32, height: u32) -> usize {
        let index = self.add_page(Page::blank(width, height));
        self.status(format!("Added blank page {}", index + 1));
        index
    }

    /// Move a page to a new position; the current page follows its content.
    pub fn move_page(&mut self, from: usize, to: usize) -> bool {
        let len = self.pages.len();
        if from >= len || to >= len || from == to {
            return false;
        }
        self.save_current_page();
        let current_id = self.pages[self.current_page_index].id;
        let page = self.pages.remove(from);
        self.pages.insert(to, page);
        self.current_page_index = self.pages.iter().position(|p| p.id == current_id).unwrap_or(0);
        self.history.remap_pages(|i| reorder_index(i, from, to));
        self.mark_dirty();
        true
    }

    /// Remove a page. The last remaining page cannot be deleted.
    pub fn delete_page(&mut self, index: usize) -> bool {
        if index >= self.pages.len() {
            return false;
        }
        if self.pages.len() <= 1 {
            self.warn("At least one page must remain");
            return false;
        }
        self.save_current_page();
        let removed = self.pages.remove(index);
        self.composites.invalidate(removed.id);
        if self.current_page_index >= self.pages.len() {
            self.current_page_index = self.pages.len() - 1;
        } else if self.current_page_index > index {
            self.current_page_index -= 1;
        }
        self.history.forget_page(index);
        self.load_current_page();
        self.mark_dirty();
        let remaining = self.pages.len();
        self.status(format!("Deleted page, {} remaining", remaining));
        true
    }

    // ========================================================================
    // BACKGROUNDS
    // ========================================================================

    /// Use an image file as page `index`'s background. The image is resized to
    /// the page's base size and the resized copy is what the page refers to.
    pub fn set_page_background(&mut self, index: usize, source: &Path) -> Result<PathBuf, String> {
        let Some(page) = self.pages.get(index) else {
            return Err(format!("no page {}", index + 1));
        };
        let (w, h) = page.size();
        let Some(img) = self.store.load_rgba(source) else {
            let msg = format!("Could not load background image {}", source.display());
            self.notify(Notice::Error(msg.clone()));
            return Err(msg);
        };
        let resized = if img.dimensions() == (w, h) {
            img.as_ref().clone()
        } else {
            imageops::resize(img.as_ref(), w, h, FilterType::Lanczos3)
        };
        let target = self.generated_path("bg");
        if let Err(e) = self.store.save_rgba(&target, resized) {
            self.notify(Notice::Error(format!("Could not store background: {}", e)));
            return Err(e);
        }
        self.replace_background(index, Some(target.clone()));
        if let Some(page) = self.pages.get_mut(index) {
            page.bg_original_path = Some(source.to_path_buf());
        }
        self.status(format!("Background set for page {}", index + 1));
        Ok(target)
    }

    pub fn clear_page_background(&mut self, index: usize) -> bool {
        if index >= self.pages.len() {
            return false;
        }
        self.replace_background(index, None);
        if let Some(page) = self.pages.get_mut(index) {
            page.bg_original_path = None;
        }
        self.status(format!("Background cleared for page {}", index + 1));
        true
    }

    /// Swap page `index`'s background, recording an undoable entry.
    pub fn replace_background(&mut self, index: usize, new_bg: Option<PathBuf>) {
        let old = if index == self.current_page_index {
            self.bg_path.clone()
        } else {
            self.pages.get(index).and_then(|p| p.bg_path.clone())
        };
        self.history.push(HistoryEntry::new(
            index,
            HistoryPayload::Background { old_bg_path: old, new_bg_path: new_bg.clone() },
        ));
        if index == self.current_page_index {
            self.bg_path = new_bg.clone();
        }
        if let Some(page) = self.pages.get_mut(index) {
            page.bg_path = new_bg;
            page.touch();
        }
        self.mark_dirty();
    }

    // ========================================================================
    // HISTORY
    // ========================================================================

    /// Snapshot the active state for `kind` before mutating it.
    pub fn save_state(&mut self, kind: OperationKind) {
        let payload = self.capture(kind);
        self.history.push(HistoryEntry::new(self.current_page_index, payload));
    }

    /// Record a background change on the current page.
    pub fn save_background_state(&mut self, old: Option<PathBuf>, new: Option<PathBuf>) {
        self.history.push(HistoryEntry::new(
            self.current_page_index,
            HistoryPayload::Background { old_bg_path: old, new_bg_path: new },
        ));
    }

    fn capture(&mut self, kind: OperationKind) -> HistoryPayload {
        match kind {
            OperationKind::TextBoxes => HistoryPayload::TextBoxes(self.text_boxes.clone()),
            OperationKind::Background => HistoryPayload::Background {
                old_bg_path: self.bg_path.clone(),
                new_bg_path: None,
            },
            OperationKind::InpaintStroke => HistoryPayload::InpaintStroke {
                stroke: None,
                mask_state: self.mask_strokes.clone(),
            },
            OperationKind::Layers => HistoryPayload::Layers(self.layers.clone()),
            OperationKind::PagesLayers => {
                self.save_current_page();
                HistoryPayload::PagesLayers(self.pages.iter().map(|p| p.layers.clone()).collect())
            }
        }
    }

    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.history.peek_undo().cloned() else {
            self.status("Nothing to undo");
            return false;
        };
        let displaced = self.restore(&entry);
        self.history.commit_undo(displaced);
        self.status(format!("Undo: {}", entry.kind().label()));
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(entry) = self.history.peek_redo().cloned() else {
            self.status("Nothing to redo");
            return false;
        };
        let displaced = self.restore(&entry);
        self.history.commit_redo(displaced);
        self.status(format!("Redo: {}", entry.kind().label()));
        true
    }

    /// Apply `entry` and return the live state it replaced.
    fn restore(&mut self, entry: &HistoryEntry) -> HistoryPayload {
        if entry.page_index != self.current_page_index {
            if entry.page_index >= self.pages.len() {
                crate::log_warn!("history entry refers to missing page {}", entry.page_index);
                return entry.payload.clone();
            }
            self.save_current_page();
            self.current_page_index = entry.page_index;
            self.load_current_page();
        }

        let displaced = match &entry.payload {
            HistoryPayload::TextBoxes(boxes) => {
                self.selected_box = None;
                HistoryPayload::TextBoxes(std::mem::replace(&mut self.text_boxes, boxes.clone()))
            }
            HistoryPayload::Background { old_bg_path, .. } => {
                let target = match old_bg_path {
                    Some(p) if self.store.exists(p) => Some(p.clone()),
                    Some(p) => {
                        crate::log_warn!("background {} no longer exists, using base image", p.display());
                        None
                    }
                    None => None,
                };
                let live = std::mem::replace(&mut self.bg_path, target.clone());
                HistoryPayload::Background { old_bg_path: live, new_bg_path: target }
            }
            HistoryPayload::InpaintStroke { stroke, mask_state } => {
                let live = std::mem::replace(&mut self.mask_strokes, mask_state.clone());
                self.pending_stroke = None;
                if self.mask_mode {
                    self.rebuild_mask();
                }
                HistoryPayload::InpaintStroke { stroke: stroke.clone(), mask_state: live }
            }
            HistoryPayload::Layers(layers) => {
                let live = std::mem::replace(&mut self.layers, layers.clone());
                self.validate_layer_selection();
                HistoryPayload::Layers(live)
            }
            HistoryPayload::PagesLayers(all) => {
                self.save_current_page();
                if all.len() != self.pages.len() {
                    crate::log_warn!(
                        "all-pages snapshot has {} pages, session has {}; skipping",
                        all.len(),
                        self.pages.len()
                    );
                    entry.payload.clone()
                } else {
                    let live = self
                        .pages
                        .iter_mut()
                        .zip(all.iter())
                        .map(|(page, layers)| {
                            page.touch();
                            std::mem::replace(&mut page.layers, layers.clone())
                        })
                        .collect();
                    self.layers = self.pages[self.current_page_index].layers.clone();
                    self.validate_layer_selection();
                    HistoryPayload::PagesLayers(live)
                }
            }
        };

        self.save_current_page();
        self.mark_dirty();
        displaced
    }

    fn validate_layer_selection(&mut self) {
        if let Some(id) = &self.selected_layer
            && !self.layers.iter().any(|l| &l.id == id)
        {
            self.selected_layer = None;
        }
    }

    // ========================================================================
    // TEXT BOXES
    // ========================================================================

    pub fn add_text_box(&mut self, text_box: TextBox) -> usize {
        self.save_state(OperationKind::TextBoxes);
        self.text_boxes.push(text_box);
        let index = self.text_boxes.len() - 1;
        self.selected_box = Some(index);
        self.mark_dirty();
        index
    }

    pub fn delete_text_box(&mut self, index: usize) -> bool {
        if index >= self.text_boxes.len() {
            return false;
        }
        self.save_state(OperationKind::TextBoxes);
        self.text_boxes.remove(index);
        self.selected_box = match self.selected_box {
            Some(s) if s == index => None,
            Some(s) if s > index => Some(s - 1),
            other => other,
        };
        self.mark_dirty();
        true
    }

    /// Edit one text box in place (property panel, drag, resize).
    pub fn update_text_box(&mut self, index: usize, edit: impl FnOnce(&mut TextBox)) -> bool {
        if index >= self.text_boxes.len() {
            return false;
        }
        self.save_state(OperationKind::TextBoxes);
        edit(&mut self.text_boxes[index]);
        self.mark_dirty();
        true
    }

    pub fn select_box_at(&mut self, x: f32, y: f32) -> Option<usize> {
        self.selected_box = self.text_boxes.iter().rposition(|b| b.contains_point(x, y));
        self.selected_box
    }

    // ========================================================================
    // REPAIR MASK
    // ========================================================================

    pub fn set_mask_mode(&mut self, on: bool) {
        self.mask_mode = on;
        if on {
            self.rebuild_mask();
        } else {
            self.mask_strokes.clear();
            self.pending_stroke = None;
            self.mask = None;
        }
    }

    /// Rasterize all committed strokes at the page's size.
    pub fn rebuild_mask(&mut self) {
        let (w, h) = self.current_page().size();
        let mut mask = mask::rasterize(&self.mask_strokes, w, h);
        if let Some(pending) = &self.pending_stroke {
            pending.draw(&mut mask);
        }
        self.mask = Some(mask);
    }

    fn mask_mut(&mut self) -> &mut GrayImage {
        let (w, h) = self.current_page().size();
        self.mask.get_or_insert_with(|| GrayImage::new(w, h))
    }

    pub fn begin_mask_stroke(&mut self, x: i32, y: i32) {
        let size = self.mask_brush_size.max(1);
        let stroke = MaskStroke::Brush { points: vec![(x, y)], size };
        mask::stamp_disc(self.mask_mut(), x, y, size);
        self.pending_stroke = Some(stroke);
    }

    pub fn extend_mask_stroke(&mut self, x: i32, y: i32) {
        let Some(MaskStroke::Brush { points, size }) = &mut self.pending_stroke else { return };
        let last = points.last().copied().unwrap_or((x, y));
        points.push((x, y));
        let size = *size;
        mask::stroke_segment(self.mask_mut(), last, (x, y), size);
    }

    /// Finish the current brush stroke and make it undoable.
    pub fn commit_mask_stroke(&mut self) -> bool {
        let Some(stroke) = self.pending_stroke.take() else { return false };
        self.history.push(HistoryEntry::new(
            self.current_page_index,
            HistoryPayload::InpaintStroke { stroke: Some(stroke.clone()), mask_state: self.mask_strokes.clone() },
        ));
        self.mask_strokes.push(stroke);
        true
    }

    pub fn add_mask_rect(&mut self, ax: i32, ay: i32, bx: i32, by: i32) {
        let stroke = MaskStroke::rect(ax, ay, bx, by);
        self.history.push(HistoryEntry::new(
            self.current_page_index,
            HistoryPayload::InpaintStroke { stroke: Some(stroke.clone()), mask_state: self.mask_strokes.clone() },
        ));
        stroke.draw(self.mask_mut());
        self.mask_strokes.push(stroke);
    }

    pub fn clear_mask(&mut self) -> bool {
        if self.mask_strokes.is_empty() && self.pending_stroke.is_none() {
            return false;
        }
        self.save_state(OperationKind::InpaintStroke);
        self.mask_strokes.clear();
        self.pending_stroke = None;
        self.rebuild_mask();
        self.status("Cleared all mask strokes");
        true
    }

    /// The mask built from committed strokes, or `None` when nothing is painted.
    pub fn current_mask(&self) -> Option<GrayImage> {
        let (w, h) = self.current_page().size();
        let mask = mask::rasterize(&self.mask_strokes, w, h);
        (!mask::is_blank(&mask)).then_some(mask)
    }

    // ========================================================================
    // BATCH
    // ========================================================================

    /// Run `op` on every page. Per-page failures are logged and skipped; the
    /// layer state of all pages is undoable as one step.
    pub fn apply_to_all_pages<F>(&mut self, label: &str, mut op: F) -> BatchReport
    where
        F: FnMut(usize, &mut Page, &dyn ImageStore) -> Result<(), String>,
    {
        self.save_state(OperationKind::PagesLayers);
        let mut report = BatchReport::default();
        let store = Arc::clone(&self.store);
        for (i, page) in self.pages.iter_mut().enumerate() {
            match op(i, page, store.as_ref()) {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    crate::log_warn!("{}: page {} failed: {}", label, i + 1, e);
                    report.failed += 1;
                }
            }
            page.touch();
        }
        let page = &self.pages[self.current_page_index];
        self.text_boxes = page.text_boxes.clone();
        self.bg_path = page.bg_path.clone();
        self.layers = page.layers.clone();
        self.validate_layer_selection();
        self.mark_dirty();
        self.status(format!("{}: {} succeeded, {} failed", label, report.succeeded, report.failed));
        report
    }

    // ========================================================================
    // PROJECT FILES
    // ========================================================================

    /// Replace the session's pages with a project file's. On failure the
    /// session is left untouched.
    pub fn open_project(&mut self, path: &Path) -> Result<(), ProjectError> {
        let loaded = match io::load_project(path, self.settings.max_edit_edge) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.notify(Notice::Error(format!("Could not open {}: {}", path.display(), e)));
                return Err(e);
            }
        };
        self.pages = loaded.pages;
        self.current_page_index = loaded.current_page;
        self.history.clear();
        self.composites.clear();
        self.load_current_page();
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.mark_clean();
        let count = self.pages.len();
        self.status(format!("Opened {} ({} pages)", path.display(), count));
        Ok(())
    }

    pub fn save_project(&mut self, path: &Path) -> Result<(), ProjectError> {
        self.save_current_page();
        if let Err(e) = io::save_project(self, path) {
            self.notify(Notice::Error(format!("Could not save {}: {}", path.display(), e)));
            return Err(e);
        }
        self.path = Some(path.to_path_buf());
        self.update_name_from_path();
        self.mark_clean();
        self.status(format!("Saved {}", path.display()));
        Ok(())
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.settings.autosave_interval.max(1))
    }

    /// Write an autosave if autosaving is enabled, the document has unsaved
    /// changes and `autosave_interval` has passed since the last attempt.
    /// A GUI calls this from its frame loop.
    pub fn autosave_if_due(&mut self, now: Instant) -> Option<PathBuf> {
        if !self.settings.autosave_enabled || !self.is_dirty {
            return None;
        }
        if now.saturating_duration_since(self.last_autosave) < self.autosave_interval() {
            return None;
        }
        self.last_autosave = now;
        let dir = self.autosave_dir.clone();
        let keep = self.settings.autosave_keep;
        match io::write_autosave(self, &dir, keep) {
            Ok(path) => Some(path),
            Err(e) => {
                self.warn(format!("Autosave failed: {}", e));
                None
            }
        }
    }
}

/// Where index `i` lands after moving the element at `from` to `to`.
fn reorder_index(i: usize, from: usize, to: usize) -> usize {
    if i == from {
        to
    } else if from < to && i > from && i <= to {
        i - 1
    } else if to < from && i >= to && i < from {
        i + 1
    } else {
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::MemoryImageStore;
    use image::Rgba;

    fn session(pages: usize) -> (EditorSession, Arc<MemoryImageStore>) {
        let store = Arc::new(MemoryImageStore::new());
        let pages = (0..pages)
            .map(|i| Page::new(format!("p{}.png", i), RgbaImage::new(40, 30), (40, 30), 1.0))
            .collect();
        let s = EditorSession::new_with_pages(pages, EditorSettings::default(), store.clone());
        (s, store)
    }

    fn tb(text: &str) -> TextBox {
        TextBox::new(10.0, 10.0, 100.0, 20.0, text).unwrap()
    }

    #[test]
    fn undo_restores_text_after_edit() {
        let (mut s, _) = session(1);
        s.text_boxes = vec![tb("A")];
        s.save_state(OperationKind::TextBoxes);
        s.text_boxes[0].text = "B".to_string();
        assert!(s.undo());
        assert_eq!(s.text_boxes.len(), 1);
        assert_eq!(s.text_boxes[0].text, "A");
        assert!(s.redo());
        assert_eq!(s.text_boxes[0].text, "B");
    }

    #[test]
    fn undo_on_empty_history_reports() {
        let (mut s, _) = session(1);
        assert!(!s.undo());
        assert!(!s.redo());
        let notices = s.take_notices();
        assert!(notices.iter().any(|n| n.text() == "Nothing to undo"));
        assert!(notices.iter().any(|n| n.text() == "Nothing to redo"));
    }

    #[test]
    fn deleting_only_page_is_refused() {
        let (mut s, _) = session(1);
        assert!(!s.delete_page(0));
        assert_eq!(s.page_count(), 1);
        assert!(matches!(s.take_notices().last(), Some(Notice::Warning(_))));
    }

    #[test]
    fn delete_page_keeps_current_index_valid() {
        let (mut s, _) = session(3);
        s.go_to_page(2);
        s.text_boxes.push(tb("on page 3"));
        assert!(s.delete_page(0));
        assert_eq!(s.current_page_index, 1);
        assert_eq!(s.text_boxes[0].text, "on page 3");

        assert!(s.delete_page(1));
        assert_eq!(s.current_page_index, 0);
        assert_eq!(s.current_page().original_path, PathBuf::from("p1.png"));
    }

    #[test]
    fn navigation_syncs_buffers() {
        let (mut s, _) = session(2);
        s.text_boxes.push(tb("first"));
        assert!(s.next_page());
        assert!(s.text_boxes.is_empty());
        assert!(!s.next_page());
        assert!(s.prev_page());
        assert_eq!(s.text_boxes[0].text, "first");
        assert!(!s.prev_page());
        assert!(!s.go_to_page(9));
    }

    #[test]
    fn undo_switches_back_to_the_edited_page() {
        let (mut s, _) = session(2);
        s.add_text_box(tb("x"));
        s.go_to_page(1);
        assert!(s.undo());
        assert_eq!(s.current_page_index, 0);
        assert!(s.text_boxes.is_empty());
        assert!(s.pages[0].text_boxes.is_empty());
    }

    #[test]
    fn sequence_of_undos_returns_to_start() {
        let (mut s, _) = session(1);
        let start_boxes = s.text_boxes.clone();
        let start_layers = s.layers.clone();
        s.add_text_box(tb("1"));
        s.update_text_box(0, |b| b.text = "2".into());
        s.save_state(OperationKind::Layers);
        s.layers.insert(0, Layer::new("L", "l.png"));
        s.add_text_box(tb("3"));
        for _ in 0..4 {
            assert!(s.undo());
        }
        assert_eq!(s.text_boxes, start_boxes);
        assert_eq!(s.layers, start_layers);
        assert!(!s.undo());
    }

    #[test]
    fn new_edit_after_undo_discards_redo() {
        let (mut s, _) = session(1);
        s.add_text_box(tb("1"));
        s.add_text_box(tb("2"));
        s.undo();
        s.add_text_box(tb("3"));
        assert!(!s.redo());
        assert_eq!(s.text_boxes.iter().map(|b| b.text.as_str()).collect::<Vec<_>>(), vec!["1", "3"]);
    }

    #[test]
    fn history_respects_capacity() {
        let store = Arc::new(MemoryImageStore::new());
        let settings = EditorSettings { history_capacity: 4, ..Default::default() };
        let mut s = EditorSession::new_with_pages(vec![Page::blank(10, 10)], settings, store);
        for i in 0..10 {
            s.add_text_box(tb(&i.to_string()));
            assert!(s.history.len() <= 4);
        }
    }

    #[test]
    fn background_undo_falls_back_when_file_is_gone() {
        let (mut s, store) = session(1);
        store.insert("old.png", RgbaImage::from_pixel(40, 30, Rgba([1, 1, 1, 255])));
        store.insert("new.png", RgbaImage::from_pixel(40, 30, Rgba([2, 2, 2, 255])));
        s.bg_path = Some("old.png".into());
        s.save_current_page();
        s.replace_background(0, Some("new.png".into()));
        assert_eq!(s.bg_path.as_deref(), Some(Path::new("new.png")));
        s.undo();
        assert_eq!(s.bg_path.as_deref(), Some(Path::new("old.png")));

        s.redo();
        assert_eq!(s.bg_path.as_deref(), Some(Path::new("new.png")));
        store.remove(Path::new("old.png"));
        s.undo();
        assert_eq!(s.bg_path, None);
        assert_eq!(s.pages[0].bg_path, None);
    }

    #[test]
    fn set_page_background_resizes_to_base() {
        let (mut s, store) = session(2);
        store.insert("photo.png", RgbaImage::from_pixel(80, 60, Rgba([0, 0, 255, 255])));
        let stored = s.set_page_background(1, Path::new("photo.png")).unwrap();
        assert_eq!(store.load_rgba(&stored).unwrap().dimensions(), (40, 30));
        assert_eq!(s.pages[1].bg_path.as_deref(), Some(stored.as_path()));
        assert_eq!(s.bg_path, None);
        assert!(s.set_page_background(0, Path::new("missing.png")).is_err());
    }

    #[test]
    fn mask_strokes_undo_one_at_a_time() {
        let (mut s, _) = session(1);
        s.set_mask_mode(true);
        s.begin_mask_stroke(5, 5);
        s.extend_mask_stroke(15, 5);
        assert!(s.commit_mask_stroke());
        s.add_mask_rect(20, 20, 25, 25);
        assert_eq!(s.mask_strokes.len(), 2);

        s.undo();
        assert_eq!(s.mask_strokes.len(), 1);
        let mask = s.mask.as_ref().unwrap();
        assert_eq!(mask.get_pixel(22, 22)[0], 0);
        assert_eq!(mask.get_pixel(10, 5)[0], 255);

        s.undo();
        assert!(s.mask_strokes.is_empty());
        assert!(s.current_mask().is_none());
        s.redo();
        assert_eq!(s.mask_strokes.len(), 1);
    }

    #[test]
    fn pages_layers_restore_requires_matching_page_count() {
        let (mut s, _) = session(2);
        let report = s.apply_to_all_pages("Add logo", |i, page, _| {
            if i == 1 {
                return Err("boom".into());
            }
            page.layers.insert(0, Layer::new("logo", "logo.png"));
            Ok(())
        });
        assert_eq!(report, BatchReport { succeeded: 1, failed: 1 });
        assert_eq!(s.layers.len(), 1);

        s.add_blank_page(10, 10);
        s.undo();
        assert_eq!(s.pages[0].layers.len(), 1);

        let (mut s, _) = session(2);
        s.apply_to_all_pages("Add logo", |_, page, _| {
            page.layers.insert(0, Layer::new("logo", "logo.png"));
            Ok(())
        });
        s.undo();
        assert!(s.pages.iter().all(|p| p.layers.is_empty()));
        assert!(s.layers.is_empty());
        s.redo();
        assert!(s.pages.iter().all(|p| p.layers.len() == 1));
    }

    #[test]
    fn skipped_all_pages_undo_still_syncs_and_dirties() {
        let (mut s, _) = session(2);
        s.apply_to_all_pages("Add logo", |_, page, _| {
            page.layers.insert(0, Layer::new("logo", "logo.png"));
            Ok(())
        });
        assert!(s.go_to_page(1));
        s.text_boxes.push(tb("unsaved"));
        s.add_blank_page(10, 10);
        s.mark_clean();

        assert!(s.undo());
        assert_eq!(s.current_page_index, 0);
        assert!(s.is_dirty);
        assert_eq!(s.pages[1].text_boxes[0].text, "unsaved");
        assert_eq!(s.layers, s.current_page().layers);
        assert_eq!(s.pages[0].layers.len(), 1);
    }

    #[test]
    fn autosave_waits_for_interval_and_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, _) = session(1);
        s.autosave_dir = dir.path().to_path_buf();
        s.settings.autosave_interval = 60;
        s.settings.autosave_keep = 2;
        let start = Instant::now();

        assert_eq!(s.autosave_if_due(start + Duration::from_secs(120)), None);
        s.add_text_box(tb("draft"));
        assert_eq!(s.autosave_if_due(start + Duration::from_secs(30)), None);
        let first = s.autosave_if_due(start + Duration::from_secs(61)).unwrap();
        assert!(first.is_file());
        assert!(s.is_dirty);
        assert_eq!(s.autosave_if_due(start + Duration::from_secs(90)), None);

        s.settings.autosave_enabled = false;
        assert_eq!(s.autosave_if_due(start + Duration::from_secs(600)), None);
        assert_eq!(io::list_autosaves(dir.path()), vec![first]);
    }

    #[test]
    fn thumbnails_are_cached_until_the_page_changes() {
        let (mut s, store) = session(2);
        store.insert("dot.png", RgbaImage::from_pixel(40, 30, Rgba([255, 0, 0, 255])));
        let before = s.page_thumbnail(1).unwrap();
        assert!(before.width() <= compositor::THUMBNAIL_MAX.0 && before.height() <= compositor::THUMBNAIL_MAX.1);
        assert_eq!(s.page_thumbnail(1).unwrap(), before);
        assert_eq!(s.page_thumbnail(5), None);

        s.add_layer(Layer::new("dot", "dot.png"));
        let current = s.page_thumbnail(0).unwrap();
        assert_eq!(current.get_pixel(5, 5).0, [255, 0, 0]);
        assert_eq!(s.current_page().layers.len(), 1);
        assert!(s.delete_page(1));
        assert_eq!(s.page_thumbnail(0).unwrap(), current);
    }

    #[test]
    fn move_page_keeps_current_and_history_aligned() {
        let (mut s, _) = session(3);
        s.add_text_box(tb("a"));
        assert!(s.move_page(0, 2));
        assert_eq!(s.current_page_index, 2);
        assert_eq!(s.history.peek_undo().unwrap().page_index, 2);
        assert_eq!(reorder_index(1, 0, 2), 0);
        assert_eq!(reorder_index(0, 2, 0), 1);
    }

    #[test]
    fn empty_session_gets_a_blank_page() {
        let s = EditorSession::new_with_pages(Vec::new(), EditorSettings::default(), Arc::new(MemoryImageStore::new()));
        assert_eq!(s.page_count(), 1);
        assert_eq!(s.current_page().size(), DEFAULT_PAGE_SIZE);
        assert_eq!(s.display_title(), "Untitled");
    }

    #[test]
    fn composite_current_uses_live_buffers() {
        let (mut s, store) = session(1);
        store.insert("red.png", RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255])));
        s.layers.insert(0, Layer::new("red", "red.png").at(1, 1));
        let img = s.composite_current();
        assert_eq!(img.get_pixel(2, 2).0, [255, 0, 0]);
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
    }
}
