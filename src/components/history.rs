use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::canvas::Layer;
use crate::ops::mask::MaskStroke;
use crate::textbox::TextBox;

/// Default number of entries kept before the oldest is evicted.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

// ============================================================================
// OPERATION KINDS AND PAYLOADS
// ============================================================================

/// What an undo step restores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    TextBoxes,
    Background,
    InpaintStroke,
    Layers,
    PagesLayers,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::TextBoxes => "textboxes",
            OperationKind::Background => "background",
            OperationKind::InpaintStroke => "inpaint_stroke",
            OperationKind::Layers => "layers",
            OperationKind::PagesLayers => "pages_layers",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::TextBoxes => "Edit Text Boxes",
            OperationKind::Background => "Change Background",
            OperationKind::InpaintStroke => "Mask Stroke",
            OperationKind::Layers => "Edit Layers",
            OperationKind::PagesLayers => "Edit All Pages",
        }
    }
}

/// Snapshot data, one shape per operation kind.
#[derive(Clone, Debug, PartialEq)]
pub enum HistoryPayload {
    TextBoxes(Vec<TextBox>),
    Background {
        old_bg_path: Option<PathBuf>,
        new_bg_path: Option<PathBuf>,
    },
    InpaintStroke {
        stroke: Option<MaskStroke>,
        mask_state: Vec<MaskStroke>,
    },
    Layers(Vec<Layer>),
    PagesLayers(Vec<Vec<Layer>>),
}

impl HistoryPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            HistoryPayload::TextBoxes(_) => OperationKind::TextBoxes,
            HistoryPayload::Background { .. } => OperationKind::Background,
            HistoryPayload::InpaintStroke { .. } => OperationKind::InpaintStroke,
            HistoryPayload::Layers(_) => OperationKind::Layers,
            HistoryPayload::PagesLayers(_) => OperationKind::PagesLayers,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub page_index: usize,
    pub timestamp: SystemTime,
    pub payload: HistoryPayload,
}

impl HistoryEntry {
    pub fn new(page_index: usize, payload: HistoryPayload) -> Self {
        Self { page_index, timestamp: SystemTime::now(), payload }
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }
}

// ============================================================================
// HISTORY MANAGER
// ============================================================================

/// Linear undo list with a cursor.
///
/// `cursor` points at the entry that undo would restore next; `None` means
/// everything has been undone (or nothing was recorded). Entries hold the
/// state captured *before* a mutation. Restoring an entry swaps it with the
/// live state it replaces, so the same entry serves both undo and redo.
pub struct HistoryManager {
    entries: VecDeque<HistoryEntry>,
    cursor: Option<usize>,
    capacity: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.enforce_limit();
    }

    /// Record a new entry, discarding any redo branch first.
    pub fn push(&mut self, entry: HistoryEntry) {
        match self.cursor {
            Some(c) => self.entries.truncate(c + 1),
            None => self.entries.clear(),
        }
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        } else {
            self.cursor = Some(self.cursor.map_or(0, |c| c + 1));
        }
    }

    fn enforce_limit(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.cursor = self.cursor.and_then(|c| c.checked_sub(1));
        }
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn can_redo(&self) -> bool {
        self.redo_index().is_some()
    }

    fn redo_index(&self) -> Option<usize> {
        let next = self.cursor.map_or(0, |c| c + 1);
        (next < self.entries.len()).then_some(next)
    }

    /// Entry that the next undo restores.
    pub fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.cursor.and_then(|c| self.entries.get(c))
    }

    /// Entry that the next redo restores.
    pub fn peek_redo(&self) -> Option<&HistoryEntry> {
        self.redo_index().and_then(|i| self.entries.get(i))
    }

    /// Finish an undo: store the displaced live state and step back.
    pub fn commit_undo(&mut self, displaced: HistoryPayload) {
        let Some(c) = self.cursor else { return };
        if let Some(entry) = self.entries.get_mut(c) {
            entry.payload = displaced;
        }
        self.cursor = c.checked_sub(1);
    }

    /// Finish a redo: store the displaced live state and step forward.
    pub fn commit_redo(&mut self, displaced: HistoryPayload) {
        let Some(next) = self.redo_index() else { return };
        if let Some(entry) = self.entries.get_mut(next) {
            entry.payload = displaced;
        }
        self.cursor = Some(next);
    }

    /// Fill in the replacement path of the most recent background entry once
    /// the new background has been produced.
    pub fn set_background_result(&mut self, new_path: Option<PathBuf>) -> bool {
        let Some(c) = self.cursor else { return false };
        match self.entries.get_mut(c).map(|e| &mut e.payload) {
            Some(HistoryPayload::Background { new_bg_path, .. }) => {
                *new_bg_path = new_path;
                true
            }
            _ => false,
        }
    }

    /// Page indices shift when a page is removed. Entries for the removed page
    /// are dropped (all-pages entries are kept); later pages move down by one.
    pub fn forget_page(&mut self, removed: usize) {
        let mut kept = VecDeque::with_capacity(self.entries.len());
        let mut cursor = None;
        for (i, mut entry) in self.entries.drain(..).enumerate() {
            if entry.page_index == removed && entry.kind() != OperationKind::PagesLayers {
                continue;
            }
            if entry.page_index > removed || (entry.page_index == removed && removed > 0) {
                entry.page_index -= 1;
            }
            kept.push_back(entry);
            if self.cursor.is_some_and(|c| i <= c) {
                cursor = Some(kept.len() - 1);
            }
        }
        self.entries = kept;
        self.cursor = cursor;
    }

    /// Rewrite page indices after pages were reordered.
    pub fn remap_pages(&mut self, map: impl Fn(usize) -> usize) {
        for entry in self.entries.iter_mut() {
            entry.page_index = map(entry.page_index);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Labels of the entries that can be undone, oldest first.
    pub fn undo_history(&self) -> Vec<&'static str> {
        let upto = self.cursor.map_or(0, |c| c + 1);
        self.entries.iter().take(upto).map(|e| e.kind().label()).collect()
    }
}
