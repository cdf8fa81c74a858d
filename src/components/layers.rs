use std::path::PathBuf;

use crate::canvas::{CropRect, Layer, LayerLocked, hit_test};
use crate::components::history::OperationKind;
use crate::session::{EditorSession, Notice};

// ============================================================================
// LAYER OPERATIONS - every mutation is undoable as a "layers" step
// ============================================================================

impl EditorSession {
    pub fn layer_index(&self, id: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn layer(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn selected_layer(&self) -> Option<&Layer> {
        self.selected_layer.as_deref().and_then(|id| self.layer(id))
    }

    /// Insert a new image layer on top; returns its id.
    pub fn add_image_layer(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> String {
        self.add_layer(Layer::new(name, path))
    }

    /// Insert an already-built layer on top; returns its id.
    pub fn add_layer(&mut self, layer: Layer) -> String {
        self.save_state(OperationKind::Layers);
        let id = layer.id.clone();
        self.layers.insert(0, layer);
        self.selected_layer = Some(id.clone());
        self.sync_layers();
        id
    }

    pub fn delete_layer(&mut self, id: &str) -> bool {
        let Some(index) = self.layer_index(id) else { return false };
        self.save_state(OperationKind::Layers);
        let removed = self.layers.remove(index);
        if self.selected_layer.as_deref() == Some(id) {
            self.selected_layer = None;
        }
        self.sync_layers();
        self.notify(Notice::Status(format!("Deleted layer '{}'", removed.name)));
        true
    }

    /// Move one step toward the top of the stack.
    pub fn move_layer_up(&mut self, id: &str) -> bool {
        match self.layer_index(id) {
            Some(i) if i > 0 => {
                self.save_state(OperationKind::Layers);
                self.layers.swap(i, i - 1);
                self.sync_layers();
                true
            }
            _ => false,
        }
    }

    /// Move one step toward the bottom of the stack.
    pub fn move_layer_down(&mut self, id: &str) -> bool {
        match self.layer_index(id) {
            Some(i) if i + 1 < self.layers.len() => {
                self.save_state(OperationKind::Layers);
                self.layers.swap(i, i + 1);
                self.sync_layers();
                true
            }
            _ => false,
        }
    }

    pub fn rename_layer(&mut self, id: &str, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        self.edit_layer(id, |l| l.name = name.to_string())
    }

    pub fn set_layer_visible(&mut self, id: &str, visible: bool) -> bool {
        self.edit_layer(id, |l| l.visible = visible)
    }

    pub fn set_layer_opacity(&mut self, id: &str, opacity: f32) -> bool {
        let opacity = if opacity.is_finite() { opacity.clamp(0.0, 1.0) } else { 1.0 };
        self.edit_layer(id, |l| l.opacity = opacity)
    }

    pub fn set_layer_locked(&mut self, id: &str, locked: bool) -> bool {
        self.edit_layer(id, |l| l.locked = locked)
    }

    pub fn move_layer_to(&mut self, id: &str, x: i32, y: i32) -> bool {
        self.transform_layer(id, |l| l.set_position(x, y))
    }

    pub fn set_layer_scale(&mut self, id: &str, scale: f32) -> bool {
        self.transform_layer(id, |l| l.set_scale(scale))
    }

    pub fn set_layer_crop(&mut self, id: &str, crop: Option<CropRect>) -> bool {
        self.transform_layer(id, |l| l.set_crop(crop))
    }

    pub fn select_layer_by_id(&mut self, id: &str) -> bool {
        if self.layer_index(id).is_some() {
            self.selected_layer = Some(id.to_string());
            true
        } else {
            false
        }
    }

    /// Select the topmost visible layer under a page-space point.
    pub fn select_layer_at(&mut self, x: i32, y: i32) -> Option<String> {
        let hit = hit_test(&self.layers, self.store.as_ref(), x, y).map(|i| self.layers[i].id.clone());
        self.selected_layer = hit.clone();
        hit
    }

    fn edit_layer(&mut self, id: &str, edit: impl FnOnce(&mut Layer)) -> bool {
        let Some(index) = self.layer_index(id) else { return false };
        self.save_state(OperationKind::Layers);
        edit(&mut self.layers[index]);
        self.sync_layers();
        true
    }

    /// Position/scale/crop changes. Locked layers are left untouched and no
    /// history is recorded.
    fn transform_layer(&mut self, id: &str, apply: impl FnOnce(&mut Layer) -> Result<(), LayerLocked>) -> bool {
        let Some(index) = self.layer_index(id) else { return false };
        if self.layers[index].locked {
            let name = self.layers[index].name.clone();
            self.notify(Notice::Warning(format!("Layer '{}' is locked", name)));
            return false;
        }
        self.save_state(OperationKind::Layers);
        if let Err(e) = apply(&mut self.layers[index]) {
            self.notify(Notice::Warning(e.to_string()));
            return false;
        }
        self.sync_layers();
        true
    }

    fn sync_layers(&mut self) {
        if let Some(page) = self.pages.get_mut(self.current_page_index) {
            page.layers = self.layers.clone();
            page.touch();
        }
        self.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{MemoryImageStore, Page};
    use crate::settings::EditorSettings;
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn session() -> EditorSession {
        let store = Arc::new(MemoryImageStore::new());
        store.insert("a.png", RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        EditorSession::new_with_pages(vec![Page::blank(50, 50)], EditorSettings::default(), store)
    }

    #[test]
    fn new_layers_go_on_top() {
        let mut s = session();
        let a = s.add_image_layer("A", "a.png");
        let b = s.add_image_layer("B", "a.png");
        assert_eq!(s.layers[0].id, b);
        assert_eq!(s.layers[1].id, a);
        assert_eq!(s.selected_layer.as_deref(), Some(b.as_str()));
        assert_eq!(s.current_page().layers.len(), 2);
    }

    #[test]
    fn reorder_changes_visual_position() {
        let mut s = session();
        let a = s.add_image_layer("A", "a.png");
        let _b = s.add_image_layer("B", "a.png");
        assert!(s.move_layer_up(&a));
        assert_eq!(s.layers[0].id, a);
        assert!(!s.move_layer_up(&a));
        assert!(s.move_layer_down(&a));
        assert!(!s.move_layer_down(&a));
        s.undo();
        assert_eq!(s.layers[0].id, a);
    }

    #[test]
    fn locked_layer_refuses_transform_without_history() {
        let mut s = session();
        let a = s.add_image_layer("A", "a.png");
        assert!(s.set_layer_locked(&a, true));
        let before = s.history.len();
        s.take_notices();

        assert!(!s.move_layer_to(&a, 5, 5));
        assert!(!s.set_layer_scale(&a, 2.0));
        assert!(!s.set_layer_crop(&a, Some(CropRect::new(0, 0, 2, 2))));
        assert_eq!(s.history.len(), before);
        assert_eq!((s.layers[0].x, s.layers[0].y), (0, 0));
        assert!(s.take_notices().iter().all(|n| matches!(n, Notice::Warning(_))));

        assert!(s.set_layer_opacity(&a, 0.5));
    }

    #[test]
    fn transforms_are_undoable() {
        let mut s = session();
        let a = s.add_image_layer("A", "a.png");
        assert!(s.move_layer_to(&a, 7, 8));
        assert!(s.set_layer_scale(&a, 2.0));
        assert!(s.set_layer_opacity(&a, 4.0));
        assert_eq!(s.layers[0].opacity, 1.0);
        s.undo();
        s.undo();
        assert_eq!(s.layers[0].scale, 1.0);
        assert_eq!((s.layers[0].x, s.layers[0].y), (7, 8));
    }

    #[test]
    fn delete_and_rename() {
        let mut s = session();
        let a = s.add_image_layer("A", "a.png");
        assert!(!s.rename_layer(&a, "   "));
        assert!(s.rename_layer(&a, "Logo"));
        assert_eq!(s.layer(&a).unwrap().name, "Logo");
        assert!(s.delete_layer(&a));
        assert!(s.layers.is_empty());
        assert_eq!(s.selected_layer, None);
        assert!(!s.delete_layer(&a));
        s.undo();
        assert_eq!(s.layers.len(), 1);
    }

    #[test]
    fn click_selects_topmost_visible_layer() {
        let mut s = session();
        let bottom = s.add_image_layer("bottom", "a.png");
        let top = s.add_image_layer("top", "a.png");
        assert_eq!(s.select_layer_at(3, 3).as_deref(), Some(top.as_str()));
        s.set_layer_visible(&top, false);
        assert_eq!(s.select_layer_at(3, 3).as_deref(), Some(bottom.as_str()));
        assert_eq!(s.select_layer_at(30, 30), None);
        assert!(s.select_layer_by_id(&top));
        assert!(!s.select_layer_by_id("nope"));
    }
}
