//! End-to-end editor scenarios driven through the public session API.

use std::path::PathBuf;
use std::sync::Arc;

use image::{Rgb, Rgba, RgbaImage};
use slidefe::canvas::{CropRect, Layer, MemoryImageStore, Page};
use slidefe::components::history::OperationKind;
use slidefe::compositor;
use slidefe::io;
use slidefe::ops::text::{FitParams, TextMeasurer, fit_font_size};
use slidefe::session::{EditorSession, Notice};
use slidefe::settings::EditorSettings;
use slidefe::textbox::TextBox;

const GREY: [u8; 4] = [40, 40, 40, 255];

fn page(w: u32, h: u32) -> Page {
    Page::new(PathBuf::from(format!("page_{}x{}.png", w, h)), RgbaImage::from_pixel(w, h, Rgba(GREY)), (w, h), 1.0)
}

fn session_with(store: Arc<MemoryImageStore>, pages: Vec<Page>) -> EditorSession {
    EditorSession::new_with_pages(pages, EditorSettings::default(), store)
}

#[test]
fn red_layer_lands_where_it_is_placed() {
    let store = Arc::new(MemoryImageStore::new());
    store.insert("red.png", RgbaImage::from_pixel(200, 150, Rgba([255, 0, 0, 255])));
    let mut s = session_with(store.clone(), vec![page(800, 600)]);
    s.add_layer(Layer::new("red", "red.png").at(100, 50));
    s.save_current_page();

    let out = compositor::composite(s.current_page(), store.as_ref());
    assert_eq!(out.dimensions(), (800, 600));
    for (x, y, px) in out.enumerate_pixels() {
        let inside = (100..300).contains(&x) && (50..200).contains(&y);
        let want = if inside { Rgb([255, 0, 0]) } else { Rgb([40, 40, 40]) };
        assert_eq!(*px, want, "pixel ({}, {})", x, y);
    }
    assert_eq!(out, compositor::composite(s.current_page(), store.as_ref()));
}

#[test]
fn top_layer_wins_and_hidden_equals_transparent() {
    let store = Arc::new(MemoryImageStore::new());
    store.insert("a.png", RgbaImage::from_pixel(20, 20, Rgba([0, 255, 0, 255])));
    store.insert("b.png", RgbaImage::from_pixel(20, 20, Rgba([0, 0, 255, 255])));
    let mut s = session_with(store.clone(), vec![page(40, 40)]);
    let b = s.add_layer(Layer::new("B", "b.png").at(5, 5));
    let a = s.add_layer(Layer::new("A", "a.png").at(10, 10));
    assert_eq!(s.layers[0].id, a);

    let out = s.composite_current();
    assert_eq!(*out.get_pixel(15, 15), Rgb([0, 255, 0]));
    assert_eq!(*out.get_pixel(6, 6), Rgb([0, 0, 255]));

    s.set_layer_opacity(&b, 0.0);
    let transparent = s.composite_current();
    s.set_layer_opacity(&b, 1.0);
    s.set_layer_visible(&b, false);
    assert_eq!(transparent, s.composite_current());
}

#[test]
fn oversized_crop_matches_no_crop() {
    let store = Arc::new(MemoryImageStore::new());
    let mut img = RgbaImage::from_pixel(30, 20, Rgba([255, 255, 0, 255]));
    img.put_pixel(29, 19, Rgba([0, 0, 0, 255]));
    store.insert("y.png", img);
    let mut s = session_with(store, vec![page(60, 60)]);
    let id = s.add_layer(Layer::new("Y", "y.png").at(3, 4));
    let plain = s.composite_current();
    assert!(s.set_layer_crop(&id, Some(CropRect::new(-100, -100, 130, 120))));
    assert_eq!(plain, s.composite_current());
}

#[test]
fn undo_restores_previous_text() {
    let store = Arc::new(MemoryImageStore::new());
    let mut s = session_with(store, vec![page(200, 100)]);
    s.text_boxes.push(TextBox::new(10.0, 10.0, 100.0, 20.0, "A").unwrap());
    s.save_state(OperationKind::TextBoxes);
    s.text_boxes[0].text = "B".into();
    assert!(s.undo());
    assert_eq!(s.text_boxes.len(), 1);
    assert_eq!(s.text_boxes[0].text, "A");
    assert!(s.redo());
    assert_eq!(s.text_boxes[0].text, "B");
}

#[test]
fn undo_sequence_returns_to_the_start() {
    let store = Arc::new(MemoryImageStore::new());
    store.insert("l.png", RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])));
    let mut s = session_with(store, vec![page(50, 50)]);
    let before_boxes = s.text_boxes.clone();
    let before_layers = s.layers.clone();

    s.add_text_box(TextBox::new(1.0, 1.0, 10.0, 10.0, "one").unwrap());
    let id = s.add_layer(Layer::new("l", "l.png"));
    s.move_layer_to(&id, 7, 9);
    s.update_text_box(0, |tb| tb.text = "two".into());
    for _ in 0..4 {
        assert!(s.undo());
    }
    assert_eq!(s.text_boxes, before_boxes);
    assert_eq!(s.layers, before_layers);
    assert!(!s.undo());
}

#[test]
fn new_edit_after_undo_discards_redo() {
    let store = Arc::new(MemoryImageStore::new());
    let mut s = session_with(store, vec![page(50, 50)]);
    s.add_text_box(TextBox::new(0.0, 0.0, 5.0, 5.0, "x").unwrap());
    s.add_text_box(TextBox::new(0.0, 0.0, 5.0, 5.0, "y").unwrap());
    assert!(s.undo());
    s.add_text_box(TextBox::new(0.0, 0.0, 5.0, 5.0, "z").unwrap());
    assert!(!s.redo());
    assert_eq!(s.text_boxes.last().map(|t| t.text.as_str()), Some("z"));
}

#[test]
fn history_never_exceeds_capacity() {
    let store = Arc::new(MemoryImageStore::new());
    let settings = EditorSettings { history_capacity: 5, ..EditorSettings::default() };
    let mut s = EditorSession::new_with_pages(vec![page(10, 10)], settings, store);
    for i in 0..12 {
        s.add_text_box(TextBox::new(0.0, 0.0, 1.0, 1.0, format!("{}", i)).unwrap());
        assert!(s.history.len() <= 5);
    }
    assert_eq!(s.history.len(), 5);
}

#[test]
fn deleting_the_only_page_is_refused() {
    let store = Arc::new(MemoryImageStore::new());
    let mut s = session_with(store, vec![page(10, 10)]);
    s.take_notices();
    assert!(!s.delete_page(0));
    assert_eq!(s.page_count(), 1);
    assert!(matches!(s.take_notices().as_slice(), [Notice::Warning(_)]));
}

#[test]
fn navigation_keeps_buffers_in_sync() {
    let store = Arc::new(MemoryImageStore::new());
    let mut s = session_with(store, vec![page(10, 10), page(20, 20), page(30, 30)]);
    s.add_text_box(TextBox::new(0.0, 0.0, 1.0, 1.0, "first").unwrap());
    assert!(s.next_page());
    assert!(s.text_boxes.is_empty());
    assert!(s.next_page());
    assert!(!s.next_page());
    assert!(s.go_to_page(0));
    assert_eq!(s.text_boxes[0].text, "first");
    assert!(!s.prev_page());

    assert!(s.delete_page(0));
    assert_eq!(s.page_count(), 2);
    assert_eq!(s.current_page().size(), (20, 20));
    assert_eq!(s.text_boxes, s.current_page().text_boxes);
}

struct Monospace;

impl TextMeasurer for Monospace {
    fn measure(&self, text: &str, px: f32) -> Option<(f32, f32)> {
        Some((text.chars().count() as f32 * px * 0.6, px))
    }
}

#[test]
fn font_fit_grows_with_width_and_fits() {
    let params = FitParams::default();
    let text = "Quarterly results";
    let mut last = 0;
    for w in [80.0, 160.0, 320.0, 640.0, 1280.0] {
        let pt = fit_font_size(text, w, 60.0, Some(&Monospace), params);
        assert!(pt >= last, "width {} gave {} < {}", w, pt, last);
        let px = (pt as f32 * 96.0 / 72.0).round();
        if pt > params.min_pt {
            let (tw, th) = Monospace.measure(text, px).unwrap();
            assert!(tw <= w - 6.0 && th <= 60.0 - 2.0);
        }
        last = pt;
    }
    assert_eq!(fit_font_size("   ", 100.0, 40.0, Some(&Monospace), params), 16);
}

#[test]
fn project_survives_save_and_open() {
    let dir = tempfile::tempdir().unwrap();
    let img = dir.path().join("slide.png");
    RgbaImage::from_pixel(64, 48, Rgba([9, 9, 9, 255])).save(&img).unwrap();
    let layer_img = dir.path().join("logo.png");
    RgbaImage::from_pixel(8, 8, Rgba([200, 0, 0, 255])).save(&layer_img).unwrap();

    let mut s = EditorSession::new_with_pages(
        vec![io::page_from_image(&img, 2000).unwrap(), Page::blank(32, 24)],
        EditorSettings::default(),
        Arc::new(slidefe::canvas::FsImageStore::default()),
    );
    s.add_text_box(TextBox::new(2.0, 3.0, 40.0, 12.0, "Title").unwrap());
    s.add_layer(Layer::new("logo", &layer_img).at(5, 5));
    let before = s.composite_current();

    let project = dir.path().join("deck.json");
    s.save_project(&project).unwrap();
    assert!(!s.is_dirty);

    let mut reopened = EditorSession::new_with_pages(
        Vec::new(),
        EditorSettings::default(),
        Arc::new(slidefe::canvas::FsImageStore::default()),
    );
    reopened.open_project(&project).unwrap();
    assert_eq!(reopened.page_count(), 2);
    assert_eq!(reopened.text_boxes[0].text, "Title");
    assert_eq!(reopened.composite_current(), before);
    assert!(reopened.go_to_page(1));
    assert_eq!(reopened.current_page().size(), (32, 24));
}
