//! SlideFE: page, layer and text-box model of a slide editor, with the
//! compositor, undo history, font fitting, project files and the hand-off to
//! OCR / inpaint / image-generation services.
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod logger;

pub mod canvas;
pub mod cli;
pub mod components;
pub mod compositor;
pub mod io;
pub mod ops;
pub mod session;
pub mod settings;
pub mod textbox;
pub mod worker;
