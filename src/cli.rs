// ============================================================================
// SlideFE CLI: headless export of slide decks
// ============================================================================
//
// Usage examples:
//   slidefe --project deck.json --output-dir out/
//   slidefe -p deck.json -o out/ --format jpg --quality 85 --page 2 --page 3
//   slidefe --images "scans/*.png" --output-dir out/ --save-project deck.json
//   slidefe -i a.png b.png -o out/ --no-text
//
// No window is opened in CLI mode. Pages are composited with the same code
// the editor uses and written as page_001.png, page_002.png, ...
// With `ocr_autoload` set, imported images get text boxes detected first.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{ArgGroup, Parser};

use crate::canvas::FsImageStore;
use crate::io::{self, ExportFormat, ExportOptions};
use crate::ops::ocr::{self, CommandOcrEngine};
use crate::ops::text::{FontLookup, SystemFontLookup, enumerate_system_fonts};
use crate::session::EditorSession;
use crate::settings::EditorSettings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// SlideFE headless exporter.
///
/// Render the pages of a project (or a set of images) to image files.
#[derive(Parser, Debug)]
#[command(
    name = "slidefe",
    about = "SlideFE headless slide exporter",
    long_about = "Composite every page of a SlideFE project, including background\n\
                  replacements, image layers and text boxes, and write the result\n\
                  as PNG, JPEG, WEBP or BMP files.\n\n\
                  Example:\n  \
                  slidefe --project deck.json --output-dir out/\n  \
                  slidefe -i \"scans/*.png\" -o out/ --format jpg"
)]
#[command(group(ArgGroup::new("source").required(true).args(["project", "images"])))]
pub struct CliArgs {
    /// Project file to export.
    #[arg(short, long, value_name = "FILE")]
    pub project: Option<PathBuf>,

    /// Page images, one page each. Glob patterns accepted (e.g. "scans/*.png").
    #[arg(short, long, num_args = 1.., value_name = "IMAGE")]
    pub images: Vec<String>,

    /// Directory the page files are written to.
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Output format: png, jpg, webp, bmp.
    #[arg(short, long, default_value = "png", value_name = "FORMAT")]
    pub format: String,

    /// JPEG quality (1–100).
    #[arg(short, long, default_value_t = 95, value_name = "1-100")]
    pub quality: u8,

    /// Export only this page (1-based). Repeat for several pages.
    #[arg(long = "page", value_name = "N")]
    pub pages: Vec<usize>,

    /// Leave text boxes out of the exported images.
    #[arg(long)]
    pub no_text: bool,

    /// Also write the assembled deck as a project file.
    #[arg(long, value_name = "FILE")]
    pub save_project: Option<PathBuf>,

    /// Write the session log here instead of the data directory.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Echo the log to stderr and print per-page output.
    #[arg(short, long)]
    pub verbose: bool,
}

/// What a successful run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub written: Vec<PathBuf>,
    pub failed: usize,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the export and return an OS exit code.
/// `0` = every requested page was written, `1` = anything failed.
pub fn run(args: CliArgs) -> ExitCode {
    let start = Instant::now();
    let fonts = SystemFontLookup::new();
    match execute(&args, &fonts) {
        Ok(summary) => {
            if args.verbose {
                for path in &summary.written {
                    println!("  → {}", path.display());
                }
            }
            println!(
                "{} page(s) written to {} ({:.0}ms)",
                summary.written.len(),
                args.output_dir.display(),
                start.elapsed().as_secs_f64() * 1000.0
            );
            if summary.failed > 0 {
                eprintln!("error: {} page(s) failed to export.", summary.failed);
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Build the session from the arguments and export it, using the saved
/// editor settings.
pub fn execute(args: &CliArgs, fonts: &(dyn FontLookup + Sync)) -> Result<RunSummary, String> {
    execute_with(args, EditorSettings::load(), fonts)
}

pub fn execute_with(
    args: &CliArgs,
    settings: EditorSettings,
    fonts: &(dyn FontLookup + Sync),
) -> Result<RunSummary, String> {
    let format = ExportFormat::from_name(&args.format)
        .ok_or_else(|| format!("unknown format '{}' (expected png, jpg, webp or bmp)", args.format))?;
    if !(1..=100).contains(&args.quality) {
        return Err(format!("quality must be between 1 and 100, got {}", args.quality));
    }

    let mut session = build_session(args, settings, fonts)?;
    if let Some(path) = &args.save_project {
        session.save_project(path).map_err(|e| format!("could not save '{}': {}", path.display(), e))?;
    }
    session.save_current_page();

    let pages = if args.pages.is_empty() {
        None
    } else {
        let count = session.page_count();
        let mut selected = Vec::with_capacity(args.pages.len());
        for &n in &args.pages {
            if n == 0 || n > count {
                return Err(format!("page {} is out of range (deck has {} pages)", n, count));
            }
            selected.push(n - 1);
        }
        Some(selected)
    };

    let options = ExportOptions { format, quality: args.quality, include_text: !args.no_text, pages };
    let report = io::export_page_images(&session.pages, &FsImageStore::default(), &args.output_dir, &options, fonts)
        .map_err(|e| format!("could not export to '{}': {}", args.output_dir.display(), e))?;
    for (index, reason) in &report.failed {
        eprintln!("  page {}: {}", index + 1, reason);
    }
    Ok(RunSummary { written: report.written, failed: report.failed.len() })
}

fn build_session(
    args: &CliArgs,
    mut settings: EditorSettings,
    fonts: &(dyn FontLookup + Sync),
) -> Result<EditorSession, String> {
    let store = Arc::new(FsImageStore::default());

    if let Some(project) = &args.project {
        let loaded = io::load_project(project, settings.max_edit_edge)
            .map_err(|e| format!("could not open '{}': {}", project.display(), e))?;
        if loaded.skipped > 0 {
            eprintln!("warning: {} page(s) skipped because their image is missing.", loaded.skipped);
        }
        let mut session = EditorSession::new_with_pages(loaded.pages, settings, store);
        session.go_to_page(loaded.current_page);
        return Ok(session);
    }

    let inputs = resolve_inputs(&args.images);
    if inputs.is_empty() {
        return Err("no input images matched the given pattern(s).".into());
    }
    let mut pages = Vec::with_capacity(inputs.len());
    for path in &inputs {
        match io::page_from_image(path, settings.max_edit_edge) {
            Ok(page) => pages.push(page),
            Err(e) => eprintln!("warning: skipping '{}': {}", path.display(), e),
        }
    }
    if pages.is_empty() {
        return Err("none of the input images could be loaded.".into());
    }

    let engine = if settings.ocr_autoload {
        match CommandOcrEngine::from_settings(&settings) {
            Ok(engine) => {
                settings.resolve_default_font(&enumerate_system_fonts());
                Some(engine)
            }
            Err(e) => {
                eprintln!("warning: text detection skipped: {}", e);
                None
            }
        }
    } else {
        None
    };
    let mut session = EditorSession::new_with_pages(pages, settings, store);
    if let Some(engine) = engine {
        let added = ocr::populate_all_pages(&mut session, &engine, fonts);
        if args.verbose {
            println!("  detected {} text box(es)", added);
        }
    }
    Ok(session)
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::text::NoFonts;
    use image::{Rgba, RgbaImage};

    fn parse(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("slidefe").chain(args.iter().copied()))
    }

    #[test]
    fn a_source_is_required() {
        assert!(parse(&["--output-dir", "out"]).is_err());
        assert!(parse(&["--project", "a.json", "--images", "b.png", "-o", "out"]).is_err());
        let args = parse(&["-p", "deck.json", "-o", "out", "--page", "2", "--page", "3"]).unwrap();
        assert_eq!(args.pages, vec![2, 3]);
        assert_eq!(args.format, "png");
        assert_eq!(args.quality, 95);
    }

    #[test]
    fn images_are_exported_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, px) in [("b.png", [0, 255, 0, 255]), ("a.png", [255, 0, 0, 255])] {
            RgbaImage::from_pixel(12, 8, Rgba(px)).save(dir.path().join(name)).unwrap();
        }
        let pattern = dir.path().join("*.png").to_string_lossy().to_string();
        let out = dir.path().join("out");
        let out_arg = out.to_string_lossy().to_string();
        let args = parse(&["-i", &pattern, "-o", &out_arg, "--format", "bmp"]).unwrap();

        let summary = execute_with(&args, EditorSettings::default(), &NoFonts).unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.written.len(), 2);
        let first = image::open(out.join("page_001.bmp")).unwrap().to_rgba8();
        assert_eq!(first.get_pixel(0, 0).0, [255, 0, 0, 255]);
    }

    #[cfg(unix)]
    #[test]
    fn imported_images_get_text_detected_when_configured() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("detect.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '[{\"text\": \"'\"$2\"'\", \"polygon\": [[2,2],[30,2],[30,12],[2,12]]}]'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let img = dir.path().join("slide.png");
        RgbaImage::from_pixel(40, 20, Rgba([255, 255, 255, 255])).save(&img).unwrap();

        let deck = dir.path().join("deck.json");
        let (img_arg, deck_arg) = (img.to_string_lossy().to_string(), deck.to_string_lossy().to_string());
        let out_arg = dir.path().join("out").to_string_lossy().to_string();
        let args = parse(&["-i", &img_arg, "-o", &out_arg, "--no-text", "--save-project", &deck_arg]).unwrap();
        let settings = EditorSettings {
            ocr_command: script.to_string_lossy().to_string(),
            ocr_device: "cpu".into(),
            ocr_autoload: true,
            ..EditorSettings::default()
        };

        let summary = execute_with(&args, settings.clone(), &NoFonts).unwrap();
        assert_eq!(summary.written.len(), 1);
        let loaded = io::load_project(&deck, 2000).unwrap();
        assert_eq!(loaded.pages[0].text_boxes.len(), 1);
        assert_eq!(loaded.pages[0].text_boxes[0].text, "cpu");

        let off = EditorSettings { ocr_autoload: false, ..settings };
        execute_with(&args, off, &NoFonts).unwrap();
        assert!(io::load_project(&deck, 2000).unwrap().pages[0].text_boxes.is_empty());
    }

    #[test]
    fn bad_page_numbers_and_formats_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("only.png");
        RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255])).save(&img).unwrap();
        let img_arg = img.to_string_lossy().to_string();
        let out_arg = dir.path().join("out").to_string_lossy().to_string();

        let args = parse(&["-i", &img_arg, "-o", &out_arg, "--page", "2"]).unwrap();
        assert!(execute_with(&args, EditorSettings::default(), &NoFonts).unwrap_err().contains("out of range"));
        let args = parse(&["-i", &img_arg, "-o", &out_arg, "--format", "tiff"]).unwrap();
        assert!(execute_with(&args, EditorSettings::default(), &NoFonts).unwrap_err().contains("unknown format"));
        let args = parse(&["-i", "/definitely/not/here/*.png", "-o", &out_arg]).unwrap();
        assert!(execute_with(&args, EditorSettings::default(), &NoFonts).is_err());
    }
}
