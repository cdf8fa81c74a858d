use std::path::{Path, PathBuf};

use crate::components::history::DEFAULT_HISTORY_CAPACITY;
use crate::textbox::DEFAULT_FONT_NAME;

/// Editor settings that persist across sessions.
#[derive(Clone, Debug, PartialEq)]
pub struct EditorSettings {
    /// Inpaint service endpoint (IOPaint-compatible)
    pub inpaint_api_url: String,
    pub inpaint_enabled: bool,
    /// Pixels of context around the mask sent to the inpaint service
    pub inpaint_crop_padding: u32,

    // AI image generation (OpenAI-compatible chat completions)
    pub ai_api_url: String,
    pub ai_api_key: String,
    pub ai_model: String,
    pub ai_timeout_secs: u64,

    /// OCR program run as `<ocr_command> --device <ocr_device> <image.png>`;
    /// empty disables OCR
    pub ocr_command: String,
    /// "cpu" or "gpu"
    pub ocr_device: String,
    /// Detect text boxes on freshly imported pages
    pub ocr_autoload: bool,

    pub autosave_enabled: bool,
    /// Seconds between autosaves
    pub autosave_interval: u64,
    /// Number of autosave files kept
    pub autosave_keep: usize,

    pub history_capacity: usize,
    /// Longest edge of the in-editor working copy of each page
    pub max_edit_edge: u32,
    pub default_font_name: String,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            inpaint_api_url: "http://127.0.0.1:8080/api/v1/inpaint".to_string(),
            inpaint_enabled: true,
            inpaint_crop_padding: 128,
            ai_api_url: "https://api.openai.com/v1".to_string(),
            ai_api_key: String::new(),
            ai_model: "gpt-4o".to_string(),
            ai_timeout_secs: 120,
            ocr_command: String::new(),
            ocr_device: "cpu".to_string(),
            ocr_autoload: false,
            autosave_enabled: true,
            autosave_interval: 300,
            autosave_keep: 10,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_edit_edge: 2000,
            default_font_name: DEFAULT_FONT_NAME.to_string(),
        }
    }
}

impl EditorSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/slidefe/slidefe_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\SlideFE\slidefe_settings.cfg
    /// On macOS:   ~/Library/Application Support/SlideFE/slidefe_settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("SlideFE").join("slidefe_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("SlideFE")
                    .join("slidefe_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME").map(PathBuf::from).or_else(|_| {
                std::env::var("HOME").map(|home| PathBuf::from(home).join(".config"))
            });
            config_dir.ok().map(|d| d.join("slidefe").join("slidefe_settings.cfg"))
        }
    }

    /// Load from the default location (defaults if missing or unreadable).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => {
                crate::log_info!("settings file {} not found, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse `key=value` lines. Unknown keys are ignored and malformed values
    /// keep their defaults.
    pub fn parse(content: &str) -> Self {
        let (settings, rejected) = Self::parse_lines(content);
        for msg in rejected {
            crate::log_warn!("settings: {}", msg);
        }
        settings
    }

    /// Parse `key=value` lines, collecting a message for every line that was
    /// not applied. Rejected values leave the default in place.
    fn parse_lines(content: &str) -> (Self, Vec<String>) {
        let mut s = Self::default();
        let mut rejected = Vec::new();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                rejected.push(format!("line {}: expected key=value, got '{}'", n + 1, line));
                continue;
            };
            let key = key.trim();
            let val = val.trim();
            let applied = match key {
                "inpaint_api_url" => set_string(&mut s.inpaint_api_url, val),
                "inpaint_enabled" => set_parsed(&mut s.inpaint_enabled, val),
                "inpaint_crop_padding" => set_parsed(&mut s.inpaint_crop_padding, val),
                "ai_api_url" => set_string(&mut s.ai_api_url, val),
                "ai_api_key" => set_string(&mut s.ai_api_key, val),
                "ai_model" => set_string(&mut s.ai_model, val),
                "ai_timeout_secs" => set_parsed(&mut s.ai_timeout_secs, val),
                "ocr_command" => set_string(&mut s.ocr_command, val),
                "ocr_device" => set_string(&mut s.ocr_device, val),
                "ocr_autoload" => set_parsed(&mut s.ocr_autoload, val),
                "autosave_enabled" => set_parsed(&mut s.autosave_enabled, val),
                "autosave_interval" => set_parsed(&mut s.autosave_interval, val),
                "autosave_keep" => set_parsed(&mut s.autosave_keep, val),
                "history_capacity" => set_parsed(&mut s.history_capacity, val),
                "max_edit_edge" => set_parsed(&mut s.max_edit_edge, val),
                "default_font_name" => set_string(&mut s.default_font_name, val),
                _ => {
                    rejected.push(format!("line {}: unknown key '{}'", n + 1, key));
                    continue;
                }
            };
            if !applied {
                rejected.push(format!("line {}: invalid value '{}' for {}", n + 1, val, key));
            }
        }
        (s, rejected)
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "inpaint_api_url={}\n\
             inpaint_enabled={}\n\
             inpaint_crop_padding={}\n\
             ai_api_url={}\n\
             ai_api_key={}\n\
             ai_model={}\n\
             ai_timeout_secs={}\n\
             ocr_command={}\n\
             ocr_device={}\n\
             ocr_autoload={}\n\
             autosave_enabled={}\n\
             autosave_interval={}\n\
             autosave_keep={}\n\
             history_capacity={}\n\
             max_edit_edge={}\n\
             default_font_name={}\n",
            self.inpaint_api_url,
            self.inpaint_enabled,
            self.inpaint_crop_padding,
            self.ai_api_url,
            self.ai_api_key,
            self.ai_model,
            self.ai_timeout_secs,
            self.ocr_command,
            self.ocr_device,
            self.ocr_autoload,
            self.autosave_enabled,
            self.autosave_interval,
            self.autosave_keep,
            self.history_capacity,
            self.max_edit_edge,
            self.default_font_name,
        )
    }

    /// Save to the default location.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::settings_path() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no settings directory"));
        };
        self.save_to(&path)
    }

    /// Write to a temp file next to `path`, then rename it into place.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("cfg.tmp");
        let result = std::fs::write(&tmp, self.to_config_string()).and_then(|_| std::fs::rename(&tmp, path));
        if let Err(e) = &result {
            crate::log_err!("failed to save settings to {}: {}", path.display(), e);
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// `true` when every constrained value is legal.
    pub fn validate(&self) -> bool {
        let mut ok = true;
        if !matches!(self.ocr_device.as_str(), "cpu" | "gpu") {
            crate::log_warn!("invalid ocr_device '{}'", self.ocr_device);
            ok = false;
        }
        if self.autosave_enabled && self.autosave_interval == 0 {
            crate::log_warn!("autosave_interval must be positive");
            ok = false;
        }
        if self.inpaint_api_url.trim().is_empty() {
            crate::log_warn!("inpaint_api_url is empty");
            ok = false;
        }
        if self.ocr_autoload && self.ocr_command.trim().is_empty() {
            crate::log_warn!("ocr_autoload is set but ocr_command is empty");
            ok = false;
        }
        ok
    }

    /// Check `default_font_name` against the installed families. An unknown
    /// family falls back to the built-in default; an empty list (enumeration
    /// failed) accepts anything.
    pub fn resolve_default_font(&mut self, families: &[String]) -> bool {
        if families.is_empty() || families.iter().any(|f| f.eq_ignore_ascii_case(&self.default_font_name)) {
            return true;
        }
        crate::log_warn!(
            "default font '{}' is not installed, using '{}'",
            self.default_font_name,
            DEFAULT_FONT_NAME
        );
        self.default_font_name = DEFAULT_FONT_NAME.to_string();
        false
    }
}

fn set_string(field: &mut String, val: &str) -> bool {
    *field = val.to_string();
    true
}

fn set_parsed<T: std::str::FromStr>(field: &mut T, val: &str) -> bool {
    match val.parse() {
        Ok(v) => {
            *field = v;
            true
        }
        Err(_) => false,
    }
}
