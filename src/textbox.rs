use serde::{Deserialize, Serialize};

pub const DEFAULT_FONT_NAME: &str = "Microsoft YaHei";
pub const DEFAULT_FONT_SIZE: u32 = 16;
pub const DEFAULT_FONT_COLOR: &str = "#000000";

/// Horizontal alignment of the text inside its box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

impl TextAlign {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextAlign::Left => "left",
            TextAlign::Center => "center",
            TextAlign::Right => "right",
        }
    }

    /// Parse an alignment name; anything outside the three known values
    /// becomes `Left` with a warning.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "left" => TextAlign::Left,
            "center" => TextAlign::Center,
            "right" => TextAlign::Right,
            other => {
                crate::log_warn!("invalid text alignment '{}', using 'left'", other);
                TextAlign::Left
            }
        }
    }
}

/// Error raised when a text box is constructed or resized with geometry
/// that cannot be represented.
#[derive(Debug, Clone, PartialEq)]
pub enum TextBoxError {
    NegativeSize { width: f32, height: f32 },
    NonFinite(&'static str),
    InvalidFontSize(u32),
    MissingField(&'static str),
}

impl std::fmt::Display for TextBoxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextBoxError::NegativeSize { width, height } => {
                write!(f, "text box size must be non-negative, got {}x{}", width, height)
            }
            TextBoxError::NonFinite(field) => write!(f, "text box {} must be a finite number", field),
            TextBoxError::InvalidFontSize(size) => write!(f, "font size must be positive, got {}", size),
            TextBoxError::MissingField(field) => write!(f, "text box is missing required field '{}'", field),
        }
    }
}

impl std::error::Error for TextBoxError {}

/// A positioned text annotation on a page.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub text: String,
    pub font_size: u32,
    pub font_name: String,
    font_color: String,
    pub bold: bool,
    pub italic: bool,
    pub align: TextAlign,
}

impl TextBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, text: impl Into<String>) -> Result<Self, TextBoxError> {
        for (name, v) in [("x", x), ("y", y), ("width", width), ("height", height)] {
            if !v.is_finite() {
                return Err(TextBoxError::NonFinite(name));
            }
        }
        if width < 0.0 || height < 0.0 {
            return Err(TextBoxError::NegativeSize { width, height });
        }
        Ok(Self {
            x,
            y,
            width,
            height,
            text: text.into(),
            font_size: DEFAULT_FONT_SIZE,
            font_name: DEFAULT_FONT_NAME.to_string(),
            font_color: DEFAULT_FONT_COLOR.to_string(),
            bold: false,
            italic: false,
            align: TextAlign::Left,
        })
    }

    pub fn with_font(mut self, name: impl Into<String>, size: u32) -> Result<Self, TextBoxError> {
        self.set_font_size(size)?;
        self.font_name = name.into();
        Ok(self)
    }

    pub fn set_font_size(&mut self, size: u32) -> Result<(), TextBoxError> {
        if size == 0 {
            return Err(TextBoxError::InvalidFontSize(size));
        }
        self.font_size = size;
        Ok(())
    }

    pub fn font_color(&self) -> &str {
        &self.font_color
    }

    /// Set the color from a `#RGB` / `#RRGGBB` string. Invalid input is
    /// replaced with black and logged rather than rejected.
    pub fn set_font_color(&mut self, color: &str) {
        if is_valid_hex_color(color) {
            self.font_color = color.to_string();
        } else {
            crate::log_warn!("invalid font color '{}', using '{}'", color, DEFAULT_FONT_COLOR);
            self.font_color = DEFAULT_FONT_COLOR.to_string();
        }
    }

    pub fn set_align_str(&mut self, align: &str) {
        self.align = TextAlign::parse_lenient(align);
    }

    /// RGB triple of the font color.
    pub fn rgb(&self) -> [u8; 3] {
        parse_hex_color(&self.font_color).unwrap_or([0, 0, 0])
    }

    pub fn move_by(&mut self, dx: f32, dy: f32) {
        self.x += dx;
        self.y += dy;
    }

    pub fn resize(&mut self, width: f32, height: f32) -> Result<(), TextBoxError> {
        if !width.is_finite() || !height.is_finite() {
            return Err(TextBoxError::NonFinite("size"));
        }
        if width < 0.0 || height < 0.0 {
            return Err(TextBoxError::NegativeSize { width, height });
        }
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn contains_point(&self, px: f32, py: f32) -> bool {
        self.x <= px && px <= self.x + self.width && self.y <= py && py <= self.y + self.height
    }

    pub fn intersects(&self, other: &TextBox) -> bool {
        !(self.x + self.width < other.x
            || other.x + other.width < self.x
            || self.y + self.height < other.y
            || other.y + other.height < self.y)
    }
}

/// `#RGB` or `#RRGGBB` with hex digits only.
pub fn is_valid_hex_color(color: &str) -> bool {
    let Some(digits) = color.strip_prefix('#') else { return false };
    matches!(digits.len(), 3 | 6) && digits.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn parse_hex_color(color: &str) -> Option<[u8; 3]> {
    if !is_valid_hex_color(color) {
        return None;
    }
    let digits = &color[1..];
    if digits.len() == 3 {
        let mut out = [0u8; 3];
        for (i, c) in digits.chars().enumerate() {
            let v = c.to_digit(16)? as u8;
            out[i] = v * 17;
        }
        Some(out)
    } else {
        let r = u8::from_str_radix(&digits[0..2], 16).ok()?;
        let g = u8::from_str_radix(&digits[2..4], 16).ok()?;
        let b = u8::from_str_radix(&digits[4..6], 16).ok()?;
        Some([r, g, b])
    }
}

// ============================================================================
// DESERIALIZATION: lenient record, validated into a TextBox
// ============================================================================

/// Wire shape of a text box. Only the geometry is required; everything else
/// falls back to the defaults and is normalized on conversion.
#[derive(Deserialize)]
pub(crate) struct TextBoxRecord {
    x: Option<f32>,
    y: Option<f32>,
    width: Option<f32>,
    height: Option<f32>,
    #[serde(default)]
    text: String,
    #[serde(default = "default_font_size")]
    font_size: f64,
    #[serde(default = "default_font_name")]
    font_name: String,
    #[serde(default = "default_font_color")]
    font_color: String,
    #[serde(default)]
    bold: bool,
    #[serde(default)]
    italic: bool,
    #[serde(default = "default_align")]
    align: String,
}

fn default_font_size() -> f64 {
    DEFAULT_FONT_SIZE as f64
}
fn default_font_name() -> String {
    DEFAULT_FONT_NAME.to_string()
}
fn default_font_color() -> String {
    DEFAULT_FONT_COLOR.to_string()
}
fn default_align() -> String {
    "left".to_string()
}

impl TryFrom<TextBoxRecord> for TextBox {
    type Error = TextBoxError;

    fn try_from(r: TextBoxRecord) -> Result<Self, Self::Error> {
        let x = r.x.ok_or(TextBoxError::MissingField("x"))?;
        let y = r.y.ok_or(TextBoxError::MissingField("y"))?;
        let width = r.width.ok_or(TextBoxError::MissingField("width"))?;
        let height = r.height.ok_or(TextBoxError::MissingField("height"))?;
        let mut tb = TextBox::new(x, y, width, height, r.text)?;
        if !(r.font_size > 0.0) {
            return Err(TextBoxError::InvalidFontSize(0));
        }
        tb.set_font_size(r.font_size.max(1.0) as u32)?;
        tb.font_name = r.font_name;
        tb.set_font_color(&r.font_color);
        tb.bold = r.bold;
        tb.italic = r.italic;
        tb.set_align_str(&r.align);
        Ok(tb)
    }
}

impl<'de> Deserialize<'de> for TextBox {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = TextBoxRecord::deserialize(deserializer)?;
        TextBox::try_from(record).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_size_is_rejected() {
        assert!(matches!(
            TextBox::new(0.0, 0.0, -1.0, 10.0, ""),
            Err(TextBoxError::NegativeSize { .. })
        ));
        assert!(TextBox::new(0.0, 0.0, 0.0, 0.0, "").is_ok());
    }

    #[test]
    fn invalid_color_falls_back_to_black() {
        let mut tb = TextBox::new(0.0, 0.0, 10.0, 10.0, "a").unwrap();
        tb.set_font_color("red");
        assert_eq!(tb.font_color(), "#000000");
        tb.set_font_color("#12G");
        assert_eq!(tb.font_color(), "#000000");
        tb.set_font_color("#f0a");
        assert_eq!(tb.font_color(), "#f0a");
        assert_eq!(tb.rgb(), [255, 0, 170]);
        tb.set_font_color("#102030");
        assert_eq!(tb.rgb(), [0x10, 0x20, 0x30]);
    }

    #[test]
    fn invalid_alignment_becomes_left() {
        let mut tb = TextBox::new(0.0, 0.0, 10.0, 10.0, "a").unwrap();
        tb.set_align_str("right");
        assert_eq!(tb.align, TextAlign::Right);
        tb.set_align_str("justify");
        assert_eq!(tb.align, TextAlign::Left);
    }

    #[test]
    fn deserialize_normalizes_cosmetic_fields() {
        let json = r##"{"x": 1, "y": 2, "width": 30, "height": 40, "text": "hi",
                       "font_color": "blue", "align": "middle"}"##;
        let tb: TextBox = serde_json::from_str(json).unwrap();
        assert_eq!(tb.text, "hi");
        assert_eq!(tb.font_color(), "#000000");
        assert_eq!(tb.align, TextAlign::Left);
        assert_eq!(tb.font_size, DEFAULT_FONT_SIZE);
    }

    #[test]
    fn deserialize_requires_geometry() {
        let err = serde_json::from_str::<TextBox>(r#"{"x": 1, "y": 2, "width": 3}"#).unwrap_err();
        assert!(err.to_string().contains("height"));
        assert!(serde_json::from_str::<TextBox>(r#"{"x":0,"y":0,"width":-5,"height":1}"#).is_err());
    }

    #[test]
    fn serialized_shape_round_trips() {
        let mut tb = TextBox::new(10.0, 10.0, 100.0, 20.0, "A").unwrap();
        tb.set_font_color("#ff0000");
        tb.align = TextAlign::Center;
        let json = serde_json::to_value(&tb).unwrap();
        assert_eq!(json["align"], "center");
        assert_eq!(json["font_color"], "#ff0000");
        let back: TextBox = serde_json::from_value(json).unwrap();
        assert_eq!(back, tb);
    }

    #[test]
    fn hit_testing_helpers() {
        let a = TextBox::new(0.0, 0.0, 10.0, 10.0, "").unwrap();
        let b = TextBox::new(5.0, 5.0, 10.0, 10.0, "").unwrap();
        let c = TextBox::new(50.0, 50.0, 1.0, 1.0, "").unwrap();
        assert!(a.contains_point(10.0, 0.0));
        assert!(!a.contains_point(10.5, 0.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }
}
