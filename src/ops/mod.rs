pub mod ai;
pub mod inpaint;
pub mod mask;
pub mod ocr;
pub mod text;

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, ImageFormat};

/// Failure talking to an external collaborator (OCR, inpaint, image generation).
#[derive(Debug)]
pub enum ServiceError {
    /// The service is switched off in settings or not configured.
    Disabled(String),
    /// Could not reach the service.
    Connection(String),
    /// The service answered with a non-success status.
    Status { code: u16, body: String },
    /// The reply could not be understood.
    Decode(String),
    /// The local engine failed.
    Engine(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Disabled(what) => write!(f, "{} is disabled", what),
            ServiceError::Connection(e) => write!(f, "connection failed: {}", e),
            ServiceError::Status { code, body } => write!(f, "service returned {}: {}", code, body),
            ServiceError::Decode(e) => write!(f, "could not decode reply: {}", e),
            ServiceError::Engine(e) => write!(f, "engine error: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else {
            ServiceError::Connection(e.to_string())
        }
    }
}

impl From<image::ImageError> for ServiceError {
    fn from(e: image::ImageError) -> Self {
        ServiceError::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for ServiceError {
    fn from(e: base64::DecodeError) -> Self {
        ServiceError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Decode(e.to_string())
    }
}

/// Encode an image as base64 PNG for a JSON request body.
pub fn png_base64(img: &DynamicImage) -> Result<String, ServiceError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(BASE64.encode(buf.into_inner()))
}

/// Decode base64 (optionally a `data:image/...;base64,` URL) into an image.
pub fn decode_base64_image(data: &str) -> Result<DynamicImage, ServiceError> {
    let payload = match data.split_once(',') {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = BASE64.decode(payload.trim())?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Short wall-clock tag (`HHMMSS`, UTC) for naming generated layers.
pub(crate) fn time_tag() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    format!("{:02}{:02}{:02}", (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60)
}

/// Keep the first `max` characters of a response body for error messages.
pub(crate) fn truncate_body(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}
