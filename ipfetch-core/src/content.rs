//! Raw and validated content types.

use crate::ContentKind;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Bytes returned by a gateway, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    /// `Content-Type` header as sent by the gateway, if any.
    pub content_type: Option<String>,
    /// Base URL of the gateway that served the bytes.
    pub source: Option<String>,
}

impl RawPayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
            source: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Allow-listed image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageMime {
    Jpeg,
    Png,
    Gif,
    Webp,
    Svg,
}

impl ImageMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMime::Jpeg => "image/jpeg",
            ImageMime::Png => "image/png",
            ImageMime::Gif => "image/gif",
            ImageMime::Webp => "image/webp",
            ImageMime::Svg => "image/svg+xml",
        }
    }

    /// Map a MIME string (parameters allowed) onto the allow-list.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageMime::Jpeg),
            "image/png" => Some(ImageMime::Png),
            "image/gif" => Some(ImageMime::Gif),
            "image/webp" => Some(ImageMime::Webp),
            "image/svg+xml" | "image/svg" => Some(ImageMime::Svg),
            _ => None,
        }
    }

    /// Identify an image format from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageMime::Jpeg);
        }
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(ImageMime::Png);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(ImageMime::Gif);
        }
        if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(ImageMime::Webp);
        }
        let head = &bytes[..bytes.len().min(512)];
        let text = String::from_utf8_lossy(head);
        let text = text.trim_start_matches('\u{feff}').trim_start();
        if text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg")) {
            return Some(ImageMime::Svg);
        }
        None
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub mime: ImageMime,
    pub bytes: Arc<[u8]>,
}

/// Content that passed validation for its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(Value),
    Image(ImageData),
    Metadata(Value),
    Profile(Value),
}

impl Content {
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Json(_) => ContentKind::Json,
            Content::Image(_) => ContentKind::Image,
            Content::Metadata(_) => ContentKind::Metadata,
            Content::Profile(_) => ContentKind::Profile,
        }
    }

    /// JSON body for the JSON-like kinds.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Content::Json(v) | Content::Metadata(v) | Content::Profile(v) => Some(v),
            Content::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageData> {
        match self {
            Content::Image(img) => Some(img),
            _ => None,
        }
    }

    /// Approximate in-memory footprint, used for cache accounting.
    pub fn approx_size(&self) -> usize {
        match self {
            Content::Image(img) => img.bytes.len(),
            Content::Json(v) | Content::Metadata(v) | Content::Profile(v) => {
                serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0)
            }
        }
    }
}

/// Output of the content validator: the content plus non-fatal warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedContent {
    pub content: Content,
    pub warnings: Vec<String>,
    /// Number of prototype-pollution keys removed during sanitization.
    pub stripped_keys: usize,
}
