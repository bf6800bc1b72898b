//! Content kinds and per-kind validation limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CONTENT KIND
// ============================================================================

/// The declared kind of a payload. Selects validation rules and size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Arbitrary JSON document.
    Json,
    /// Binary image (jpeg/png/gif/webp) or SVG.
    Image,
    /// Token/asset metadata document (JSON object).
    Metadata,
    /// User profile document (JSON object).
    Profile,
}

impl ContentKind {
    /// All kinds, in declaration order.
    pub const ALL: [ContentKind; 4] = [
        ContentKind::Json,
        ContentKind::Image,
        ContentKind::Metadata,
        ContentKind::Profile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Json => "json",
            ContentKind::Image => "image",
            ContentKind::Metadata => "metadata",
            ContentKind::Profile => "profile",
        }
    }

    /// Whether payloads of this kind are parsed as JSON.
    pub fn is_json_like(&self) -> bool {
        match self {
            ContentKind::Json | ContentKind::Metadata | ContentKind::Profile => true,
            ContentKind::Image => false,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ContentKind::Json),
            "image" => Ok(ContentKind::Image),
            "metadata" => Ok(ContentKind::Metadata),
            "profile" => Ok(ContentKind::Profile),
            other => Err(format!("Invalid content kind: {}", other)),
        }
    }
}

// ============================================================================
// VALIDATION LIMITS
// ============================================================================

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Size ceiling and recommended (non-fatal) fields for one content kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KindLimits {
    /// Maximum payload size in bytes.
    pub max_bytes: usize,
    /// Top-level fields whose absence only produces a warning.
    #[serde(default)]
    pub recommended_fields: Vec<String>,
}

impl KindLimits {
    pub fn new(max_bytes: usize, recommended_fields: &[&str]) -> Self {
        Self {
            max_bytes,
            recommended_fields: recommended_fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Static per-kind limits table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationLimits {
    pub json: KindLimits,
    pub image: KindLimits,
    pub metadata: KindLimits,
    pub profile: KindLimits,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            json: KindLimits::new(500 * KB, &[]),
            image: KindLimits::new(10 * MB, &[]),
            metadata: KindLimits::new(100 * KB, &["name", "description", "image"]),
            profile: KindLimits::new(50 * KB, &["name", "bio"]),
        }
    }
}

impl ValidationLimits {
    pub fn for_kind(&self, kind: ContentKind) -> &KindLimits {
        match kind {
            ContentKind::Json => &self.json,
            ContentKind::Image => &self.image,
            ContentKind::Metadata => &self.metadata,
            ContentKind::Profile => &self.profile,
        }
    }
}
