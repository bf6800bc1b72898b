//! Type-aware validation and sanitization of raw gateway payloads.
//!
//! Order of checks for every kind:
//! 1. size ceiling for the declared kind
//! 2. dangerous-pattern scan over the raw bytes (fails closed)
//! 3. kind-specific parsing (JSON parse or image sniffing)
//! 4. sanitization and recommended-field warnings (JSON-like kinds)

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde_json::{Map, Value};

use crate::cid::{embedded_cid, is_valid_cid};
use crate::content::{Content, ImageData, ImageMime, RawPayload, ValidatedContent};
use crate::error::ValidationError;
use crate::kind::{ContentKind, ValidationLimits};

/// Keys removed from every JSON object before content leaves the validator.
pub const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Content types that say nothing about the payload; image kind falls back
/// to sniffing when one of these is declared.
const UNDECLARED_TYPES: [&str; 3] = ["application/octet-stream", "binary/octet-stream", "text/plain"];

static DANGEROUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("script tag", r"(?i-u)<\s*script\b"),
        ("javascript uri", r"(?i-u)javascript\s*:"),
        ("vbscript uri", r"(?i-u)vbscript\s*:"),
        (
            "inline event handler",
            r"(?i-u)\bon(?:abort|blur|change|click|dblclick|error|focus|input|keydown|keypress|keyup|load|mousedown|mousemove|mouseout|mouseover|mouseup|reset|resize|scroll|select|submit|unload)\s*=",
        ),
        ("eval call", r"(?i-u)\beval\s*\("),
        ("function constructor", r"(?-u)\bnew\s+Function\s*\("),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("dangerous pattern is valid")))
    .collect()
});

/// Returns the name of the first dangerous pattern found in `bytes`.
pub fn find_dangerous_pattern(bytes: &[u8]) -> Option<&'static str> {
    DANGEROUS_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(bytes))
        .map(|(name, _)| *name)
}

/// Returns the first dangerous pattern found in any decoded string or object
/// key of `value`.
pub fn find_dangerous_in_value(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(s) => find_dangerous_pattern(s.as_bytes()),
        Value::Array(items) => items.iter().find_map(find_dangerous_in_value),
        Value::Object(map) => map.iter().find_map(|(key, child)| {
            find_dangerous_pattern(key.as_bytes()).or_else(|| find_dangerous_in_value(child))
        }),
        _ => None,
    }
}

fn reject_dangerous(bytes: &[u8]) -> Result<(), ValidationError> {
    match find_dangerous_pattern(bytes) {
        Some(pattern) => Err(ValidationError::MaliciousContentDetected {
            pattern: pattern.to_string(),
        }),
        None => Ok(()),
    }
}

/// Recursively strip [`FORBIDDEN_KEYS`] from every object in `value`.
///
/// Returns the number of keys removed.
pub fn sanitize(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let mut removed = 0;
            for key in FORBIDDEN_KEYS {
                if map.remove(key).is_some() {
                    removed += 1;
                }
            }
            for child in map.values_mut() {
                removed += sanitize(child);
            }
            removed
        }
        Value::Array(items) => items.iter_mut().map(sanitize).sum(),
        _ => 0,
    }
}

/// Validates raw payloads against per-kind rules.
#[derive(Debug, Clone, Default)]
pub struct ContentValidator {
    limits: ValidationLimits,
}

impl ContentValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Validate `raw` as `kind`. Never returns partially validated content.
    pub fn validate(
        &self,
        raw: &RawPayload,
        kind: ContentKind,
    ) -> Result<ValidatedContent, ValidationError> {
        let limit = self.limits.for_kind(kind).max_bytes;
        if raw.bytes.len() > limit {
            return Err(ValidationError::SizeExceeded {
                kind,
                size: raw.bytes.len(),
                limit,
            });
        }

        // Raster images are compressed binary; text patterns there are noise.
        let raster = matches!(ImageMime::sniff(&raw.bytes), Some(mime) if mime != ImageMime::Svg);
        if kind.is_json_like() || !raster {
            reject_dangerous(&raw.bytes)?;
        }

        match kind {
            ContentKind::Image => self.validate_image(raw),
            ContentKind::Json => self.validate_json(raw, kind, Content::Json),
            ContentKind::Metadata => self.validate_json(raw, kind, Content::Metadata),
            ContentKind::Profile => self.validate_json(raw, kind, Content::Profile),
        }
    }

    fn validate_image(&self, raw: &RawPayload) -> Result<ValidatedContent, ValidationError> {
        let declared = raw
            .content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase())
            .filter(|ct| !ct.is_empty() && !UNDECLARED_TYPES.contains(&ct.as_str()));

        if let Some(mime) = &declared {
            if ImageMime::from_mime(mime).is_none() {
                return Err(ValidationError::InvalidMimeType { mime: mime.clone() });
            }
        }

        let sniffed = ImageMime::sniff(&raw.bytes).ok_or_else(|| {
            ValidationError::MalformedPayload {
                kind: ContentKind::Image,
                reason: "payload does not match any supported image signature".to_string(),
            }
        })?;

        Ok(ValidatedContent {
            content: Content::Image(ImageData {
                mime: sniffed,
                bytes: raw.bytes.as_slice().into(),
            }),
            warnings: Vec::new(),
            stripped_keys: 0,
        })
    }

    fn validate_json(
        &self,
        raw: &RawPayload,
        kind: ContentKind,
        wrap: fn(Value) -> Content,
    ) -> Result<ValidatedContent, ValidationError> {
        let mut value: Value =
            serde_json::from_slice(&raw.bytes).map_err(|e| ValidationError::MalformedPayload {
                kind,
                reason: e.to_string(),
            })?;

        // Escapes such as \u003c only become markup once decoded.
        if let Some(pattern) = find_dangerous_in_value(&value) {
            return Err(ValidationError::MaliciousContentDetected {
                pattern: pattern.to_string(),
            });
        }

        if matches!(kind, ContentKind::Metadata | ContentKind::Profile) && !value.is_object() {
            return Err(ValidationError::MalformedPayload {
                kind,
                reason: "expected a JSON object".to_string(),
            });
        }

        let stripped_keys = sanitize(&mut value);
        let mut warnings = Vec::new();
        if stripped_keys > 0 {
            warnings.push(format!("stripped {} prototype-pollution key(s)", stripped_keys));
        }

        if let Value::Object(map) = &value {
            warnings.extend(self.missing_recommended(map, kind));
        }
        if matches!(kind, ContentKind::Metadata | ContentKind::Profile) {
            collect_bad_references(&value, "", &mut warnings);
        }

        Ok(ValidatedContent {
            content: wrap(value),
            warnings,
            stripped_keys,
        })
    }

    fn missing_recommended(&self, map: &Map<String, Value>, kind: ContentKind) -> Vec<String> {
        self.limits
            .for_kind(kind)
            .recommended_fields
            .iter()
            .filter(|field| match map.get(field.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .map(|field| format!("missing recommended field '{}'", field))
            .collect()
    }
}

fn collect_bad_references(value: &Value, path: &str, warnings: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(cid) = embedded_cid(s) {
                if !is_valid_cid(cid) {
                    warnings.push(format!("invalid IPFS reference at '{}': {}", path, s));
                }
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                collect_bad_references(child, &child_path, warnings);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                collect_bad_references(child, &format!("{}[{}]", path, idx), warnings);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::KindLimits;
    use proptest::prelude::*;
    use serde_json::json;

    const V0: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
    const PNG: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

    fn json_payload(value: &Value) -> RawPayload {
        RawPayload::new(serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn test_json_passes_and_sanitizes() {
        let validator = ContentValidator::default();
        let raw = RawPayload::new(
            br#"{"a":1,"__proto__":{"admin":true},"nested":[{"constructor":"x","ok":2}]}"#.to_vec(),
        );
        let out = validator.validate(&raw, ContentKind::Json).unwrap();
        assert_eq!(out.content, Content::Json(json!({"a": 1, "nested": [{"ok": 2}]})));
        assert_eq!(out.stripped_keys, 2);
        assert!(!out.warnings.is_empty());
    }

    #[test]
    fn test_size_ceiling_per_kind() {
        let mut limits = ValidationLimits::default();
        limits.json = KindLimits::new(16, &[]);
        let validator = ContentValidator::new(limits);
        let raw = json_payload(&json!({"data": "0123456789abcdef"}));

        let err = validator.validate(&raw, ContentKind::Json).unwrap_err();
        assert!(matches!(err, ValidationError::SizeExceeded { limit: 16, .. }));
        // metadata ceiling is still the default 100 KB
        assert!(validator.validate(&raw, ContentKind::Metadata).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let validator = ContentValidator::default();
        let err = validator
            .validate(&RawPayload::new(b"{not json".to_vec()), ContentKind::Json)
            .unwrap_err();
        assert_eq!(err.reason_code(), "MALFORMED_PAYLOAD");

        let err = validator
            .validate(&RawPayload::new(b"[1,2,3]".to_vec()), ContentKind::Profile)
            .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedPayload { .. }));
    }

    #[test]
    fn test_script_rejected_for_every_kind() {
        let validator = ContentValidator::default();
        let payload = json_payload(&json!({"name": "<script>alert(1)</script>"}));
        for kind in ContentKind::ALL {
            let err = validator.validate(&payload, kind).unwrap_err();
            assert!(
                matches!(err, ValidationError::MaliciousContentDetected { .. }),
                "kind {} gave {:?}",
                kind,
                err
            );
        }
    }

    #[test]
    fn test_escaped_markup_is_rejected_after_decoding() {
        let validator = ContentValidator::default();
        let raw = RawPayload::new(
            br#"{"name":"x","description":"\u003cscript\u003ealert(1)\u003c/script\u003e"}"#.to_vec(),
        );
        for kind in [ContentKind::Json, ContentKind::Metadata, ContentKind::Profile] {
            let err = validator.validate(&raw, kind).unwrap_err();
            assert_eq!(
                err,
                ValidationError::MaliciousContentDetected {
                    pattern: "script tag".to_string()
                }
            );
        }

        let uri = RawPayload::new(br#"{"name":"x","link":"javascript\u003aalert(1)"}"#.to_vec());
        let err = validator.validate(&uri, ContentKind::Metadata).unwrap_err();
        assert_eq!(err.reason_code(), "MALICIOUS_CONTENT_DETECTED");
    }

    #[test]
    fn test_escaped_markup_in_object_key_is_rejected() {
        let validator = ContentValidator::default();
        let raw = RawPayload::new(br#"{"items":[{"\u003cscript\u003e":1}]}"#.to_vec());
        let err = validator.validate(&raw, ContentKind::Json).unwrap_err();
        assert!(matches!(err, ValidationError::MaliciousContentDetected { .. }));
    }

    #[test]
    fn test_raster_image_bytes_are_not_text_scanned() {
        let validator = ContentValidator::default();
        let mut bytes = PNG.to_vec();
        bytes.extend_from_slice(b"\x00tEXtComment\x00onload = eval(1)");
        let raw = RawPayload::new(bytes).with_content_type("image/png");

        let out = validator.validate(&raw, ContentKind::Image).unwrap();
        assert_eq!(out.content.as_image().map(|i| i.mime), Some(ImageMime::Png));
    }

    #[test]
    fn test_other_dangerous_patterns() {
        assert_eq!(find_dangerous_pattern(b"<a href=\"JavaScript:void(0)\">"), Some("javascript uri"));
        assert_eq!(find_dangerous_pattern(b"<img src=x onerror = \"x\">"), Some("inline event handler"));
        assert_eq!(find_dangerous_pattern(b"eval (atob('x'))"), Some("eval call"));
        assert_eq!(find_dangerous_pattern(b"new Function('return 1')"), Some("function constructor"));
        assert_eq!(find_dangerous_pattern(b"{\"condition\": \"one = two\"}"), None);
        assert_eq!(find_dangerous_pattern(b"{\"description\": \"medieval (1200s)\"}"), None);
    }

    #[test]
    fn test_svg_with_script_is_rejected() {
        let validator = ContentValidator::default();
        let raw = RawPayload::new(b"<svg onload=\"steal()\"></svg>".to_vec())
            .with_content_type("image/svg+xml");
        let err = validator.validate(&raw, ContentKind::Image).unwrap_err();
        assert!(matches!(err, ValidationError::MaliciousContentDetected { .. }));
    }

    #[test]
    fn test_image_mime_allow_list() {
        let validator = ContentValidator::default();

        let ok = RawPayload::new(PNG.to_vec()).with_content_type("image/png");
        let out = validator.validate(&ok, ContentKind::Image).unwrap();
        assert_eq!(out.content.as_image().map(|i| i.mime), Some(ImageMime::Png));

        let undeclared = RawPayload::new(PNG.to_vec()).with_content_type("application/octet-stream");
        assert!(validator.validate(&undeclared, ContentKind::Image).is_ok());

        let bmp = RawPayload::new(PNG.to_vec()).with_content_type("image/bmp");
        let err = validator.validate(&bmp, ContentKind::Image).unwrap_err();
        assert_eq!(err, ValidationError::InvalidMimeType { mime: "image/bmp".to_string() });

        let html = RawPayload::new(PNG.to_vec()).with_content_type("text/html; charset=utf-8");
        assert!(matches!(
            validator.validate(&html, ContentKind::Image),
            Err(ValidationError::InvalidMimeType { .. })
        ));
    }

    #[test]
    fn test_non_image_bytes_are_malformed() {
        let validator = ContentValidator::default();
        let raw = RawPayload::new(b"{\"name\":\"x\"}".to_vec());
        let err = validator.validate(&raw, ContentKind::Image).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedPayload { kind: ContentKind::Image, .. }));
    }

    #[test]
    fn test_missing_recommended_fields_only_warn() {
        let validator = ContentValidator::default();
        let raw = json_payload(&json!({"name": "Token #1", "description": ""}));
        let out = validator.validate(&raw, ContentKind::Metadata).unwrap();
        assert!(out.warnings.iter().any(|w| w.contains("'description'")));
        assert!(out.warnings.iter().any(|w| w.contains("'image'")));
        assert!(!out.warnings.iter().any(|w| w.contains("'name'")));
    }

    #[test]
    fn test_embedded_reference_checks() {
        let validator = ContentValidator::default();
        let raw = json_payload(&json!({
            "name": "n",
            "bio": "b",
            "avatar": format!("ipfs://{}", V0),
            "links": ["ipfs://not-a-cid"],
        }));
        let out = validator.validate(&raw, ContentKind::Profile).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("links[0]"));
    }

    proptest! {
        #[test]
        fn prop_sanitize_leaves_no_forbidden_keys(
            keys in prop::collection::vec(
                prop_oneof![
                    Just("__proto__".to_string()),
                    Just("constructor".to_string()),
                    Just("prototype".to_string()),
                    "[a-z]{1,6}",
                ],
                0..8,
            ),
            depth in 0usize..4,
        ) {
            let mut value = Value::Object(keys.iter().map(|k| (k.clone(), json!(1))).collect());
            for _ in 0..depth {
                let mut map = Map::new();
                for k in &keys {
                    map.insert(k.clone(), value.clone());
                }
                value = Value::Array(vec![Value::Object(map)]);
            }
            sanitize(&mut value);
            let text = value.to_string();
            for key in FORBIDDEN_KEYS {
                let quoted = format!("\"{}\"", key);
                prop_assert!(!text.contains(&quoted));
            }
        }
    }
}
