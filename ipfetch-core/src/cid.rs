//! Content identifier syntax checks.
//!
//! A CID is treated as an opaque lookup key. Only its textual shape is
//! checked here; no multihash decoding takes place.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FetchError;

/// CIDv0: `Qm` followed by 44 base58btc characters (46 total).
static CID_V0: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Qm[1-9A-HJ-NP-Za-km-z]{44}$").expect("CIDv0 pattern is valid")
});

/// CIDv1: multibase prefix `b` (base32 lower) or `z` (base58btc).
static CID_V1: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:b[a-z2-7]{58,}|z[1-9A-HJ-NP-Za-km-z]{48,})$").expect("CIDv1 pattern is valid")
});

/// Returns true if `s` has the shape of a v0 or v1 content identifier.
pub fn is_valid_cid(s: &str) -> bool {
    CID_V0.is_match(s) || CID_V1.is_match(s)
}

/// Recognized CID encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CidVersion {
    V0,
    V1,
}

/// A syntactically valid content identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    /// Parse a CID, rejecting anything that fails [`is_valid_cid`].
    pub fn parse(s: impl Into<String>) -> Result<Self, FetchError> {
        let s = s.into();
        if is_valid_cid(&s) {
            Ok(Self(s))
        } else {
            Err(FetchError::InvalidCid { cid: s })
        }
    }

    pub fn version(&self) -> CidVersion {
        if self.0.starts_with("Qm") {
            CidVersion::V0
        } else {
            CidVersion::V1
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Cid {
    type Error = FetchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Cid::parse(value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

/// Extract the CID from an `ipfs://<cid>[/path]` or `/ipfs/<cid>[/path]` reference.
///
/// Returns `None` when the string is not an IPFS reference at all.
pub fn embedded_cid(reference: &str) -> Option<&str> {
    let rest = reference
        .strip_prefix("ipfs://")
        .or_else(|| reference.strip_prefix("/ipfs/"))?;
    let rest = rest.strip_prefix("ipfs/").unwrap_or(rest);
    Some(rest.split(['/', '?', '#']).next().unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const V0: &str = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG";
    const V1_B32: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";
    const V1_B58: &str = "zdj7WWeQ43G6JJvLWQWZpyHuAMq6uYWRjkBXFad11vE2LHhQ7";

    #[test]
    fn test_accepts_known_cids() {
        assert!(is_valid_cid(V0));
        assert!(is_valid_cid(V1_B32));
        assert!(is_valid_cid(V1_B58));
    }

    #[test]
    fn test_rejects_malformed_cids() {
        assert!(!is_valid_cid(""));
        assert!(!is_valid_cid("Qm123"));
        // '0', 'O', 'I', 'l' are not base58
        assert!(!is_valid_cid("Qm0wAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG"));
        // v0 must be exactly 46 chars
        assert!(!is_valid_cid(&format!("{}a", V0)));
        // uppercase is not base32 lower
        assert!(!is_valid_cid(&V1_B32.to_uppercase()));
        assert!(!is_valid_cid(&format!(" {}", V0)));
        assert!(!is_valid_cid("bafy"));
    }

    #[test]
    fn test_cid_version() {
        assert_eq!(Cid::parse(V0).map(|c| c.version()), Ok(CidVersion::V0));
        assert_eq!(Cid::parse(V1_B32).map(|c| c.version()), Ok(CidVersion::V1));
        assert!(matches!(
            Cid::parse("nope"),
            Err(FetchError::InvalidCid { .. })
        ));
    }

    #[test]
    fn test_embedded_cid_extraction() {
        assert_eq!(embedded_cid(&format!("ipfs://{}", V0)), Some(V0));
        assert_eq!(embedded_cid(&format!("ipfs://{}/image.png", V0)), Some(V0));
        assert_eq!(embedded_cid(&format!("ipfs://ipfs/{}", V0)), Some(V0));
        assert_eq!(embedded_cid(&format!("/ipfs/{}?x=1", V1_B32)), Some(V1_B32));
        assert_eq!(embedded_cid("https://example.com/a.png"), None);
    }

    proptest! {
        #[test]
        fn prop_v0_shape_always_valid(body in "[1-9A-HJ-NP-Za-km-z]{44}") {
            let cid = format!("Qm{}", body);
            prop_assert!(is_valid_cid(&cid));
        }

        #[test]
        fn prop_short_strings_never_valid(s in "[a-zA-Z0-9]{0,45}") {
            prop_assert!(!is_valid_cid(&s));
        }
    }
}
