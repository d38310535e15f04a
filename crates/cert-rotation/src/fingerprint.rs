//! Normalized certificate thumbprints

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper-case hex thumbprint (SHA-1 or SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Normalize a thumbprint as copied from a certificate dialog or store listing
    ///
    /// Colons, whitespace and the invisible left-to-right mark Windows puts
    /// in front of copied thumbprints are stripped.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidFingerprint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let cleaned: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ':' && *c != '\u{200e}' && *c != '\u{feff}')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if cleaned.is_empty() {
            return Err(invalid("empty"));
        }
        if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("not hexadecimal"));
        }
        if cleaned.len() != 40 && cleaned.len() != 64 {
            return Err(invalid("expected 40 or 64 hex digits"));
        }
        Ok(Self(cleaned))
    }

    /// The normalized hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Fingerprint::parse(&value)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Fingerprint::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1: &str = "3B2F5C1D9A0E4F6B7C8D9E0F1A2B3C4D5E6F7A8B";

    #[test]
    fn test_normalization() {
        let fp = Fingerprint::parse("3b 2f 5c 1d 9a 0e 4f 6b 7c 8d 9e 0f 1a 2b 3c 4d 5e 6f 7a 8b").unwrap();
        assert_eq!(fp.as_str(), SHA1);

        let fp = Fingerprint::parse("\u{200e}3B:2F:5C:1D:9A:0E:4F:6B:7C:8D:9E:0F:1A:2B:3C:4D:5E:6F:7A:8B").unwrap();
        assert_eq!(fp.as_str(), SHA1);

        let sha256 = "a".repeat(64);
        assert_eq!(Fingerprint::parse(&sha256).unwrap().as_str(), "A".repeat(64));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse("XYZ").is_err());
        assert!(Fingerprint::parse(&SHA1[..38]).is_err());
        let err = Fingerprint::parse(&format!("{}G1", &SHA1[..38])).unwrap_err();
        assert!(err.to_string().contains("not hexadecimal"));
    }

    #[test]
    fn test_serde_normalizes() {
        let fp: Fingerprint = serde_json::from_str(&format!("\"{}\"", SHA1.to_lowercase())).unwrap();
        assert_eq!(fp.as_str(), SHA1);
        assert_eq!(serde_json::to_string(&fp).unwrap(), format!("\"{}\"", SHA1));
        assert!(serde_json::from_str::<Fingerprint>("\"nope\"").is_err());
    }
}
