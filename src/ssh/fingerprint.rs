//! Host key fingerprints
//!
//! Fingerprints are accepted in the two forms users paste in practice:
//! `SHA256:<base64>` as printed by `ssh-keygen -l`, and 64 hex digits
//! (optionally colon separated). Internally both reduce to lowercase hex.

use std::fmt;

use base64::engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

const SHA256_PREFIX: &str = "SHA256:";
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("fingerprint is empty")]
    Missing,

    #[error("unrecognised fingerprint format: {0:?}")]
    InvalidFormat(String),
}

/// A SHA-256 host key fingerprint
#[derive(Debug, Clone, Eq)]
pub struct Fingerprint {
    display: String,
    normalized_hex: String,
}

impl Fingerprint {
    /// Parse a fingerprint from configuration or user input.
    pub fn parse(raw: &str) -> Result<Self, FingerprintError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FingerprintError::Missing);
        }

        let prefix_len = SHA256_PREFIX.len();
        if trimmed
            .get(..prefix_len)
            .is_some_and(|p| p.eq_ignore_ascii_case(SHA256_PREFIX))
        {
            let encoded = trimmed[prefix_len..].trim().trim_end_matches('=');
            let digest = BASE64_NO_PAD
                .decode(encoded)
                .map_err(|_| FingerprintError::InvalidFormat(trimmed.to_string()))?;
            if digest.len() != DIGEST_LEN {
                return Err(FingerprintError::InvalidFormat(trimmed.to_string()));
            }
            return Ok(Self::from_digest(&digest));
        }

        if trimmed.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            let hex_digits: String = trimmed.chars().filter(|c| *c != ':').collect();
            if hex_digits.len() == DIGEST_LEN * 2 {
                return Self::from_digest_hex(&hex_digits);
            }
        }

        Err(FingerprintError::InvalidFormat(trimmed.to_string()))
    }

    /// Fingerprint of a raw public key blob (SSH wire encoding).
    pub fn of_key_bytes(key_bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key_bytes);
        Self::from_digest(&hasher.finalize())
    }

    /// Fingerprint from an already computed digest given as hex.
    pub fn from_digest_hex(digest_hex: &str) -> Result<Self, FingerprintError> {
        let digest = hex::decode(digest_hex.trim())
            .map_err(|_| FingerprintError::InvalidFormat(digest_hex.to_string()))?;
        if digest.len() != DIGEST_LEN {
            return Err(FingerprintError::InvalidFormat(digest_hex.to_string()));
        }
        Ok(Self::from_digest(&digest))
    }

    fn from_digest(digest: &[u8]) -> Self {
        Self {
            display: format!("{}{}", SHA256_PREFIX, BASE64.encode(digest)),
            normalized_hex: hex::encode(digest),
        }
    }

    /// `SHA256:<standard base64 with padding>`
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Lowercase hex digest
    pub fn normalized_hex(&self) -> &str {
        &self.normalized_hex
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_hex
            .eq_ignore_ascii_case(&other.normalized_hex)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches the pinned fingerprint
    Verified,
    /// Nothing pinned yet; caller persists the observed fingerprint
    FirstUse,
    /// Key differs from the pinned fingerprint
    Mismatch {
        expected: Fingerprint,
        received: Fingerprint,
    },
}

impl HostKeyVerification {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, HostKeyVerification::Mismatch { .. })
    }
}

/// Compare an observed fingerprint against the pinned one.
pub fn verify(observed: &Fingerprint, expected: Option<&Fingerprint>) -> HostKeyVerification {
    match expected {
        None => HostKeyVerification::FirstUse,
        Some(expected) if expected == observed => HostKeyVerification::Verified,
        Some(expected) => HostKeyVerification::Mismatch {
            expected: expected.clone(),
            received: observed.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DEADBEEF_HEX: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    #[test]
    fn test_parse_hex_and_base64_agree() {
        let from_hex = Fingerprint::parse(DEADBEEF_HEX).unwrap();
        let from_b64 = Fingerprint::parse(from_hex.display()).unwrap();
        assert_eq!(from_hex.normalized_hex(), DEADBEEF_HEX);
        assert_eq!(from_hex, from_b64);
        assert!(from_hex.display().starts_with("SHA256:"));
        assert!(from_hex.display().ends_with('='));
    }

    #[test]
    fn test_parse_accepts_unpadded_base64() {
        let fp = Fingerprint::parse(DEADBEEF_HEX).unwrap();
        let unpadded = fp.display().trim_end_matches('=').to_string();
        assert_eq!(Fingerprint::parse(&unpadded).unwrap(), fp);
    }

    #[test]
    fn test_parse_colon_separated_uppercase_hex() {
        let colon: String = DEADBEEF_HEX
            .to_uppercase()
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(":");
        let fp = Fingerprint::parse(&format!("  {}\n", colon)).unwrap();
        assert_eq!(fp.normalized_hex(), DEADBEEF_HEX);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Fingerprint::parse("   "), Err(FingerprintError::Missing));
        assert!(matches!(
            Fingerprint::parse("SHA256:AAAA"),
            Err(FingerprintError::InvalidFormat(_))
        ));
        assert!(matches!(
            Fingerprint::parse("MD5:aa:bb"),
            Err(FingerprintError::InvalidFormat(_))
        ));
        assert!(matches!(
            Fingerprint::parse("abcdef"),
            Err(FingerprintError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_of_key_bytes_matches_sha256() {
        // sha256("") is well known
        let fp = Fingerprint::of_key_bytes(b"");
        assert_eq!(
            fp.normalized_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            fp.display(),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn test_verify() {
        let observed = Fingerprint::parse(DEADBEEF_HEX).unwrap();
        let other = Fingerprint::of_key_bytes(b"other key");

        assert_eq!(verify(&observed, None), HostKeyVerification::FirstUse);
        assert_eq!(verify(&observed, Some(&observed.clone())), HostKeyVerification::Verified);
        match verify(&observed, Some(&other)) {
            HostKeyVerification::Mismatch { expected, received } => {
                assert_eq!(expected, other);
                assert_eq!(received, observed);
            }
            v => panic!("expected mismatch, got {:?}", v),
        }
    }

    proptest! {
        #[test]
        fn prop_parse_is_left_inverse_of_display(bytes in proptest::collection::vec(any::<u8>(), 32)) {
            let fp = Fingerprint::from_digest_hex(&hex::encode(&bytes)).unwrap();
            let reparsed = Fingerprint::parse(fp.display()).unwrap();
            prop_assert_eq!(reparsed.normalized_hex(), fp.normalized_hex());
        }

        #[test]
        fn prop_verify_ignores_formatting(bytes in proptest::collection::vec(any::<u8>(), 32), upper in any::<bool>(), colons in any::<bool>()) {
            let plain = hex::encode(&bytes);
            let mut styled = if upper { plain.to_uppercase() } else { plain.clone() };
            if colons {
                styled = styled
                    .as_bytes()
                    .chunks(2)
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect::<Vec<_>>()
                    .join(":");
            }
            let observed = Fingerprint::parse(&plain).unwrap();
            let pinned = Fingerprint::parse(&format!(" {} ", styled)).unwrap();
            prop_assert!(verify(&observed, Some(&pinned)).is_trusted());

            let mut flipped = bytes.clone();
            flipped[0] ^= 0x01;
            let different = Fingerprint::parse(&hex::encode(&flipped)).unwrap();
            prop_assert!(!verify(&observed, Some(&different)).is_trusted());
        }
    }
}
