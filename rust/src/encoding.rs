//! Text-safe encoding for binary blobs. The backing store is cell oriented,
//! so wrapped keys, field envelopes and generated salts travel as base58
//! strings (Bitcoin alphabet).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("base58 decoding failed: {0}")]
    Base58DecodeFailed(String),
}

pub fn encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decodes a stored blob. Surrounding whitespace from manual cell edits is ignored.
pub fn decode(text: &str) -> Result<Vec<u8>, EncodingError> {
    bs58::decode(text.trim())
        .into_vec()
        .map_err(|e| EncodingError::Base58DecodeFailed(format!("{e}")))
}

#[cfg(test)]
mod tests {
    use super::{decode, encode};

    #[test]
    fn matches_known_base58_text() {
        assert_eq!(encode(b"hello world"), "StV1DL6CwTryKyV");
        assert_eq!(decode("StV1DL6CwTryKyV").unwrap(), b"hello world");
    }

    #[test]
    fn keeps_leading_zero_bytes() {
        assert_eq!(encode(&[0, 0, 1]), "112");
        assert_eq!(decode("112").unwrap(), vec![0, 0, 1]);
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        assert_eq!(decode("  StV1DL6CwTryKyV\n").unwrap(), b"hello world");
    }

    #[test]
    fn rejects_characters_outside_the_alphabet() {
        for bad in ["0OIl", "abc+/", "with space"] {
            let err = decode(bad).unwrap_err();
            assert!(format!("{err}").contains("base58 decoding failed"), "{bad:?}");
        }
    }
}
