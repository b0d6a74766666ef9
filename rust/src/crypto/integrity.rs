//! Hashing and MAC helpers for the hybrid envelope. Kept apart from the
//! envelope itself so tag comparison has a single constant-time path.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};
use thiserror::Error;

/// SHA-512 output length, also the HMAC-SHA512 tag length.
pub const SHA512_SIZE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("hmac failed: {0}")]
    HmacFailed(String),
    #[error("hmac tag mismatch")]
    TagMismatch,
}

type HmacSha512 = Hmac<Sha512>;

/// Produces a raw SHA-512 digest of the provided bytes.
pub fn sha512_digest(data: &[u8]) -> [u8; SHA512_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    let mut digest = [0u8; SHA512_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn keyed(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha512, IntegrityError> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| IntegrityError::HmacFailed(format!("{e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// HMAC-SHA512 over the concatenation of `parts`.
pub fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<[u8; SHA512_SIZE], IntegrityError> {
    let mut tag = [0u8; SHA512_SIZE];
    tag.copy_from_slice(&keyed(key, parts)?.finalize().into_bytes());
    Ok(tag)
}

/// Recomputes the tag over `parts` and compares it with `tag` in constant time.
pub fn verify_hmac_sha512(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), IntegrityError> {
    keyed(key, parts)?
        .verify_slice(tag)
        .map_err(|_| IntegrityError::TagMismatch)
}

#[cfg(test)]
mod tests {
    use super::{hmac_sha512, sha512_digest, verify_hmac_sha512, IntegrityError};
    use hex::ToHex;

    #[test]
    fn hashes_empty_input() {
        assert_eq!(
            sha512_digest(b"").encode_hex::<String>(),
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
             47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
    }

    #[test]
    fn builds_rfc4231_hmac() {
        let tag = hmac_sha512(b"Jefe", &[b"what do ya want ", b"for nothing?"])
            .expect("hmac should succeed");
        assert_eq!(
            tag.encode_hex::<String>(),
            "164b7a7bfcf819e2e395fbe73b56e0a387bd64222e831fd610270cd7ea250554\
             9758bf75c05a994a6d034f65f8f0e6fdcaeab1a34d4a6b4b636e070a38bce737"
        );
    }

    #[test]
    fn verifies_and_rejects_tags() {
        let tag = hmac_sha512(b"key", &[b"iv", b"body"]).unwrap();
        assert!(verify_hmac_sha512(b"key", &[b"ivbody"], &tag).is_ok());

        let mut bad = tag;
        bad[63] ^= 0x80;
        assert_eq!(
            verify_hmac_sha512(b"key", &[b"ivbody"], &bad).unwrap_err(),
            IntegrityError::TagMismatch
        );
        assert_eq!(
            verify_hmac_sha512(b"key", &[b"ivbody"], &tag[..32]).unwrap_err(),
            IntegrityError::TagMismatch
        );
    }
}
