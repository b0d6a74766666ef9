//! Wrapping-key derivation built around PBKDF2-HMAC-SHA512.
//! The parameters are centralized so every wrapping of the private key uses
//! the same iteration count and output length.

use std::fmt;

use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// PBKDF2 rounds for production derivations.
/// - 200k rounds of HMAC-SHA512 keep offline guessing expensive
/// - a record wrapped under one count cannot be opened under another
pub const ITERATIONS: u32 = 200_000;

/// Output length, sized for an AES-256 key.
pub const WRAPPING_KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KdfError {
    #[error("key derivation input invalid: {0}")]
    InvalidInput(&'static str),
}

/// Symmetric key that wraps the private key. Never persisted; zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey([u8; WRAPPING_KEY_LEN]);

impl WrappingKey {
    pub fn as_bytes(&self) -> &[u8; WRAPPING_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivation {
    iterations: u32,
}

impl Default for KeyDerivation {
    fn default() -> Self {
        Self {
            iterations: ITERATIONS,
        }
    }
}

impl KeyDerivation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reduced round count so suites that wrap keys repeatedly stay fast.
    #[cfg(test)]
    pub(crate) fn with_iterations(iterations: u32) -> Self {
        Self { iterations }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Derives the wrapping key for `password` under `salt`. Deterministic
    /// and deliberately slow; keep it off latency-sensitive paths.
    pub fn derive(&self, password: &[u8], salt: &[u8]) -> Result<WrappingKey, KdfError> {
        if salt.is_empty() {
            return Err(KdfError::InvalidInput("salt must not be empty"));
        }
        if self.iterations == 0 {
            return Err(KdfError::InvalidInput("iteration count must be positive"));
        }

        let mut output = [0u8; WRAPPING_KEY_LEN];
        pbkdf2_hmac::<Sha512>(password, salt, self.iterations, &mut output);
        let key = WrappingKey(output);
        output.zeroize();
        Ok(key)
    }
}
