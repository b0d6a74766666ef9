//! P-521 key pairs. The private half leaves memory only as PKCS#8 DER inside
//! a symmetric envelope; the public half encrypts new secret fields.

use std::fmt;

use p521::elliptic_curve::sec1::ToEncodedPoint;
use p521::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("private key encoding failed: {0}")]
    EncodeFailed(String),
    #[error("private key decoding failed: {0}")]
    DecodeFailed(String),
}

pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_pkcs8_der(der)
            .map_err(|e| KeyError::DecodeFailed(format!("{e}")))?;
        Ok(Self::from_secret(secret))
    }

    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let document = self
            .secret
            .to_pkcs8_der()
            .map_err(|e| KeyError::EncodeFailed(format!("{e}")))?;
        Ok(Zeroizing::new(document.as_bytes().to_vec()))
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// SEC1 uncompressed encoding of the public key.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(false).as_bytes().to_vec()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}
