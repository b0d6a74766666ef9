//! Hybrid public-key envelope for individual secret fields.
//!
//! Every call to [`encrypt`] draws a fresh ephemeral P-521 key, so two
//! envelopes of the same plaintext share no key material and no symmetric
//! key is ever used twice. Blob layout:
//!
//! ```text
//! [len: u8][ephemeral public key, SEC1 uncompressed]
//! [iv: 16][aes-256-cbc ciphertext][hmac-sha512: 64]
//! ```
//!
//! The MAC covers `iv || ciphertext` and is verified before any block is
//! decrypted.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p521::ecdh::{self, EphemeralSecret, SharedSecret};
use p521::elliptic_curve::sec1::ToEncodedPoint;
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::integrity::{hmac_sha512, sha512_digest, verify_hmac_sha512, SHA512_SIZE};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size; also the IV length.
pub const BLOCK_SIZE: usize = 16;
/// Plaintexts are padded to a multiple of this many bytes.
pub const PAD_MULTIPLE: usize = 32;
const SUBKEY_LEN: usize = 32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AsymmetricError {
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid MAC")]
    InvalidMac,
    #[error("padding incorrect")]
    PaddingIncorrect,
    #[error("key agreement failed")]
    KeyAgreementFailed,
}

struct EnvelopeKeys {
    cipher_key: Zeroizing<[u8; SUBKEY_LEN]>,
    mac_key: Zeroizing<[u8; SUBKEY_LEN]>,
}

/// Splits SHA-512 of the shared x-coordinate into cipher and MAC keys. The
/// coordinate is hashed in its minimal big-endian form (leading zero bytes
/// dropped) so envelopes written by earlier deployments still open.
fn envelope_keys(shared: &SharedSecret) -> Result<EnvelopeKeys, AsymmetricError> {
    let x = shared.raw_secret_bytes();
    let start = x
        .iter()
        .position(|byte| *byte != 0)
        .ok_or(AsymmetricError::KeyAgreementFailed)?;

    let digest = Zeroizing::new(sha512_digest(&x[start..]));
    let mut cipher_key = Zeroizing::new([0u8; SUBKEY_LEN]);
    let mut mac_key = Zeroizing::new([0u8; SUBKEY_LEN]);
    cipher_key.copy_from_slice(&digest[..SUBKEY_LEN]);
    mac_key.copy_from_slice(&digest[SUBKEY_LEN..]);
    Ok(EnvelopeKeys { cipher_key, mac_key })
}

/// Pads to the next multiple of [`PAD_MULTIPLE`]; every pad byte holds the
/// pad length, which is always in `1..=32`.
fn add_padding(plaintext: &[u8]) -> Zeroizing<Vec<u8>> {
    let pad = PAD_MULTIPLE - plaintext.len() % PAD_MULTIPLE;
    let mut padded = Zeroizing::new(Vec::with_capacity(plaintext.len() + pad));
    padded.extend_from_slice(plaintext);
    padded.resize(plaintext.len() + pad, pad as u8);
    padded
}

fn remove_padding(padded: &[u8]) -> Result<Zeroizing<Vec<u8>>, AsymmetricError> {
    let &last = padded.last().ok_or(AsymmetricError::PaddingIncorrect)?;
    let pad = usize::from(last);
    if pad == 0 || pad > PAD_MULTIPLE || pad > padded.len() {
        return Err(AsymmetricError::PaddingIncorrect);
    }
    Ok(Zeroizing::new(padded[..padded.len() - pad].to_vec()))
}

/// Encrypts `plaintext` to `public_key`.
pub fn encrypt(public_key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
    seal_padded(public_key, &add_padding(plaintext))
}

fn seal_padded(public_key: &PublicKey, padded: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(public_key);
    let keys = envelope_keys(&shared)?;

    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(keys.cipher_key.as_slice().into(), iv.as_slice().into())
        .encrypt_padded_vec_mut::<NoPadding>(padded);

    let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
    let ephemeral_bytes = ephemeral_point.as_bytes();
    let declared_len =
        u8::try_from(ephemeral_bytes.len()).map_err(|_| AsymmetricError::KeyAgreementFailed)?;

    // A MAC key the HMAC rejects counts as a failed agreement.
    let tag = hmac_sha512(keys.mac_key.as_slice(), &[&iv, &ciphertext])
        .map_err(|_| AsymmetricError::KeyAgreementFailed)?;

    let mut blob = Vec::with_capacity(
        1 + ephemeral_bytes.len() + BLOCK_SIZE + ciphertext.len() + SHA512_SIZE,
    );
    blob.push(declared_len);
    blob.extend_from_slice(ephemeral_bytes);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    blob.extend_from_slice(&tag);
    Ok(blob)
}

/// Decrypts a blob produced by [`encrypt`]. Nothing is decrypted unless the
/// MAC verifies, and no partial plaintext is ever returned.
pub fn decrypt(
    private_key: &SecretKey,
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, AsymmetricError> {
    let (&declared_len, rest) = blob
        .split_first()
        .ok_or(AsymmetricError::InvalidCiphertext)?;
    let declared_len = usize::from(declared_len);
    if rest.len() < declared_len {
        return Err(AsymmetricError::InvalidCiphertext);
    }
    let (ephemeral_bytes, body) = rest.split_at(declared_len);
    if body.len() < SHA512_SIZE + BLOCK_SIZE {
        return Err(AsymmetricError::InvalidCiphertext);
    }

    let ephemeral_public =
        PublicKey::from_sec1_bytes(ephemeral_bytes).map_err(|_| AsymmetricError::InvalidPublicKey)?;
    let shared =
        ecdh::diffie_hellman(private_key.to_nonzero_scalar(), ephemeral_public.as_affine());
    let keys = envelope_keys(&shared)?;

    let (authenticated, tag) = body.split_at(body.len() - SHA512_SIZE);
    verify_hmac_sha512(keys.mac_key.as_slice(), &[authenticated], tag)
        .map_err(|_| AsymmetricError::InvalidMac)?;

    let (iv, ciphertext) = authenticated.split_at(BLOCK_SIZE);
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(AsymmetricError::PaddingIncorrect);
    }
    let padded = Zeroizing::new(
        Aes256CbcDec::new(keys.cipher_key.as_slice().into(), iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| AsymmetricError::PaddingIncorrect)?,
    );
    remove_padding(&padded)
}

#[cfg(test)]
mod tests {
    use super::{
        add_padding, decrypt, encrypt, remove_padding, seal_padded, AsymmetricError, BLOCK_SIZE,
        PAD_MULTIPLE,
    };
    use crate::crypto::integrity::SHA512_SIZE;
    use crate::crypto::keypair::KeyPair;

    const EPHEMERAL_LEN: usize = 133;

    #[test]
    fn round_trips_across_lengths() {
        let pair = KeyPair::generate();
        for len in [0usize, 1, 15, 16, 31, 32, 33, 63, 64, 65, 320, 1000, 4097, 10_000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let blob = encrypt(pair.public_key(), &plaintext).expect("encryption should succeed");
            let opened = decrypt(pair.secret_key(), &blob).expect("decryption should succeed");
            assert_eq!(opened.as_slice(), plaintext.as_slice(), "length {len}");
        }
    }

    #[test]
    fn padding_edge_lengths_round_trip() {
        let pair = KeyPair::generate();
        for len in [0usize, 31, 32, 33, 320] {
            let plaintext = vec![b'x'; len];
            let blob = encrypt(pair.public_key(), &plaintext).unwrap();
            let padded_len = len + (PAD_MULTIPLE - len % PAD_MULTIPLE);
            assert_eq!(blob.len(), 1 + EPHEMERAL_LEN + BLOCK_SIZE + padded_len + SHA512_SIZE);
            assert_eq!(decrypt(pair.secret_key(), &blob).unwrap().as_slice(), plaintext.as_slice());
        }
    }

    #[test]
    fn padding_is_self_describing() {
        let padded = add_padding(b"abc");
        assert_eq!(padded.len(), 32);
        assert!(padded[3..].iter().all(|b| *b == 29));

        let full = add_padding(&[1u8; 32]);
        assert_eq!(full.len(), 64);
        assert!(full[32..].iter().all(|b| *b == 32));

        assert_eq!(remove_padding(&padded).unwrap().as_slice(), b"abc");
    }

    #[test]
    fn rejects_out_of_range_padding() {
        let mut block = vec![0u8; 32];
        block[31] = 33;
        assert_eq!(remove_padding(&block).unwrap_err(), AsymmetricError::PaddingIncorrect);
        block[31] = 0;
        assert_eq!(remove_padding(&block).unwrap_err(), AsymmetricError::PaddingIncorrect);
        assert_eq!(remove_padding(&[]).unwrap_err(), AsymmetricError::PaddingIncorrect);
    }

    #[test]
    fn authenticated_payload_with_bad_padding_is_rejected() {
        let pair = KeyPair::generate();
        for trailing in [33u8, 64, 255] {
            let mut padded = vec![7u8; 32];
            padded[31] = trailing;
            let blob = seal_padded(pair.public_key(), &padded).unwrap();
            assert_eq!(
                decrypt(pair.secret_key(), &blob).unwrap_err(),
                AsymmetricError::PaddingIncorrect
            );
        }
    }

    #[test]
    fn same_plaintext_is_unlinkable() {
        let pair = KeyPair::generate();
        let a = encrypt(pair.public_key(), b"hunter2").unwrap();
        let b = encrypt(pair.public_key(), b"hunter2").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[1..1 + EPHEMERAL_LEN], b[1..1 + EPHEMERAL_LEN]);
    }

    #[test]
    fn flipped_mac_bits_fail_verification() {
        let pair = KeyPair::generate();
        let blob = encrypt(pair.public_key(), b"s3cret").unwrap();
        let mac_start = blob.len() - SHA512_SIZE;
        for offset in 0..SHA512_SIZE {
            let mut tampered = blob.clone();
            tampered[mac_start + offset] ^= 1 << (offset % 8);
            assert_eq!(
                decrypt(pair.secret_key(), &tampered).unwrap_err(),
                AsymmetricError::InvalidMac,
                "mac byte {offset}"
            );
        }
    }

    #[test]
    fn flipped_body_bits_fail_verification() {
        let pair = KeyPair::generate();
        let blob = encrypt(pair.public_key(), b"a slightly longer secret value").unwrap();
        let body_start = 1 + EPHEMERAL_LEN;
        let mac_start = blob.len() - SHA512_SIZE;
        for (step, index) in (body_start..mac_start).enumerate() {
            let mut tampered = blob.clone();
            tampered[index] ^= 1 << (step % 8);
            assert_eq!(
                decrypt(pair.secret_key(), &tampered).unwrap_err(),
                AsymmetricError::InvalidMac,
                "byte {index}"
            );
        }
    }

    #[test]
    fn flipped_header_bits_never_decrypt() {
        let pair = KeyPair::generate();
        let blob = encrypt(pair.public_key(), b"s3cret").unwrap();
        for index in (0..=EPHEMERAL_LEN).step_by(7) {
            let mut tampered = blob.clone();
            tampered[index] ^= 0x10;
            assert!(decrypt(pair.secret_key(), &tampered).is_err(), "byte {index}");
        }
    }

    #[test]
    fn wrong_private_key_fails_mac() {
        let owner = KeyPair::generate();
        let stranger = KeyPair::generate();
        let blob = encrypt(owner.public_key(), b"s3cret").unwrap();
        assert_eq!(
            decrypt(stranger.secret_key(), &blob).unwrap_err(),
            AsymmetricError::InvalidMac
        );
    }

    #[test]
    fn rejects_malformed_blobs() {
        let pair = KeyPair::generate();
        assert_eq!(
            decrypt(pair.secret_key(), &[]).unwrap_err(),
            AsymmetricError::InvalidCiphertext
        );
        assert_eq!(
            decrypt(pair.secret_key(), &[200, 1, 2, 3]).unwrap_err(),
            AsymmetricError::InvalidCiphertext
        );

        let blob = encrypt(pair.public_key(), b"x").unwrap();
        let short = &blob[..1 + EPHEMERAL_LEN + SHA512_SIZE + BLOCK_SIZE - 1];
        assert_eq!(
            decrypt(pair.secret_key(), short).unwrap_err(),
            AsymmetricError::InvalidCiphertext
        );
    }

    #[test]
    fn rejects_identity_and_off_curve_points() {
        let pair = KeyPair::generate();
        let filler = vec![0u8; SHA512_SIZE + BLOCK_SIZE * 2];

        let mut identity = vec![1u8, 0x00];
        identity.extend_from_slice(&filler);
        assert_eq!(
            decrypt(pair.secret_key(), &identity).unwrap_err(),
            AsymmetricError::InvalidPublicKey
        );

        let mut off_curve = vec![EPHEMERAL_LEN as u8, 0x04];
        off_curve.extend_from_slice(&[0x11u8; EPHEMERAL_LEN - 1]);
        off_curve.extend_from_slice(&filler);
        assert_eq!(
            decrypt(pair.secret_key(), &off_curve).unwrap_err(),
            AsymmetricError::InvalidPublicKey
        );
    }
}
