//! Cryptography for the credential vault: wrapping-key derivation, the
//! symmetric envelope around the private key, and the hybrid envelope around
//! each secret field. Each submodule owns one primitive so the layering stays
//! auditable.

pub mod asymmetric;
pub mod integrity;
pub mod kdf;
pub mod keypair;
pub mod symmetric;
