//! Envelope encryption and key custody for credentials kept in a remote row
//! store. Secrets are encrypted under a P-521 public key; the private key is
//! stored only wrapped under a key derived from the master password.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod custodian;
pub mod encoding;
pub mod generator;
pub mod store;
pub mod vault;
