//! BIP-39 mnemonic handling
//!
//! Turns the words entered on the device into the 64-byte seed that roots
//! the BIP-32 tree. Seed buffers are wiped on drop.

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::bip32::{HDKey, HdError};

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Root key derivation failed: {0}")]
    RootKey(#[from] HdError),
}

/// Parse a mnemonic from words
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    Mnemonic::parse_in(Language::English, words)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Derive seed bytes from mnemonic (with optional passphrase)
pub fn derive_seed(mnemonic: &Mnemonic, passphrase: &str) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed(passphrase))
}

/// Root extended private key for `words`, encoded with `version`.
pub fn root_key(words: &str, passphrase: &str, version: [u8; 4]) -> Result<HDKey, SeedError> {
    let mnemonic = parse_mnemonic(words)?;
    let seed = derive_seed(&mnemonic, passphrase);
    Ok(HDKey::from_seed(&seed[..], version)?)
}
