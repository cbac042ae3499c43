//! AirSign Core
//!
//! Keys, scripts and BIP-32 derivation for an air-gapped Bitcoin signer.
//!
//! # Layers
//!
//! - [`hashes`] and [`encode`]: digests, compact-size integers, Base58Check
//! - [`ec`]: the secp256k1 adapter (SEC keys, WIF, DER signatures)
//! - [`script`]: scripts, witnesses, scriptPubkey classification, addresses
//! - [`bip32`]: the extended key tree
//! - [`seed`] and [`keys`]: mnemonic to root key to account xpub
//!
//! Nothing here performs I/O.

pub mod bip32;
pub mod ec;
pub mod encode;
pub mod hashes;
pub mod keys;
pub mod networks;
pub mod script;
pub mod seed;

pub use bip32::{parse_path, path_to_string, HDKey, HdError, KeyOrigin, HARDENED};
pub use ec::{EcError, PrivateKey, PublicKey, Signature};
pub use encode::EncodingError;
pub use keys::{AccountKey, KeyError};
pub use networks::{KeyRole, Network};
pub use script::{Script, ScriptError, ScriptType, Witness};
pub use seed::SeedError;

use thiserror::Error;

/// Any failure raised by this crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Hd(#[from] HdError),
    #[error(transparent)]
    Ec(#[from] EcError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Seed(#[from] SeedError),
    #[error(transparent)]
    Key(#[from] KeyError),
}
