//! Output descriptors and miniscript for the airsign signer.
//!
//! - [`checksum`]: BIP-380 descriptor checksums
//! - [`key`]: key expressions with origins and derivation templates
//! - [`miniscript`]: typed miniscript trees and their compiler
//! - [`descriptor`]: top-level descriptors, addresses and `owns()`

mod cursor;

pub mod checksum;
pub mod descriptor;
pub mod key;
pub mod miniscript;

pub use descriptor::{Descriptor, DescriptorError, OwnershipScope, ScriptKind};
pub use key::{AllowedDerivation, ArgumentError, DescriptorKey, KeyKind};
pub use miniscript::{Miniscript, MiniscriptError};

use thiserror::Error;

/// Any failure raised while handling descriptors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Miniscript(#[from] MiniscriptError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}
