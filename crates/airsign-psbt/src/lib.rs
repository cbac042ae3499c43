//! AirSign PSBT
//!
//! Transactions, PSBTs and the checks an offline signer runs before it
//! signs anything.
//!
//! # Flow
//!
//! 1. [`wallet::Wallet`] holds the account key and, once loaded, the
//!    wallet descriptor and its [`policy::Policy`].
//! 2. [`signer::PsbtSigner`] decodes a PSBT, requires every input to share
//!    one policy matching the wallet, and summarizes spends, change and fee.
//! 3. [`psbt::Psbt::sign_with`] adds signatures; [`finalizer`] turns them
//!    into scriptSigs and witnesses.

pub mod finalizer;
pub mod policy;
pub mod psbt;
pub mod signer;
pub mod transaction;
pub mod wallet;

pub use policy::{MultisigPolicy, Policy, PolicyError};
pub use psbt::{InputScope, OutputScope, Psbt, PsbtError, PsbtVersion, SignOptions, SigningKey};
pub use signer::{PsbtSigner, SignerError, SpendSummary, TransportEncoding};
pub use transaction::{SighashType, Transaction, TransactionError, TxIn, TxOut};
pub use wallet::{Wallet, WalletError};

use thiserror::Error;

/// Any failure raised by this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Psbt(#[from] PsbtError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Signer(#[from] SignerError),
}
