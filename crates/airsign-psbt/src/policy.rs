//! Spending policy of a PSBT scope: script kind plus, for multisig, the
//! threshold and the cosigner xpubs the keys derive from.
//!
//! Cosigners are compared as sorted lists of normalized xpub strings, so a
//! policy computed from PSBT metadata and one computed from a wallet
//! descriptor agree regardless of key order or SLIP-132 versions.

use std::collections::BTreeMap;
use std::fmt;

use airsign_core::bip32::{HDKey, HdError, KeyOrigin};
use airsign_core::ec::PublicKey;
use airsign_core::networks::Network;
use airsign_core::script::{Script, ScriptType};
use airsign_descriptor::{OwnershipScope, ScriptKind};
use thiserror::Error;

use crate::finalizer::parse_multisig;
use crate::psbt::{InputScope, OutputScope};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Unsupported script type {0}")]
    UnsupportedScript(&'static str),
    #[error("Script is not a multisig")]
    NotMultisig,
    #[error("Missing derivation for {0}")]
    MissingDerivation(PublicKey),
    #[error("Cannot get all cosigners")]
    MissingCosigners,
    #[error(transparent)]
    Hd(#[from] HdError),
}

/// A PSBT input or output as seen by [`get_policy`].
pub trait PolicyScope: OwnershipScope {
    fn redeem_script(&self) -> Option<&Script>;
    fn witness_script(&self) -> Option<&Script>;
}

impl PolicyScope for InputScope {
    fn redeem_script(&self) -> Option<&Script> {
        self.redeem_script.as_ref()
    }

    fn witness_script(&self) -> Option<&Script> {
        self.witness_script.as_ref()
    }
}

impl PolicyScope for OutputScope {
    fn redeem_script(&self) -> Option<&Script> {
        self.redeem_script.as_ref()
    }

    fn witness_script(&self) -> Option<&Script> {
        self.witness_script.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigPolicy {
    pub m: usize,
    pub n: usize,
    /// Sorted normalized xpubs, see [`cosigner_id`].
    pub cosigners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub kind: ScriptKind,
    pub multisig: Option<MultisigPolicy>,
}

impl Policy {
    pub fn single(kind: ScriptKind) -> Self {
        Self {
            kind,
            multisig: None,
        }
    }

    pub fn is_multisig(&self) -> bool {
        self.multisig.is_some()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.multisig {
            Some(ms) => write!(f, "{} {} of {} multisig", self.kind, ms.m, ms.n),
            None => write!(f, "{} single-sig", self.kind),
        }
    }
}

/// Canonical string for a cosigner key: the public key serialized with the
/// plain xpub/tpub version of its network.
pub fn cosigner_id(key: &HDKey) -> Result<String, HdError> {
    let network = key.network().unwrap_or(Network::Bitcoin);
    Ok(key.to_public_with_version(network.xpub())?.to_base58())
}

/// Map each multisig pubkey back to the xpub it was derived from. Every
/// pubkey's derivation must extend an xpub's origin by exactly two
/// unhardened steps that reproduce the pubkey.
pub fn get_cosigners(
    pubkeys: &[PublicKey],
    derivations: &BTreeMap<PublicKey, KeyOrigin>,
    xpubs: &BTreeMap<HDKey, KeyOrigin>,
) -> Result<Vec<String>, PolicyError> {
    let mut cosigners = Vec::with_capacity(pubkeys.len());
    for pubkey in pubkeys {
        let der = derivations
            .get(pubkey)
            .ok_or(PolicyError::MissingDerivation(*pubkey))?;
        if der.path.len() < 2 {
            continue;
        }
        let (account_path, tail) = der.path.split_at(der.path.len() - 2);
        let found = xpubs.iter().find(|(xpub, origin)| {
            origin.fingerprint == der.fingerprint
                && origin.path == account_path
                && xpub
                    .derive(tail)
                    .is_ok_and(|child| child.public_key() == *pubkey)
        });
        if let Some((xpub, _)) = found {
            cosigners.push(cosigner_id(xpub)?);
        }
    }
    if cosigners.len() != pubkeys.len() {
        return Err(PolicyError::MissingCosigners);
    }
    cosigners.sort();
    Ok(cosigners)
}

/// Policy of a scope paying to `script_pubkey`.
///
/// p2sh is refined by the scope's scripts: a witness script makes it
/// p2sh-p2wsh, a p2wpkh redeem script p2sh-p2wpkh. Multisig details are
/// filled from the witness script (p2wsh kinds) or from a CHECKMULTISIG
/// redeem script (legacy p2sh).
pub fn get_policy(
    scope: &impl PolicyScope,
    script_pubkey: &Script,
    xpubs: &BTreeMap<HDKey, KeyOrigin>,
) -> Result<Policy, PolicyError> {
    let kind = match script_pubkey.script_type() {
        ScriptType::P2pkh => ScriptKind::P2pkh,
        ScriptType::P2wpkh => ScriptKind::P2wpkh,
        ScriptType::P2wsh => ScriptKind::P2wsh,
        ScriptType::P2sh => {
            if scope.witness_script().is_some() {
                ScriptKind::P2shP2wsh
            } else if scope
                .redeem_script()
                .is_some_and(|r| r.script_type() == ScriptType::P2wpkh)
            {
                ScriptKind::P2shP2wpkh
            } else {
                ScriptKind::P2sh
            }
        }
        other => return Err(PolicyError::UnsupportedScript(other.as_str())),
    };

    let multisig_script = match kind {
        ScriptKind::P2wsh | ScriptKind::P2shP2wsh => scope.witness_script(),
        ScriptKind::P2sh => scope
            .redeem_script()
            .filter(|r| r.script_type() == ScriptType::Multisig),
        _ => None,
    };
    let Some(script) = multisig_script else {
        return Ok(Policy::single(kind));
    };

    let (m, pubkeys) = parse_multisig(script).ok_or(PolicyError::NotMultisig)?;
    let cosigners = get_cosigners(&pubkeys, scope.bip32_derivations(), xpubs)?;
    Ok(Policy {
        kind,
        multisig: Some(MultisigPolicy {
            m,
            n: cosigners.len(),
            cosigners,
        }),
    })
}
