//! Validates a PSBT against the loaded wallet, summarizes it for the user
//! and signs it with the wallet's root key.

use std::collections::BTreeMap;

use airsign_core::bip32::{HDKey, KeyOrigin};
use airsign_core::encode::{base58_decode, base58_encode};
use airsign_core::script::{self, Script};
use airsign_descriptor::ScriptKind;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;

use crate::finalizer;
use crate::policy::{get_policy, Policy, PolicyError};
use crate::psbt::{OutputScope, Psbt, PsbtError, SignOptions, SigningKey};
use crate::transaction::Transaction;
use crate::wallet::Wallet;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("invalid PSBT")]
    InvalidPsbt,
    #[error("PSBT has no inputs")]
    NoInputs,
    #[error("Unable to get policy of input {index}: {source}")]
    Policy {
        index: usize,
        #[source]
        source: PolicyError,
    },
    #[error("mixed inputs in the tx")]
    MixedInputs,
    #[error("multisig tx")]
    MultisigTx,
    #[error("not multisig tx")]
    NotMultisigTx,
    #[error("policy mismatch")]
    PolicyMismatch,
    #[error("missing xpubs")]
    MissingXpubs,
    #[error("cannot sign")]
    CannotSign,
    #[error(transparent)]
    Psbt(#[from] PsbtError),
}

/// How the PSBT arrived, and how it is sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEncoding {
    Binary,
    Base64,
    Base58,
    Hex,
}

impl TransportEncoding {
    pub fn encode(self, raw: &[u8]) -> Vec<u8> {
        match self {
            TransportEncoding::Binary => raw.to_vec(),
            TransportEncoding::Base64 => BASE64.encode(raw).into_bytes(),
            TransportEncoding::Base58 => base58_encode(raw).into_bytes(),
            TransportEncoding::Hex => hex::encode(raw).into_bytes(),
        }
    }
}

/// Decode a PSBT in whichever transport encoding it uses.
pub fn decode_psbt(data: &[u8]) -> Result<(Psbt, TransportEncoding), SignerError> {
    if let Ok(psbt) = Psbt::parse(data) {
        return Ok((psbt, TransportEncoding::Binary));
    }
    let text = std::str::from_utf8(data)
        .map_err(|_| SignerError::InvalidPsbt)?
        .trim();
    if let Ok(psbt) = Psbt::from_base64(text) {
        return Ok((psbt, TransportEncoding::Base64));
    }
    if let Some(psbt) = base58_decode(text).ok().and_then(|raw| Psbt::parse(&raw).ok()) {
        return Ok((psbt, TransportEncoding::Base58));
    }
    if let Ok(psbt) = Psbt::from_hex(text) {
        return Ok((psbt, TransportEncoding::Hex));
    }
    Err(SignerError::InvalidPsbt)
}

/// A non-change output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spend {
    /// Address, or the hex script for outputs without one.
    pub address: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendSummary {
    pub spends: Vec<Spend>,
    pub change: u64,
    pub fee: u64,
}

pub struct PsbtSigner<'w> {
    wallet: &'w Wallet,
    psbt: Psbt,
    encoding: TransportEncoding,
    policy: Policy,
    signed: bool,
}

impl<'w> PsbtSigner<'w> {
    /// Decode and validate. Every input must share one policy, matching
    /// the wallet's kind (multisig or not) and, once wallet data is
    /// loaded, the wallet's policy.
    pub fn new(wallet: &'w Wallet, data: &[u8]) -> Result<Self, SignerError> {
        let (psbt, encoding) = decode_psbt(data)?;
        let xpubs = Self::collect_xpubs(wallet, &psbt)?;

        let mut policy: Option<Policy> = None;
        for (index, input) in psbt.inputs.iter().enumerate() {
            let spk = psbt.utxo(index)?.script_pubkey;
            let input_policy = get_policy(input, &spk, &xpubs)
                .map_err(|source| SignerError::Policy { index, source })?;
            match &policy {
                None => policy = Some(input_policy),
                Some(p) if *p != input_policy => return Err(SignerError::MixedInputs),
                Some(_) => {}
            }
        }
        let policy = policy.ok_or(SignerError::NoInputs)?;

        if policy.is_multisig() && !wallet.is_multisig() {
            return Err(SignerError::MultisigTx);
        }
        if !policy.is_multisig() && wallet.is_multisig() {
            return Err(SignerError::NotMultisigTx);
        }
        if wallet.is_loaded() && wallet.policy() != Some(&policy) {
            log::warn!("PSBT policy {} does not match the wallet", policy);
            return Err(SignerError::PolicyMismatch);
        }

        log::info!(
            "PSBT with {} inputs and {} outputs, policy {}",
            psbt.inputs.len(),
            psbt.outputs.len(),
            policy
        );
        Ok(Self {
            wallet,
            psbt,
            encoding,
            policy,
            signed: false,
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn encoding(&self) -> TransportEncoding {
        self.encoding
    }

    /// Send the PSBT back in another encoding than it arrived in.
    pub fn set_encoding(&mut self, encoding: TransportEncoding) {
        self.encoding = encoding;
    }

    /// The PSBT's global xpubs, or the wallet descriptor's keys when the
    /// PSBT carries none.
    pub fn xpubs(&self) -> Result<BTreeMap<HDKey, KeyOrigin>, SignerError> {
        Self::collect_xpubs(self.wallet, &self.psbt)
    }

    fn collect_xpubs(
        wallet: &Wallet,
        psbt: &Psbt,
    ) -> Result<BTreeMap<HDKey, KeyOrigin>, SignerError> {
        if !psbt.xpubs.is_empty() {
            return Ok(psbt.xpubs.clone());
        }
        let descriptor = wallet.descriptor().ok_or(SignerError::MissingXpubs)?;
        Ok(descriptor
            .keys()
            .iter()
            .filter_map(|key| {
                let hd = key.hd_key()?;
                let origin = key
                    .origin()
                    .cloned()
                    .unwrap_or_else(|| KeyOrigin::new(hd.fingerprint(), Vec::new()));
                Some((hd.clone(), origin))
            })
            .collect())
    }

    /// Split outputs into spends and change and compute the fee.
    pub fn outputs(&self) -> Result<SpendSummary, SignerError> {
        let xpubs = self.xpubs()?;
        let mut total_in = 0u64;
        for i in 0..self.psbt.inputs.len() {
            total_in = total_in.saturating_add(self.psbt.utxo(i)?.value);
        }

        let mut spends = Vec::new();
        let mut spending = 0u64;
        let mut change = 0u64;
        for output in &self.psbt.outputs {
            if self.is_change(output, &xpubs) {
                change = change.saturating_add(output.value);
                continue;
            }
            spending = spending.saturating_add(output.value);
            let address = output
                .script_pubkey
                .address(self.wallet.network())
                .unwrap_or_else(|_| output.script_pubkey.to_string());
            spends.push(Spend {
                address,
                value: output.value,
            });
        }

        let fee = total_in
            .checked_sub(change)
            .and_then(|rest| rest.checked_sub(spending))
            .ok_or(PsbtError::NegativeFee)?;
        Ok(SpendSummary {
            spends,
            change,
            fee,
        })
    }

    /// An output is change when it has the transaction's policy and its
    /// script is reproduced from its own metadata: through the wallet
    /// descriptor when there is one, otherwise from the witness script or
    /// the first derivation under the root key.
    fn is_change(&self, output: &OutputScope, xpubs: &BTreeMap<HDKey, KeyOrigin>) -> bool {
        match get_policy(output, &output.script_pubkey, xpubs) {
            Ok(policy) if policy == self.policy => {}
            Ok(_) => return false,
            Err(e) => {
                log::debug!("No policy for output {}: {}", output.script_pubkey, e);
                return false;
            }
        }
        if let Some(descriptor) = self.wallet.descriptor() {
            return descriptor.owns(output);
        }

        let expected = match self.policy.kind {
            ScriptKind::P2wsh => output.witness_script.as_ref().map(script::p2wsh),
            ScriptKind::P2shP2wsh => output
                .witness_script
                .as_ref()
                .map(|ws| script::p2sh(&script::p2wsh(ws))),
            ScriptKind::P2wpkh | ScriptKind::P2shP2wpkh | ScriptKind::P2pkh => {
                self.own_key_script(output)
            }
            ScriptKind::P2sh => output.redeem_script.as_ref().map(script::p2sh),
        };
        expected.as_ref() == Some(&output.script_pubkey)
    }

    fn own_key_script(&self, output: &OutputScope) -> Option<Script> {
        let origin = output.bip32_derivations.values().next()?;
        let pubkey = self.wallet.key().root().derive(&origin.path).ok()?.public_key();
        Some(match self.policy.kind {
            ScriptKind::P2wpkh => script::p2wpkh(&pubkey),
            ScriptKind::P2shP2wpkh => script::p2sh(&script::p2wpkh(&pubkey)),
            _ => script::p2pkh(&pubkey),
        })
    }

    /// Sign with the root key under SIGHASH_ALL. Inputs declaring another
    /// sighash are left unsigned. At least one signature must be added.
    pub fn sign(&mut self) -> Result<usize, SignerError> {
        self.sign_with_options(SignOptions::default())
    }

    pub fn sign_with_options(&mut self, options: SignOptions) -> Result<usize, SignerError> {
        let root = self.wallet.key().root();
        let added = self.psbt.sign_with(SigningKey::Hd(root), options)?;
        if added == 0 {
            return Err(SignerError::CannotSign);
        }
        self.signed = true;
        Ok(added)
    }

    /// The PSBT in its transport encoding. After signing only the
    /// transaction and the partial signatures are returned.
    pub fn psbt_bytes(&self) -> Vec<u8> {
        let raw = if self.signed {
            self.psbt.trimmed().serialize()
        } else {
            self.psbt.serialize()
        };
        self.encoding.encode(&raw)
    }

    /// Finalize and extract the network transaction.
    pub fn finalize(&self, allow_partial: bool) -> Result<Transaction, SignerError> {
        Ok(finalizer::finalize(&self.psbt, allow_partial)?)
    }
}
