//! Partially Signed Bitcoin Transactions (BIP-174 v0 and BIP-370 v2).
//!
//! Each section is a list of key/value records closed by an empty key.
//! Records this module does not interpret are kept in `unknown` maps and
//! written back unchanged.

use std::collections::{BTreeMap, HashSet};

use airsign_core::bip32::{HDKey, HdError, KeyOrigin, EXTENDED_KEY_LEN};
use airsign_core::ec::{EcError, PrivateKey, PublicKey};
use airsign_core::encode::{write_compact_size, write_var_bytes, EncodingError, Reader};
use airsign_core::hashes::hash160;
use airsign_core::script::{self, Script, ScriptType, Witness};
use airsign_descriptor::OwnershipScope;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;

use crate::transaction::{
    SighashCache, SighashType, Transaction, TransactionError, TxIn, TxOut,
};

/// `psbt` followed by 0xff.
pub const MAGIC: [u8; 5] = [0x70, 0x73, 0x62, 0x74, 0xff];

const DEFAULT_SEQUENCE: u32 = 0xffff_ffff;

// global
const PSBT_GLOBAL_UNSIGNED_TX: u8 = 0x00;
const PSBT_GLOBAL_XPUB: u8 = 0x01;
const PSBT_GLOBAL_TX_VERSION: u8 = 0x02;
const PSBT_GLOBAL_FALLBACK_LOCKTIME: u8 = 0x03;
const PSBT_GLOBAL_INPUT_COUNT: u8 = 0x04;
const PSBT_GLOBAL_OUTPUT_COUNT: u8 = 0x05;
const PSBT_GLOBAL_VERSION: u8 = 0xfb;

// input
const PSBT_IN_NON_WITNESS_UTXO: u8 = 0x00;
const PSBT_IN_WITNESS_UTXO: u8 = 0x01;
const PSBT_IN_PARTIAL_SIG: u8 = 0x02;
const PSBT_IN_SIGHASH_TYPE: u8 = 0x03;
const PSBT_IN_REDEEM_SCRIPT: u8 = 0x04;
const PSBT_IN_WITNESS_SCRIPT: u8 = 0x05;
const PSBT_IN_BIP32_DERIVATION: u8 = 0x06;
const PSBT_IN_FINAL_SCRIPTSIG: u8 = 0x07;
const PSBT_IN_FINAL_SCRIPTWITNESS: u8 = 0x08;
const PSBT_IN_PREVIOUS_TXID: u8 = 0x0e;
const PSBT_IN_OUTPUT_INDEX: u8 = 0x0f;
const PSBT_IN_SEQUENCE: u8 = 0x10;

// output
const PSBT_OUT_REDEEM_SCRIPT: u8 = 0x00;
const PSBT_OUT_WITNESS_SCRIPT: u8 = 0x01;
const PSBT_OUT_BIP32_DERIVATION: u8 = 0x02;
const PSBT_OUT_AMOUNT: u8 = 0x03;
const PSBT_OUT_SCRIPT: u8 = 0x04;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PsbtError {
    #[error("Invalid PSBT magic")]
    InvalidMagic,
    #[error("Duplicate key {0}")]
    DuplicateKey(String),
    #[error("Invalid key {0}")]
    InvalidKey(String),
    #[error("Invalid value for key {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("Unsupported PSBT version {0}")]
    UnsupportedVersion(u32),
    #[error("PSBT v2 must not carry a global unsigned transaction")]
    TxInV2,
    #[error("Missing global unsigned transaction")]
    MissingTx,
    #[error("Global transaction must not have scriptSigs or witnesses")]
    TxNotUnsigned,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("{0} trailing bytes after PSBT")]
    TrailingData(usize),
    #[error("Input {0} has no UTXO information")]
    MissingUtxo(usize),
    #[error("Non-witness UTXO of input {0} does not match its outpoint")]
    TxidMismatch(usize),
    #[error("Derivation path doesn't look right for input {0}")]
    DerivationMismatch(usize),
    #[error("Outputs spend more than the inputs")]
    NegativeFee,
    #[error("Input {input} has {have} of {need} required signatures")]
    MissingSignatures {
        input: usize,
        have: usize,
        need: usize,
    },
    #[error("Don't know how to finalize input {0}")]
    UnsupportedScript(usize),
    #[error("Invalid base64: {0}")]
    Base64(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Hd(#[from] HdError),
    #[error(transparent)]
    Ec(#[from] EcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PsbtVersion {
    #[default]
    V0,
    V2,
}

impl PsbtVersion {
    pub fn number(self) -> u32 {
        match self {
            PsbtVersion::V0 => 0,
            PsbtVersion::V2 => 2,
        }
    }

    fn from_number(n: u32) -> Result<Self, PsbtError> {
        match n {
            0 => Ok(PsbtVersion::V0),
            2 => Ok(PsbtVersion::V2),
            other => Err(PsbtError::UnsupportedVersion(other)),
        }
    }
}

/// Which key to sign with.
#[derive(Debug, Clone, Copy)]
pub enum SigningKey<'a> {
    /// A root key, matched against each input's derivation records by
    /// fingerprint.
    Hd(&'a HDKey),
    /// A bare key, used wherever its SEC encoding or hash appears in the
    /// script being satisfied.
    Single(&'a PrivateKey),
}

#[derive(Debug, Clone, Copy)]
pub struct SignOptions {
    /// Sighash the caller wants. Inputs declaring another type are skipped
    /// unless `allow_sighash_override` is set. `None` accepts whatever
    /// each input declares.
    pub sighash: Option<SighashType>,
    /// Sign conflicting inputs with the type they declare.
    pub allow_sighash_override: bool,
}

impl Default for SignOptions {
    /// SIGHASH_ALL only: inputs declaring anything else are left unsigned.
    fn default() -> Self {
        Self {
            sighash: Some(SighashType::ALL),
            allow_sighash_override: false,
        }
    }
}

type RawMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputScope {
    /// Previous txid in internal byte order.
    pub prev_txid: [u8; 32],
    pub vout: u32,
    pub sequence: Option<u32>,
    pub non_witness_utxo: Option<Transaction>,
    pub witness_utxo: Option<TxOut>,
    /// DER signature plus the trailing sighash byte, by signing key.
    pub partial_sigs: BTreeMap<PublicKey, Vec<u8>>,
    /// Raw declared sighash; validated when signing.
    pub sighash_type: Option<u32>,
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    pub bip32_derivations: BTreeMap<PublicKey, KeyOrigin>,
    pub final_script_sig: Option<Script>,
    pub final_script_witness: Option<Witness>,
    pub unknown: RawMap,
}

impl InputScope {
    fn new(prev_txid: [u8; 32], vout: u32, sequence: Option<u32>) -> Self {
        Self {
            prev_txid,
            vout,
            sequence,
            ..Default::default()
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.final_script_sig.is_some() || self.final_script_witness.is_some()
    }

    /// The output being spent, from whichever UTXO record is present.
    pub fn utxo(&self) -> Option<TxOut> {
        if let Some(out) = &self.witness_utxo {
            return Some(out.clone());
        }
        self.non_witness_utxo
            .as_ref()?
            .outputs
            .get(self.vout as usize)
            .cloned()
    }

    /// Declared sighash as a typed value.
    pub fn declared_sighash(&self) -> Result<Option<SighashType>, TransactionError> {
        self.sighash_type.map(SighashType::from_u32).transpose()
    }

    fn to_txin(&self) -> TxIn {
        TxIn::new(
            self.prev_txid,
            self.vout,
            self.sequence.unwrap_or(DEFAULT_SEQUENCE),
        )
    }

    fn read(
        reader: &mut Reader<'_>,
        prevout: Option<&TxIn>,
    ) -> Result<Self, PsbtError> {
        let mut scope = match prevout {
            Some(txin) => Self::new(txin.prev_txid, txin.vout, Some(txin.sequence)),
            None => Self::default(),
        };
        let v2 = prevout.is_none();
        let mut prev_txid = None;
        let mut vout = None;

        for (key, value) in read_map(reader)? {
            match key[0] {
                PSBT_IN_NON_WITNESS_UTXO => {
                    bare(&key)?;
                    scope.non_witness_utxo =
                        Some(Transaction::parse(&value).map_err(|e| invalid(&key, e))?);
                }
                PSBT_IN_WITNESS_UTXO => {
                    bare(&key)?;
                    scope.witness_utxo = Some(TxOut::parse(&value).map_err(|e| invalid(&key, e))?);
                }
                PSBT_IN_PARTIAL_SIG => {
                    scope.partial_sigs.insert(keyed_pubkey(&key)?, value);
                }
                PSBT_IN_SIGHASH_TYPE => {
                    bare(&key)?;
                    scope.sighash_type = Some(u32_value(&key, &value)?);
                }
                PSBT_IN_REDEEM_SCRIPT => {
                    bare(&key)?;
                    scope.redeem_script = Some(Script::new(value));
                }
                PSBT_IN_WITNESS_SCRIPT => {
                    bare(&key)?;
                    scope.witness_script = Some(Script::new(value));
                }
                PSBT_IN_BIP32_DERIVATION => {
                    let origin = KeyOrigin::parse(&value).map_err(|e| invalid(&key, e))?;
                    scope.bip32_derivations.insert(keyed_pubkey(&key)?, origin);
                }
                PSBT_IN_FINAL_SCRIPTSIG => {
                    bare(&key)?;
                    scope.final_script_sig = Some(Script::new(value));
                }
                PSBT_IN_FINAL_SCRIPTWITNESS => {
                    bare(&key)?;
                    let mut r = Reader::new(&value);
                    let witness = Witness::read_from(&mut r).map_err(|e| invalid(&key, e))?;
                    scope.final_script_witness = Some(witness);
                }
                PSBT_IN_PREVIOUS_TXID if v2 => {
                    bare(&key)?;
                    prev_txid = Some(
                        <[u8; 32]>::try_from(value.as_slice())
                            .map_err(|_| invalid(&key, "expected 32 bytes"))?,
                    );
                }
                PSBT_IN_OUTPUT_INDEX if v2 => {
                    bare(&key)?;
                    vout = Some(u32_value(&key, &value)?);
                }
                PSBT_IN_SEQUENCE if v2 => {
                    bare(&key)?;
                    scope.sequence = Some(u32_value(&key, &value)?);
                }
                PSBT_IN_PREVIOUS_TXID | PSBT_IN_OUTPUT_INDEX | PSBT_IN_SEQUENCE => {
                    return Err(PsbtError::InvalidKey(format!(
                        "{} is only allowed in PSBT v2",
                        hex::encode(&key)
                    )));
                }
                _ => {
                    scope.unknown.insert(key, value);
                }
            }
        }

        if v2 {
            scope.prev_txid = prev_txid.ok_or(PsbtError::MissingField("input previous txid"))?;
            scope.vout = vout.ok_or(PsbtError::MissingField("input output index"))?;
        }
        Ok(scope)
    }

    fn write(&self, out: &mut Vec<u8>, version: PsbtVersion) {
        if let Some(tx) = &self.non_witness_utxo {
            write_pair(out, &[PSBT_IN_NON_WITNESS_UTXO], &tx.serialize());
        }
        if let Some(utxo) = &self.witness_utxo {
            write_pair(out, &[PSBT_IN_WITNESS_UTXO], &utxo.serialize());
        }
        for (pubkey, sig) in &self.partial_sigs {
            write_pair(out, &keyed(PSBT_IN_PARTIAL_SIG, &pubkey.sec()), sig);
        }
        if let Some(sighash) = self.sighash_type {
            write_pair(out, &[PSBT_IN_SIGHASH_TYPE], &sighash.to_le_bytes());
        }
        if let Some(redeem) = &self.redeem_script {
            write_pair(out, &[PSBT_IN_REDEEM_SCRIPT], redeem.as_bytes());
        }
        if let Some(ws) = &self.witness_script {
            write_pair(out, &[PSBT_IN_WITNESS_SCRIPT], ws.as_bytes());
        }
        for (pubkey, origin) in &self.bip32_derivations {
            write_pair(
                out,
                &keyed(PSBT_IN_BIP32_DERIVATION, &pubkey.sec()),
                &origin.serialize(),
            );
        }
        if let Some(script_sig) = &self.final_script_sig {
            write_pair(out, &[PSBT_IN_FINAL_SCRIPTSIG], script_sig.as_bytes());
        }
        if let Some(witness) = &self.final_script_witness {
            write_pair(out, &[PSBT_IN_FINAL_SCRIPTWITNESS], &witness.serialize());
        }
        if version == PsbtVersion::V2 {
            write_pair(out, &[PSBT_IN_PREVIOUS_TXID], &self.prev_txid);
            write_pair(out, &[PSBT_IN_OUTPUT_INDEX], &self.vout.to_le_bytes());
            if let Some(sequence) = self.sequence {
                write_pair(out, &[PSBT_IN_SEQUENCE], &sequence.to_le_bytes());
            }
        }
        write_unknown(out, &self.unknown);
        out.push(0x00);
    }
}

impl OwnershipScope for InputScope {
    fn script_pubkey(&self) -> Option<Script> {
        self.utxo().map(|out| out.script_pubkey)
    }

    fn bip32_derivations(&self) -> &BTreeMap<PublicKey, KeyOrigin> {
        &self.bip32_derivations
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputScope {
    pub value: u64,
    pub script_pubkey: Script,
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    pub bip32_derivations: BTreeMap<PublicKey, KeyOrigin>,
    pub unknown: RawMap,
}

impl OutputScope {
    fn new(txout: &TxOut) -> Self {
        Self {
            value: txout.value,
            script_pubkey: txout.script_pubkey.clone(),
            ..Default::default()
        }
    }

    fn to_txout(&self) -> TxOut {
        TxOut::new(self.value, self.script_pubkey.clone())
    }

    fn read(reader: &mut Reader<'_>, txout: Option<&TxOut>) -> Result<Self, PsbtError> {
        let mut scope = txout.map(Self::new).unwrap_or_default();
        let v2 = txout.is_none();
        let mut value = None;
        let mut spk = None;

        for (key, val) in read_map(reader)? {
            match key[0] {
                PSBT_OUT_REDEEM_SCRIPT => {
                    bare(&key)?;
                    scope.redeem_script = Some(Script::new(val));
                }
                PSBT_OUT_WITNESS_SCRIPT => {
                    bare(&key)?;
                    scope.witness_script = Some(Script::new(val));
                }
                PSBT_OUT_BIP32_DERIVATION => {
                    let origin = KeyOrigin::parse(&val).map_err(|e| invalid(&key, e))?;
                    scope.bip32_derivations.insert(keyed_pubkey(&key)?, origin);
                }
                PSBT_OUT_AMOUNT if v2 => {
                    bare(&key)?;
                    let bytes = <[u8; 8]>::try_from(val.as_slice())
                        .map_err(|_| invalid(&key, "expected 8 bytes"))?;
                    value = Some(u64::from_le_bytes(bytes));
                }
                PSBT_OUT_SCRIPT if v2 => {
                    bare(&key)?;
                    spk = Some(Script::new(val));
                }
                PSBT_OUT_AMOUNT | PSBT_OUT_SCRIPT => {
                    return Err(PsbtError::InvalidKey(format!(
                        "{} is only allowed in PSBT v2",
                        hex::encode(&key)
                    )));
                }
                _ => {
                    scope.unknown.insert(key, val);
                }
            }
        }

        if v2 {
            scope.value = value.ok_or(PsbtError::MissingField("output amount"))?;
            scope.script_pubkey = spk.ok_or(PsbtError::MissingField("output script"))?;
        }
        Ok(scope)
    }

    fn write(&self, out: &mut Vec<u8>, version: PsbtVersion) {
        if let Some(redeem) = &self.redeem_script {
            write_pair(out, &[PSBT_OUT_REDEEM_SCRIPT], redeem.as_bytes());
        }
        if let Some(ws) = &self.witness_script {
            write_pair(out, &[PSBT_OUT_WITNESS_SCRIPT], ws.as_bytes());
        }
        for (pubkey, origin) in &self.bip32_derivations {
            write_pair(
                out,
                &keyed(PSBT_OUT_BIP32_DERIVATION, &pubkey.sec()),
                &origin.serialize(),
            );
        }
        if version == PsbtVersion::V2 {
            write_pair(out, &[PSBT_OUT_AMOUNT], &self.value.to_le_bytes());
            write_pair(out, &[PSBT_OUT_SCRIPT], self.script_pubkey.as_bytes());
        }
        write_unknown(out, &self.unknown);
        out.push(0x00);
    }
}

impl OwnershipScope for OutputScope {
    fn script_pubkey(&self) -> Option<Script> {
        Some(self.script_pubkey.clone())
    }

    fn bip32_derivations(&self) -> &BTreeMap<PublicKey, KeyOrigin> {
        &self.bip32_derivations
    }
}

/// A parsed PSBT. The unsigned transaction is not stored; it is rebuilt
/// from the scopes by [`Psbt::tx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psbt {
    pub version: PsbtVersion,
    pub tx_version: u32,
    /// Always set for v0; the optional fallback locktime for v2.
    pub locktime: Option<u32>,
    pub xpubs: BTreeMap<HDKey, KeyOrigin>,
    pub inputs: Vec<InputScope>,
    pub outputs: Vec<OutputScope>,
    pub unknown: RawMap,
}

impl Psbt {
    /// A v0 PSBT around an unsigned transaction. scriptSigs and witnesses
    /// are dropped.
    pub fn from_transaction(tx: &Transaction) -> Self {
        Self {
            version: PsbtVersion::V0,
            tx_version: tx.version,
            locktime: Some(tx.locktime),
            xpubs: BTreeMap::new(),
            inputs: tx
                .inputs
                .iter()
                .map(|txin| InputScope::new(txin.prev_txid, txin.vout, Some(txin.sequence)))
                .collect(),
            outputs: tx.outputs.iter().map(OutputScope::new).collect(),
            unknown: RawMap::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, PsbtError> {
        let mut reader = Reader::new(data);
        let magic = reader
            .read_array::<5>()
            .map_err(|_| PsbtError::InvalidMagic)?;
        if magic != MAGIC {
            return Err(PsbtError::InvalidMagic);
        }

        let mut tx = None;
        let mut xpubs = BTreeMap::new();
        let mut version = None;
        let mut tx_version = None;
        let mut locktime = None;
        let mut input_count = None;
        let mut output_count = None;
        let mut unknown = RawMap::new();

        for (key, value) in read_map(&mut reader)? {
            match key[0] {
                PSBT_GLOBAL_UNSIGNED_TX => {
                    bare(&key)?;
                    let parsed = Transaction::parse(&value).map_err(|e| invalid(&key, e))?;
                    if parsed.is_segwit() || parsed.inputs.iter().any(|i| !i.script_sig.is_empty())
                    {
                        return Err(PsbtError::TxNotUnsigned);
                    }
                    tx = Some(parsed);
                }
                PSBT_GLOBAL_XPUB if key.len() == 1 + EXTENDED_KEY_LEN => {
                    let xpub = HDKey::parse(&key[1..]).map_err(|e| invalid(&key, e))?;
                    let origin = KeyOrigin::parse(&value).map_err(|e| invalid(&key, e))?;
                    xpubs.insert(xpub, origin);
                }
                PSBT_GLOBAL_XPUB => return Err(PsbtError::InvalidKey(hex::encode(&key))),
                PSBT_GLOBAL_TX_VERSION => {
                    bare(&key)?;
                    tx_version = Some(u32_value(&key, &value)?);
                }
                PSBT_GLOBAL_FALLBACK_LOCKTIME => {
                    bare(&key)?;
                    locktime = Some(u32_value(&key, &value)?);
                }
                PSBT_GLOBAL_INPUT_COUNT => {
                    bare(&key)?;
                    input_count = Some(compact_value(&key, &value)?);
                }
                PSBT_GLOBAL_OUTPUT_COUNT => {
                    bare(&key)?;
                    output_count = Some(compact_value(&key, &value)?);
                }
                PSBT_GLOBAL_VERSION => {
                    bare(&key)?;
                    version = Some(PsbtVersion::from_number(u32_value(&key, &value)?)?);
                }
                _ => {
                    unknown.insert(key, value);
                }
            }
        }

        let version = version.unwrap_or_default();
        let psbt = match version {
            PsbtVersion::V0 => {
                if tx_version.is_some()
                    || locktime.is_some()
                    || input_count.is_some()
                    || output_count.is_some()
                {
                    return Err(PsbtError::InvalidKey(
                        "PSBT v2 global field in a v0 PSBT".to_string(),
                    ));
                }
                let tx = tx.ok_or(PsbtError::MissingTx)?;
                let mut inputs = Vec::with_capacity(tx.inputs.len());
                for txin in &tx.inputs {
                    inputs.push(InputScope::read(&mut reader, Some(txin))?);
                }
                let mut outputs = Vec::with_capacity(tx.outputs.len());
                for txout in &tx.outputs {
                    outputs.push(OutputScope::read(&mut reader, Some(txout))?);
                }
                Self {
                    version,
                    tx_version: tx.version,
                    locktime: Some(tx.locktime),
                    xpubs,
                    inputs,
                    outputs,
                    unknown,
                }
            }
            PsbtVersion::V2 => {
                if tx.is_some() {
                    return Err(PsbtError::TxInV2);
                }
                let tx_version = tx_version.ok_or(PsbtError::MissingField("tx version"))?;
                let input_count = input_count.ok_or(PsbtError::MissingField("input count"))?;
                let output_count = output_count.ok_or(PsbtError::MissingField("output count"))?;
                let mut inputs = Vec::new();
                for _ in 0..input_count {
                    inputs.push(InputScope::read(&mut reader, None)?);
                }
                let mut outputs = Vec::new();
                for _ in 0..output_count {
                    outputs.push(OutputScope::read(&mut reader, None)?);
                }
                Self {
                    version,
                    tx_version,
                    locktime,
                    xpubs,
                    inputs,
                    outputs,
                    unknown,
                }
            }
        };

        if !reader.is_empty() {
            return Err(PsbtError::TrailingData(reader.remaining()));
        }
        log::debug!(
            "Parsed PSBT v{} with {} inputs and {} outputs",
            version.number(),
            psbt.inputs.len(),
            psbt.outputs.len()
        );
        Ok(psbt)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        if self.version == PsbtVersion::V0 {
            write_pair(&mut out, &[PSBT_GLOBAL_UNSIGNED_TX], &self.tx().serialize());
        }
        for (xpub, origin) in &self.xpubs {
            write_pair(
                &mut out,
                &keyed(PSBT_GLOBAL_XPUB, &xpub.serialize()),
                &origin.serialize(),
            );
        }
        if self.version == PsbtVersion::V2 {
            write_pair(&mut out, &[PSBT_GLOBAL_TX_VERSION], &self.tx_version.to_le_bytes());
            if let Some(locktime) = self.locktime {
                write_pair(&mut out, &[PSBT_GLOBAL_FALLBACK_LOCKTIME], &locktime.to_le_bytes());
            }
            let mut count = Vec::new();
            write_compact_size(&mut count, self.inputs.len() as u64);
            write_pair(&mut out, &[PSBT_GLOBAL_INPUT_COUNT], &count);
            count.clear();
            write_compact_size(&mut count, self.outputs.len() as u64);
            write_pair(&mut out, &[PSBT_GLOBAL_OUTPUT_COUNT], &count);
            write_pair(&mut out, &[PSBT_GLOBAL_VERSION], &2u32.to_le_bytes());
        }
        write_unknown(&mut out, &self.unknown);
        out.push(0x00);

        for input in &self.inputs {
            input.write(&mut out, self.version);
        }
        for output in &self.outputs {
            output.write(&mut out, self.version);
        }
        out
    }

    pub fn from_base64(s: &str) -> Result<Self, PsbtError> {
        let raw = BASE64
            .decode(s.trim())
            .map_err(|e| PsbtError::Base64(e.to_string()))?;
        Self::parse(&raw)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.serialize())
    }

    pub fn from_hex(s: &str) -> Result<Self, PsbtError> {
        let raw = airsign_core::encode::hex_decode(s.trim())?;
        Self::parse(&raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    /// The unsigned transaction described by this PSBT.
    pub fn tx(&self) -> Transaction {
        Transaction {
            version: self.tx_version,
            inputs: self.inputs.iter().map(InputScope::to_txin).collect(),
            outputs: self.outputs.iter().map(OutputScope::to_txout).collect(),
            locktime: self.locktime.unwrap_or(0),
        }
    }

    /// The output spent by input `index`. A non-witness UTXO must hash to
    /// the input's previous txid.
    pub fn utxo(&self, index: usize) -> Result<TxOut, PsbtError> {
        let input = self.inputs.get(index).ok_or(TransactionError::InputIndex {
            index,
            count: self.inputs.len(),
        })?;
        if let Some(out) = &input.witness_utxo {
            return Ok(out.clone());
        }
        let prev = input
            .non_witness_utxo
            .as_ref()
            .ok_or(PsbtError::MissingUtxo(index))?;
        if prev.txid() != input.prev_txid {
            return Err(PsbtError::TxidMismatch(index));
        }
        prev.outputs
            .get(input.vout as usize)
            .cloned()
            .ok_or(PsbtError::MissingUtxo(index))
    }

    /// Check every non-witness UTXO against its outpoint.
    pub fn verify(&self) -> Result<(), PsbtError> {
        for (i, input) in self.inputs.iter().enumerate() {
            if let Some(prev) = &input.non_witness_utxo {
                if prev.txid() != input.prev_txid {
                    return Err(PsbtError::TxidMismatch(i));
                }
            }
        }
        Ok(())
    }

    /// Sum of spent values minus sum of output values. Every input must
    /// carry its UTXO.
    pub fn fee(&self) -> Result<u64, PsbtError> {
        let mut total_in = 0u64;
        for i in 0..self.inputs.len() {
            total_in = total_in.saturating_add(self.utxo(i)?.value);
        }
        let total_out = self
            .outputs
            .iter()
            .fold(0u64, |acc, out| acc.saturating_add(out.value));
        total_in
            .checked_sub(total_out)
            .ok_or(PsbtError::NegativeFee)
    }

    /// Script code, spent value and segwit flag for input `index`.
    fn signing_context(&self, index: usize) -> Result<(Script, u64, bool), PsbtError> {
        let utxo = self.utxo(index)?;
        let input = &self.inputs[index];
        let is_witness_type =
            |s: &Script| matches!(s.script_type(), ScriptType::P2wpkh | ScriptType::P2wsh);
        let segwit = input.witness_script.is_some()
            || input.witness_utxo.is_some()
            || is_witness_type(&utxo.script_pubkey)
            || input.redeem_script.as_ref().is_some_and(is_witness_type);

        let mut script_code = input
            .witness_script
            .clone()
            .or_else(|| input.redeem_script.clone())
            .unwrap_or_else(|| utxo.script_pubkey.clone());
        if let Some(p2pkh) = script::p2pkh_from_p2wpkh(&script_code) {
            script_code = p2pkh;
        }
        Ok((script_code, utxo.value, segwit))
    }

    /// Digest that input `index` signs under `sighash`.
    pub fn sighash(&self, index: usize, sighash: SighashType) -> Result<[u8; 32], PsbtError> {
        let tx = self.tx();
        let cache = SighashCache::new(&tx);
        self.sighash_with(&cache, index, sighash)
    }

    fn sighash_with(
        &self,
        cache: &SighashCache<'_>,
        index: usize,
        sighash: SighashType,
    ) -> Result<[u8; 32], PsbtError> {
        let (script_code, value, segwit) = self.signing_context(index)?;
        let digest = if segwit {
            cache.segwit(index, &script_code, value, sighash)?
        } else {
            cache
                .transaction()
                .sighash_legacy(index, &script_code, sighash)?
        };
        Ok(digest)
    }

    /// Sign every input this key can sign. Returns the number of
    /// signatures added. Finalized inputs are left alone.
    pub fn sign_with(&mut self, key: SigningKey<'_>, options: SignOptions) -> Result<usize, PsbtError> {
        let tx = self.tx();
        let cache = SighashCache::new(&tx);
        let mut added = 0;

        for i in 0..self.inputs.len() {
            let input = &self.inputs[i];
            if input.is_finalized() {
                log::debug!("Input {} is already finalized", i);
                continue;
            }
            let declared = input.declared_sighash()?;
            let sighash = match (declared, options.sighash) {
                (Some(d), Some(wanted)) if d != wanted => {
                    if !options.allow_sighash_override {
                        log::debug!("Skipping input {}: declares {} but {} requested", i, d, wanted);
                        continue;
                    }
                    d
                }
                (Some(d), _) => d,
                (None, Some(wanted)) => wanted,
                (None, None) => SighashType::ALL,
            };

            let signers = self.matching_keys(i, key)?;
            if signers.is_empty() {
                continue;
            }
            let digest = self.sighash_with(&cache, i, sighash)?;
            let flag = sighash.to_u32() as u8;
            for (pubkey, private) in signers {
                let mut sig = private.sign(&digest).to_der();
                sig.push(flag);
                self.inputs[i].partial_sigs.insert(pubkey, sig);
                added += 1;
            }
        }
        log::info!("Added {} signatures", added);
        Ok(added)
    }

    /// Keys among `key` that can sign input `index`, with their pubkeys.
    fn matching_keys(
        &self,
        index: usize,
        key: SigningKey<'_>,
    ) -> Result<Vec<(PublicKey, PrivateKey)>, PsbtError> {
        let input = &self.inputs[index];
        let mut found = Vec::new();
        match key {
            SigningKey::Hd(root) => {
                let fingerprint = root.fingerprint();
                for (pubkey, origin) in &input.bip32_derivations {
                    if origin.fingerprint != fingerprint {
                        continue;
                    }
                    let child = root.derive(&origin.path)?;
                    if child.public_key() != *pubkey {
                        log::debug!("Derivation {} does not produce {}", origin, pubkey);
                        return Err(PsbtError::DerivationMismatch(index));
                    }
                    let private = child.private_key().ok_or(HdError::NotPrivate)?;
                    found.push((*pubkey, *private));
                }
            }
            SigningKey::Single(private) => {
                let (script_code, _, _) = self.signing_context(index)?;
                let pubkey = private.public_key();
                let code = script_code.as_bytes();
                if contains(code, &pubkey.sec()) || contains(code, &hash160(&pubkey.sec())) {
                    found.push((pubkey, *private));
                }
            }
        }
        Ok(found)
    }

    /// A copy holding only what a coordinator needs back: the transaction
    /// and the partial signatures.
    pub fn trimmed(&self) -> Psbt {
        Psbt {
            version: self.version,
            tx_version: self.tx_version,
            locktime: self.locktime,
            xpubs: BTreeMap::new(),
            inputs: self
                .inputs
                .iter()
                .map(|input| InputScope {
                    partial_sigs: input.partial_sigs.clone(),
                    ..InputScope::new(input.prev_txid, input.vout, input.sequence)
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|out| OutputScope::new(&out.to_txout()))
                .collect(),
            unknown: RawMap::new(),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn invalid(key: &[u8], reason: impl ToString) -> PsbtError {
    PsbtError::InvalidValue {
        key: hex::encode(key),
        reason: reason.to_string(),
    }
}

fn bare(key: &[u8]) -> Result<(), PsbtError> {
    if key.len() != 1 {
        return Err(PsbtError::InvalidKey(hex::encode(key)));
    }
    Ok(())
}

fn keyed(key_type: u8, data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + data.len());
    key.push(key_type);
    key.extend_from_slice(data);
    key
}

fn keyed_pubkey(key: &[u8]) -> Result<PublicKey, PsbtError> {
    PublicKey::parse(&key[1..]).map_err(|_| PsbtError::InvalidKey(hex::encode(key)))
}

fn u32_value(key: &[u8], value: &[u8]) -> Result<u32, PsbtError> {
    let bytes = <[u8; 4]>::try_from(value).map_err(|_| invalid(key, "expected 4 bytes"))?;
    Ok(u32::from_le_bytes(bytes))
}

fn compact_value(key: &[u8], value: &[u8]) -> Result<u64, PsbtError> {
    let mut reader = Reader::new(value);
    let n = reader.read_compact_size().map_err(|e| invalid(key, e))?;
    if !reader.is_empty() {
        return Err(invalid(key, "trailing bytes"));
    }
    Ok(n)
}

/// Read records up to the empty key. Keys are never empty in the result.
fn read_map(reader: &mut Reader<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PsbtError> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    loop {
        let key = reader.read_var_bytes()?;
        if key.is_empty() {
            return Ok(pairs);
        }
        let value = reader.read_var_bytes()?;
        if !seen.insert(key) {
            return Err(PsbtError::DuplicateKey(hex::encode(key)));
        }
        pairs.push((key.to_vec(), value.to_vec()));
    }
}

fn write_pair(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    write_var_bytes(out, key);
    write_var_bytes(out, value);
}

fn write_unknown(out: &mut Vec<u8>, unknown: &RawMap) {
    for (key, value) in unknown {
        write_pair(out, key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airsign_core::ec::Signature;
    use airsign_core::networks::Network;

    fn test_root() -> HDKey {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        HDKey::from_seed(&seed, Network::Bitcoin.xprv()).unwrap()
    }

    fn unsigned_tx(outputs: &[(u64, Script)]) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![
                TxIn::new([0x11; 32], 0, 0xffff_fffd),
                TxIn::new([0x22; 32], 1, 0xffff_fffd),
            ],
            outputs: outputs
                .iter()
                .map(|(v, s)| TxOut::new(*v, s.clone()))
                .collect(),
            locktime: 0,
        }
    }

    /// Two p2wpkh inputs owned by `m/84h/0h/0h/0/{0,1}` of the test root.
    fn p2wpkh_psbt(root: &HDKey) -> Psbt {
        let dest = script::p2wpkh(&root.derive(&[1]).unwrap().public_key());
        let mut psbt = Psbt::from_transaction(&unsigned_tx(&[(90_000, dest)]));
        for i in 0..2u32 {
            let path = vec![84 | 0x8000_0000, 0x8000_0000, 0x8000_0000, 0, i];
            let pubkey = root.derive(&path).unwrap().public_key();
            let input = &mut psbt.inputs[i as usize];
            input.witness_utxo = Some(TxOut::new(50_000, script::p2wpkh(&pubkey)));
            input
                .bip32_derivations
                .insert(pubkey, KeyOrigin::new(root.fingerprint(), path));
        }
        psbt
    }

    #[test]
    fn test_roundtrip_with_unknown_records() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        psbt.unknown.insert(vec![0xfc, 0x01], vec![0xaa]);
        psbt.inputs[0].unknown.insert(vec![0x0a, 0x02], vec![0xbb, 0xcc]);
        psbt.outputs[0].unknown.insert(vec![0x07], vec![]);
        psbt.xpubs.insert(
            root.derive(&[0x8000_0000]).unwrap().to_public().unwrap(),
            KeyOrigin::new(root.fingerprint(), vec![0x8000_0000]),
        );

        let raw = psbt.serialize();
        assert_eq!(&raw[..5], &MAGIC);
        let parsed = Psbt::parse(&raw).unwrap();
        assert_eq!(parsed, psbt);
        assert_eq!(parsed.serialize(), raw);
        assert_eq!(Psbt::from_base64(&psbt.to_base64()).unwrap(), psbt);
        assert_eq!(Psbt::from_hex(&psbt.to_hex()).unwrap(), psbt);
    }

    #[test]
    fn test_v2_roundtrip_and_tx() {
        let root = test_root();
        let v0 = p2wpkh_psbt(&root);
        let mut v2 = v0.clone();
        v2.version = PsbtVersion::V2;

        let raw = v2.serialize();
        let parsed = Psbt::parse(&raw).unwrap();
        assert_eq!(parsed, v2);
        assert_eq!(parsed.tx(), v0.tx());
    }

    #[test]
    fn test_v2_requires_fields() {
        let mut raw = MAGIC.to_vec();
        write_pair(&mut raw, &[PSBT_GLOBAL_VERSION], &2u32.to_le_bytes());
        raw.push(0x00);
        assert_eq!(
            Psbt::parse(&raw),
            Err(PsbtError::MissingField("tx version"))
        );
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(Psbt::parse(b"psbu\xff\x00"), Err(PsbtError::InvalidMagic));
        assert_eq!(Psbt::parse(b"ps"), Err(PsbtError::InvalidMagic));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let tx = unsigned_tx(&[(1, Script::new(vec![0x51]))]).serialize();
        let mut raw = MAGIC.to_vec();
        write_pair(&mut raw, &[PSBT_GLOBAL_UNSIGNED_TX], &tx);
        write_pair(&mut raw, &[0xfc], &[1]);
        write_pair(&mut raw, &[0xfc], &[2]);
        raw.push(0x00);
        assert_eq!(Psbt::parse(&raw), Err(PsbtError::DuplicateKey("fc".into())));
    }

    #[test]
    fn test_signed_global_tx_rejected() {
        let mut tx = unsigned_tx(&[(1, Script::new(vec![0x51]))]);
        tx.inputs[0].script_sig = Script::new(vec![0x51]);
        let mut raw = MAGIC.to_vec();
        write_pair(&mut raw, &[PSBT_GLOBAL_UNSIGNED_TX], &tx.serialize());
        raw.push(0x00);
        assert_eq!(Psbt::parse(&raw), Err(PsbtError::TxNotUnsigned));
    }

    #[test]
    fn test_truncated_scopes() {
        let raw = p2wpkh_psbt(&test_root()).serialize();
        assert!(Psbt::parse(&raw[..raw.len() - 1]).is_err());
        let mut extra = raw.clone();
        extra.push(0x00);
        assert_eq!(Psbt::parse(&extra), Err(PsbtError::TrailingData(1)));
    }

    #[test]
    fn test_sign_with_root() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        let added = psbt
            .sign_with(SigningKey::Hd(&root), SignOptions::default())
            .unwrap();
        assert_eq!(added, 2);

        for i in 0..2 {
            let digest = psbt.sighash(i, SighashType::ALL).unwrap();
            let (pubkey, sig) = psbt.inputs[i].partial_sigs.iter().next().unwrap();
            assert_eq!(*sig.last().unwrap(), 0x01);
            let sig = Signature::from_der(&sig[..sig.len() - 1]).unwrap();
            assert!(pubkey.verify(&sig, &digest));
        }
    }

    #[test]
    fn test_sign_skips_foreign_fingerprint() {
        let root = test_root();
        let other = HDKey::from_seed(&[7u8; 32], Network::Bitcoin.xprv()).unwrap();
        let mut psbt = p2wpkh_psbt(&root);
        let added = psbt
            .sign_with(SigningKey::Hd(&other), SignOptions::default())
            .unwrap();
        assert_eq!(added, 0);
        assert!(psbt.inputs.iter().all(|i| i.partial_sigs.is_empty()));
    }

    #[test]
    fn test_sign_rejects_wrong_derivation() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        let (pubkey, origin) = psbt.inputs[1].bip32_derivations.pop_first().unwrap();
        let mut wrong = origin.clone();
        wrong.path[4] = 9;
        psbt.inputs[1].bip32_derivations.insert(pubkey, wrong);

        let err = psbt
            .sign_with(SigningKey::Hd(&root), SignOptions::default())
            .unwrap_err();
        assert_eq!(err, PsbtError::DerivationMismatch(1));
        // input 0 keeps its signature
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);
    }

    #[test]
    fn test_sighash_conflict() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        psbt.inputs[0].sighash_type = Some(0x83);
        let options = SignOptions {
            sighash: Some(SighashType::ALL),
            allow_sighash_override: false,
        };
        assert_eq!(psbt.sign_with(SigningKey::Hd(&root), options).unwrap(), 1);
        assert!(psbt.inputs[0].partial_sigs.is_empty());

        let options = SignOptions {
            allow_sighash_override: true,
            ..options
        };
        assert_eq!(psbt.sign_with(SigningKey::Hd(&root), options).unwrap(), 2);
        let sig = psbt.inputs[0].partial_sigs.values().next().unwrap();
        assert_eq!(*sig.last().unwrap(), 0x83);
    }

    #[test]
    fn test_default_options_skip_non_all_inputs() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        // NONE|ANYONECANPAY would let anyone rewrite the outputs
        psbt.inputs[0].sighash_type = Some(0x82);
        psbt.inputs[1].sighash_type = Some(0x03);
        let added = psbt
            .sign_with(SigningKey::Hd(&root), SignOptions::default())
            .unwrap();
        assert_eq!(added, 0);
        assert!(psbt.inputs.iter().all(|i| i.partial_sigs.is_empty()));

        psbt.inputs[1].sighash_type = Some(0x01);
        let added = psbt
            .sign_with(SigningKey::Hd(&root), SignOptions::default())
            .unwrap();
        assert_eq!(added, 1);
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn test_unrestricted_options_follow_declared_sighash() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        psbt.inputs[0].sighash_type = Some(0x82);
        let options = SignOptions {
            sighash: None,
            allow_sighash_override: false,
        };
        assert_eq!(psbt.sign_with(SigningKey::Hd(&root), options).unwrap(), 2);
        let declared = psbt.inputs[0].partial_sigs.values().next().unwrap();
        assert_eq!(*declared.last().unwrap(), 0x82);
        let undeclared = psbt.inputs[1].partial_sigs.values().next().unwrap();
        assert_eq!(*undeclared.last().unwrap(), 0x01);
    }

    #[test]
    fn test_sign_with_single_key() {
        let root = test_root();
        let child = root
            .derive(&[84 | 0x8000_0000, 0x8000_0000, 0x8000_0000, 0, 0])
            .unwrap();
        let private = *child.private_key().unwrap();
        let mut psbt = p2wpkh_psbt(&root);
        let added = psbt
            .sign_with(SigningKey::Single(&private), SignOptions::default())
            .unwrap();
        assert_eq!(added, 1);
        assert!(psbt.inputs[0].partial_sigs.contains_key(&child.public_key()));
    }

    #[test]
    fn test_finalized_inputs_untouched() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        psbt.inputs[0].final_script_witness = Some(Witness::new(vec![vec![1]]));
        let added = psbt
            .sign_with(SigningKey::Hd(&root), SignOptions::default())
            .unwrap();
        assert_eq!(added, 1);
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn test_fee_and_utxo_checks() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        assert_eq!(psbt.fee().unwrap(), 10_000);

        psbt.outputs[0].value = 200_000;
        assert_eq!(psbt.fee(), Err(PsbtError::NegativeFee));

        psbt.inputs[1].witness_utxo = None;
        assert_eq!(psbt.fee(), Err(PsbtError::MissingUtxo(1)));

        let prev = unsigned_tx(&[(1, Script::new(vec![0x51])), (2, Script::new(vec![0x52]))]);
        psbt.inputs[1].non_witness_utxo = Some(prev.clone());
        assert_eq!(psbt.utxo(1), Err(PsbtError::TxidMismatch(1)));
        assert!(psbt.verify().is_err());

        psbt.inputs[1].prev_txid = prev.txid();
        assert_eq!(psbt.utxo(1).unwrap().value, 2);
        assert!(psbt.verify().is_ok());
    }

    #[test]
    fn test_trimmed_keeps_signatures_only() {
        let root = test_root();
        let mut psbt = p2wpkh_psbt(&root);
        psbt.sign_with(SigningKey::Hd(&root), SignOptions::default())
            .unwrap();
        let trimmed = psbt.trimmed();
        assert_eq!(trimmed.tx(), psbt.tx());
        assert!(trimmed.inputs.iter().all(|i| i.bip32_derivations.is_empty()));
        assert!(trimmed.inputs.iter().all(|i| i.witness_utxo.is_none()));
        assert!(trimmed.inputs.iter().all(|i| i.partial_sigs.len() == 1));
        assert!(trimmed.serialize().len() < psbt.serialize().len());
    }
}
