//! Raw transactions and the two signature digest algorithms.
//!
//! Legacy digests re-serialize the whole transaction per input. BIP-143
//! digests share three per-transaction hashes, which [`SighashCache`]
//! computes at most once.

use std::cell::OnceCell;
use std::fmt;
use std::str::FromStr;

use airsign_core::encode::{write_compact_size, EncodingError, Reader};
use airsign_core::hashes::double_sha256;
use airsign_core::script::{Script, Witness};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Invalid segwit flag {0:#04x}")]
    InvalidSegwitFlag(u8),
    #[error("Invalid sighash type {0:#x}")]
    InvalidSighash(u32),
    #[error("Input index {index} out of range, transaction has {count} inputs")]
    InputIndex { index: usize, count: usize },
    #[error("{0} trailing bytes after transaction")]
    TrailingData(usize),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SighashBase {
    All = 1,
    None = 2,
    Single = 3,
}

/// A sighash flag: base type plus the ANYONECANPAY modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SighashType {
    base: SighashBase,
    anyone_can_pay: bool,
}

impl SighashType {
    pub const ANYONECANPAY: u32 = 0x80;
    pub const ALL: SighashType = SighashType::new(SighashBase::All, false);

    pub const fn new(base: SighashBase, anyone_can_pay: bool) -> Self {
        Self {
            base,
            anyone_can_pay,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self, TransactionError> {
        let base = match value & !Self::ANYONECANPAY {
            1 => SighashBase::All,
            2 => SighashBase::None,
            3 => SighashBase::Single,
            _ => return Err(TransactionError::InvalidSighash(value)),
        };
        Ok(Self::new(base, value & Self::ANYONECANPAY != 0))
    }

    pub fn to_u32(self) -> u32 {
        let flag = if self.anyone_can_pay { Self::ANYONECANPAY } else { 0 };
        self.base as u32 | flag
    }

    pub fn base(self) -> SighashBase {
        self.base
    }

    pub fn anyone_can_pay(self) -> bool {
        self.anyone_can_pay
    }
}

impl Default for SighashType {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for SighashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.base {
            SighashBase::All => "ALL",
            SighashBase::None => "NONE",
            SighashBase::Single => "SINGLE",
        };
        f.write_str(base)?;
        if self.anyone_can_pay {
            f.write_str("|ANYONECANPAY")?;
        }
        Ok(())
    }
}

impl FromStr for SighashType {
    type Err = TransactionError;

    /// Accepts `ALL`, `NONE|ANYONECANPAY`, `single_anyonecanpay`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('_', "|");
        let (base, acp) = match upper.split_once('|') {
            Some((base, "ANYONECANPAY")) => (base, true),
            Some(_) => return Err(TransactionError::InvalidSighash(0)),
            None => (upper.as_str(), false),
        };
        let base = match base {
            "ALL" => SighashBase::All,
            "NONE" => SighashBase::None,
            "SINGLE" => SighashBase::Single,
            _ => return Err(TransactionError::InvalidSighash(0)),
        };
        Ok(Self::new(base, acp))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    /// Previous txid in serialization (internal) byte order.
    pub prev_txid: [u8; 32],
    pub vout: u32,
    pub script_sig: Script,
    pub sequence: u32,
    pub witness: Witness,
}

impl TxIn {
    pub fn new(prev_txid: [u8; 32], vout: u32, sequence: u32) -> Self {
        Self {
            prev_txid,
            vout,
            script_sig: Script::default(),
            sequence,
            witness: Witness::default(),
        }
    }

    /// Segwit-ness is derived from witness presence, never stored.
    pub fn is_segwit(&self) -> bool {
        !self.witness.is_empty()
    }

    fn write_outpoint(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.prev_txid);
        out.extend_from_slice(&self.vout.to_le_bytes());
    }

    fn write_with(&self, out: &mut Vec<u8>, script_sig: &Script, sequence: u32) {
        self.write_outpoint(out);
        out.extend_from_slice(&script_sig.serialize());
        out.extend_from_slice(&sequence.to_le_bytes());
    }

    fn read_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        let prev_txid = reader.read_array::<32>()?;
        let vout = reader.read_u32_le()?;
        let script_sig = Script::read_from(reader)?;
        let sequence = reader.read_u32_le()?;
        Ok(Self {
            prev_txid,
            vout,
            script_sig,
            sequence,
            witness: Witness::default(),
        })
    }

    /// Previous txid in the usual reversed hex form.
    pub fn prev_txid_hex(&self) -> String {
        reversed_hex(&self.prev_txid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.script_pubkey.len() + 9);
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&self.script_pubkey.serialize());
        out
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        let value = reader.read_u64_le()?;
        let script_pubkey = Script::read_from(reader)?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }

    /// Parse a serialized output that must use all of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, TransactionError> {
        let mut reader = Reader::new(data);
        let out = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(TransactionError::TrailingData(reader.remaining()));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Transaction {
    pub fn is_segwit(&self) -> bool {
        self.inputs.iter().any(TxIn::is_segwit)
    }

    /// Network serialization, with marker, flag and witnesses when any
    /// input carries witness data.
    pub fn serialize(&self) -> Vec<u8> {
        self.write(self.is_segwit())
    }

    /// Serialization without witness data (the txid preimage).
    pub fn serialize_no_witness(&self) -> Vec<u8> {
        self.write(false)
    }

    fn write(&self, segwit: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        if segwit {
            out.extend_from_slice(&[0x00, 0x01]);
        }
        write_compact_size(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_with(&mut out, &input.script_sig, input.sequence);
        }
        write_compact_size(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.serialize());
        }
        if segwit {
            for input in &self.inputs {
                out.extend_from_slice(&input.witness.serialize());
            }
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self, TransactionError> {
        let version = reader.read_u32_le()?;
        let mut input_count = reader.read_compact_size()?;
        // a zero input count is the segwit marker
        let segwit = input_count == 0;
        if segwit {
            let flag = reader.read_u8()?;
            if flag != 0x01 {
                return Err(TransactionError::InvalidSegwitFlag(flag));
            }
            input_count = reader.read_compact_size()?;
        }
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            inputs.push(TxIn::read_from(reader)?);
        }
        let output_count = reader.read_compact_size()?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            outputs.push(TxOut::read_from(reader)?);
        }
        if segwit {
            for input in &mut inputs {
                input.witness = Witness::read_from(reader)?;
            }
        }
        let locktime = reader.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    /// Parse a transaction that must use all of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, TransactionError> {
        let mut reader = Reader::new(data);
        let tx = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(TransactionError::TrailingData(reader.remaining()));
        }
        Ok(tx)
    }

    /// Transaction id in internal byte order.
    pub fn txid(&self) -> [u8; 32] {
        double_sha256(&self.serialize_no_witness())
    }

    /// Transaction id as displayed by block explorers.
    pub fn txid_hex(&self) -> String {
        reversed_hex(&self.txid())
    }

    fn check_index(&self, index: usize) -> Result<(), TransactionError> {
        if index >= self.inputs.len() {
            return Err(TransactionError::InputIndex {
                index,
                count: self.inputs.len(),
            });
        }
        Ok(())
    }

    /// Pre-segwit signature digest for input `index`.
    ///
    /// OP_CODESEPARATOR is not stripped from `script_code`.
    pub fn sighash_legacy(
        &self,
        index: usize,
        script_code: &Script,
        sighash: SighashType,
    ) -> Result<[u8; 32], TransactionError> {
        self.check_index(index)?;
        let base = sighash.base();

        // SIGHASH_SINGLE without a matching output signs the number one
        if base == SighashBase::Single && index >= self.outputs.len() {
            let mut one = [0u8; 32];
            one[0] = 1;
            return Ok(one);
        }

        let mut pre = Vec::new();
        pre.extend_from_slice(&self.version.to_le_bytes());

        let empty = Script::default();
        if sighash.anyone_can_pay() {
            write_compact_size(&mut pre, 1);
            let input = &self.inputs[index];
            input.write_with(&mut pre, script_code, input.sequence);
        } else {
            write_compact_size(&mut pre, self.inputs.len() as u64);
            for (i, input) in self.inputs.iter().enumerate() {
                if i == index {
                    input.write_with(&mut pre, script_code, input.sequence);
                } else {
                    let sequence = match base {
                        SighashBase::All => input.sequence,
                        SighashBase::None | SighashBase::Single => 0,
                    };
                    input.write_with(&mut pre, &empty, sequence);
                }
            }
        }

        match base {
            SighashBase::None => write_compact_size(&mut pre, 0),
            SighashBase::Single => {
                write_compact_size(&mut pre, index as u64 + 1);
                let blank = TxOut::new(u64::MAX, Script::default()).serialize();
                for _ in 0..index {
                    pre.extend_from_slice(&blank);
                }
                pre.extend_from_slice(&self.outputs[index].serialize());
            }
            SighashBase::All => {
                write_compact_size(&mut pre, self.outputs.len() as u64);
                for output in &self.outputs {
                    pre.extend_from_slice(&output.serialize());
                }
            }
        }

        pre.extend_from_slice(&self.locktime.to_le_bytes());
        pre.extend_from_slice(&sighash.to_u32().to_le_bytes());
        Ok(double_sha256(&pre))
    }

    /// BIP-143 digest for a single input. Use a [`SighashCache`] when
    /// signing several inputs.
    pub fn sighash_segwit(
        &self,
        index: usize,
        script_code: &Script,
        value: u64,
        sighash: SighashType,
    ) -> Result<[u8; 32], TransactionError> {
        SighashCache::new(self).segwit(index, script_code, value, sighash)
    }
}

/// Per-transaction BIP-143 hash components, each computed on first use.
#[derive(Debug)]
pub struct SighashCache<'a> {
    tx: &'a Transaction,
    hash_prevouts: OnceCell<[u8; 32]>,
    hash_sequence: OnceCell<[u8; 32]>,
    hash_outputs: OnceCell<[u8; 32]>,
}

impl<'a> SighashCache<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            tx,
            hash_prevouts: OnceCell::new(),
            hash_sequence: OnceCell::new(),
            hash_outputs: OnceCell::new(),
        }
    }

    pub fn transaction(&self) -> &'a Transaction {
        self.tx
    }

    fn hash_prevouts(&self) -> &[u8; 32] {
        self.hash_prevouts.get_or_init(|| {
            let mut data = Vec::with_capacity(self.tx.inputs.len() * 36);
            for input in &self.tx.inputs {
                input.write_outpoint(&mut data);
            }
            double_sha256(&data)
        })
    }

    fn hash_sequence(&self) -> &[u8; 32] {
        self.hash_sequence.get_or_init(|| {
            let data: Vec<u8> = self
                .tx
                .inputs
                .iter()
                .flat_map(|input| input.sequence.to_le_bytes())
                .collect();
            double_sha256(&data)
        })
    }

    fn hash_outputs(&self) -> &[u8; 32] {
        self.hash_outputs.get_or_init(|| {
            let data: Vec<u8> = self.tx.outputs.iter().flat_map(TxOut::serialize).collect();
            double_sha256(&data)
        })
    }

    /// BIP-143 digest for input `index` spending `value` satoshis.
    pub fn segwit(
        &self,
        index: usize,
        script_code: &Script,
        value: u64,
        sighash: SighashType,
    ) -> Result<[u8; 32], TransactionError> {
        self.tx.check_index(index)?;
        let zero = [0u8; 32];
        let base = sighash.base();
        let input = &self.tx.inputs[index];

        let mut pre = Vec::with_capacity(160 + script_code.len());
        pre.extend_from_slice(&self.tx.version.to_le_bytes());
        if sighash.anyone_can_pay() {
            pre.extend_from_slice(&zero);
        } else {
            pre.extend_from_slice(self.hash_prevouts());
        }
        if sighash.anyone_can_pay() || base != SighashBase::All {
            pre.extend_from_slice(&zero);
        } else {
            pre.extend_from_slice(self.hash_sequence());
        }
        input.write_outpoint(&mut pre);
        pre.extend_from_slice(&script_code.serialize());
        pre.extend_from_slice(&value.to_le_bytes());
        pre.extend_from_slice(&input.sequence.to_le_bytes());
        match base {
            SighashBase::All => pre.extend_from_slice(self.hash_outputs()),
            SighashBase::Single if index < self.tx.outputs.len() => {
                pre.extend_from_slice(&double_sha256(&self.tx.outputs[index].serialize()))
            }
            _ => pre.extend_from_slice(&zero),
        }
        pre.extend_from_slice(&self.tx.locktime.to_le_bytes());
        pre.extend_from_slice(&sighash.to_u32().to_le_bytes());
        Ok(double_sha256(&pre))
    }
}

fn reversed_hex(hash: &[u8; 32]) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

/// Parse a displayed (reversed) txid.
pub fn txid_from_hex(s: &str) -> Result<[u8; 32], EncodingError> {
    let mut bytes: [u8; 32] = hex::decode(s)
        .map_err(|e| EncodingError::Hex(e.to_string()))?
        .try_into()
        .map_err(|_| EncodingError::Hex(format!("txid must be 32 bytes: {}", s)))?;
    bytes.reverse();
    Ok(bytes)
}
