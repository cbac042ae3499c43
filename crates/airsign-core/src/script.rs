//! Script and witness containers, the scriptPubkey classifier, standard
//! output builders and address encoding.

use std::fmt;

use bech32::{u5, FromBase32, ToBase32, Variant};
use thiserror::Error;

use crate::ec::PublicKey;
use crate::encode::{base58_decode_check, base58_encode_check, write_var_bytes, EncodingError, Reader};
use crate::hashes::{hash160, sha256};
use crate::networks::{Network, ALL_NETWORKS};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Script type {0} has no address representation")]
    NoAddress(ScriptType),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid multisig: {0}")]
    InvalidMultisig(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Classification of a scriptPubkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    /// Bare `OP_m <keys> OP_n CHECKMULTISIG`.
    Multisig,
    /// `OP_RETURN` data carrier.
    NullData,
    Unknown,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2wsh => "p2wsh",
            ScriptType::P2tr => "p2tr",
            ScriptType::Multisig => "multisig",
            ScriptType::NullData => "nulldata",
            ScriptType::Unknown => "unknown",
        }
    }

    pub fn is_segwit(&self) -> bool {
        matches!(self, ScriptType::P2wpkh | ScriptType::P2wsh | ScriptType::P2tr)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw script bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new(data: Vec<u8>) -> Self {
        Script(data)
    }

    /// Script consisting only of data pushes, as used in scriptSigs.
    pub fn from_pushes<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let mut data = Vec::new();
        for item in items {
            push_data(&mut data, item.as_ref());
        }
        Script(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn script_type(&self) -> ScriptType {
        let d = &self.0;
        if d.len() == 25 && d[..3] == [OP_DUP, OP_HASH160, 0x14] && d[23..] == [OP_EQUALVERIFY, OP_CHECKSIG] {
            ScriptType::P2pkh
        } else if d.len() == 23 && d[..2] == [OP_HASH160, 0x14] && d[22] == OP_EQUAL {
            ScriptType::P2sh
        } else if d.len() == 22 && d[..2] == [OP_0, 0x14] {
            ScriptType::P2wpkh
        } else if d.len() == 34 && d[..2] == [OP_0, 0x20] {
            ScriptType::P2wsh
        } else if d.len() == 34 && d[..2] == [OP_1, 0x20] {
            ScriptType::P2tr
        } else if d.first() == Some(&OP_RETURN) {
            ScriptType::NullData
        } else if d.len() > 3
            && d[d.len() - 1] == OP_CHECKMULTISIG
            && decode_small_int(d[0]).is_some()
            && decode_small_int(d[d.len() - 2]).is_some()
        {
            ScriptType::Multisig
        } else {
            ScriptType::Unknown
        }
    }

    /// Encode as an address for `network`.
    pub fn address(&self, network: Network) -> Result<String, ScriptError> {
        let d = &self.0;
        match self.script_type() {
            ScriptType::P2pkh => {
                let mut payload = vec![network.p2pkh_prefix()];
                payload.extend_from_slice(&d[3..23]);
                Ok(base58_encode_check(&payload))
            }
            ScriptType::P2sh => {
                let mut payload = vec![network.p2sh_prefix()];
                payload.extend_from_slice(&d[2..22]);
                Ok(base58_encode_check(&payload))
            }
            ScriptType::P2wpkh | ScriptType::P2wsh => segwit_address(network, 0, &d[2..]),
            ScriptType::P2tr => segwit_address(network, 1, &d[2..]),
            other => Err(ScriptError::NoAddress(other)),
        }
    }

    /// Compact-size length prefix followed by the script bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() + 9);
        write_var_bytes(&mut out, &self.0);
        out
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Script(reader.read_var_bytes()?.to_vec()))
    }
}

impl From<Vec<u8>> for Script {
    fn from(data: Vec<u8>) -> Self {
        Script(data)
    }
}

impl AsRef<[u8]> for Script {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", self)
    }
}

/// Segwit witness stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Witness {
    pub items: Vec<Vec<u8>>,
}

impl Witness {
    pub fn new(items: Vec<Vec<u8>>) -> Self {
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        crate::encode::write_compact_size(&mut out, self.items.len() as u64);
        for item in &self.items {
            write_var_bytes(&mut out, item);
        }
        out
    }

    pub fn read_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        let count = reader.read_compact_size()?;
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(reader.read_var_bytes()?.to_vec());
        }
        Ok(Self { items })
    }
}

/// Append a minimal data push.
pub fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
}

/// Append a script number: `OP_0`, `OP_1..OP_16`, or a minimal
/// little-endian push with a sign padding byte.
pub fn push_number(out: &mut Vec<u8>, n: u64) {
    if n == 0 {
        out.push(OP_0);
        return;
    }
    if n <= 16 {
        out.push(0x50 + n as u8);
        return;
    }
    let mut bytes: Vec<u8> = n.to_le_bytes().to_vec();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(0x00);
    }
    push_data(out, &bytes);
}

/// Decode a small-integer opcode (`OP_1..OP_16`).
pub fn decode_small_int(op: u8) -> Option<u8> {
    (OP_1..=OP_16).contains(&op).then(|| op - 0x50)
}

pub fn p2pkh(pubkey: &PublicKey) -> Script {
    p2pkh_from_hash(&pubkey.hash160())
}

pub fn p2pkh_from_hash(hash: &[u8; 20]) -> Script {
    let mut data = vec![OP_DUP, OP_HASH160, 0x14];
    data.extend_from_slice(hash);
    data.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    Script(data)
}

pub fn p2sh(redeem_script: &Script) -> Script {
    let mut data = vec![OP_HASH160, 0x14];
    data.extend_from_slice(&hash160(redeem_script.as_bytes()));
    data.push(OP_EQUAL);
    Script(data)
}

pub fn p2wpkh(pubkey: &PublicKey) -> Script {
    let mut data = vec![OP_0, 0x14];
    data.extend_from_slice(&pubkey.hash160());
    Script(data)
}

pub fn p2wsh(witness_script: &Script) -> Script {
    let mut data = vec![OP_0, 0x20];
    data.extend_from_slice(&sha256(witness_script.as_bytes()));
    Script(data)
}

/// Script code used to sign a p2wpkh input.
pub fn p2pkh_from_p2wpkh(script: &Script) -> Option<Script> {
    if script.script_type() != ScriptType::P2wpkh {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script.as_bytes()[2..22]);
    Some(p2pkh_from_hash(&hash))
}

/// `OP_m <pubkeys...> OP_n OP_CHECKMULTISIG`
pub fn multisig(m: usize, pubkeys: &[PublicKey]) -> Result<Script, ScriptError> {
    if m == 0 || m > 16 {
        return Err(ScriptError::InvalidMultisig(format!("m must be between 1 and 16, got {}", m)));
    }
    let n = pubkeys.len();
    if n < m || n > 16 {
        return Err(ScriptError::InvalidMultisig(format!(
            "number of pubkeys must be between {} and 16, got {}",
            m, n
        )));
    }
    let mut data = vec![0x50 + m as u8];
    for pubkey in pubkeys {
        push_data(&mut data, &pubkey.sec());
    }
    data.push(0x50 + n as u8);
    data.push(OP_CHECKMULTISIG);
    Ok(Script(data))
}

fn segwit_address(network: Network, version: u8, program: &[u8]) -> Result<String, ScriptError> {
    let version_u5 = u5::try_from_u8(version).map_err(|e| ScriptError::InvalidAddress(e.to_string()))?;
    let mut data = vec![version_u5];
    data.extend(program.to_base32());
    let variant = if version == 0 { Variant::Bech32 } else { Variant::Bech32m };
    bech32::encode(network.bech32_hrp(), data, variant)
        .map_err(|e| ScriptError::InvalidAddress(e.to_string()))
}

/// Decode a base58 or bech32 address (or `bitcoin:` URI) into its
/// scriptPubkey.
pub fn address_to_script_pubkey(address: &str) -> Result<Script, ScriptError> {
    let addr = strip_uri(address);

    if let Ok(payload) = base58_decode_check(addr) {
        if payload.len() != 21 {
            return Err(ScriptError::InvalidAddress("bad base58 payload length".into()));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        for network in ALL_NETWORKS {
            if payload[0] == network.p2pkh_prefix() {
                return Ok(p2pkh_from_hash(&hash));
            }
            if payload[0] == network.p2sh_prefix() {
                let mut data = vec![OP_HASH160, 0x14];
                data.extend_from_slice(&hash);
                data.push(OP_EQUAL);
                return Ok(Script(data));
            }
        }
        return Err(ScriptError::InvalidAddress(format!("unknown prefix {:#04x}", payload[0])));
    }

    let (hrp, data, variant) =
        bech32::decode(addr).map_err(|e| ScriptError::Encoding(EncodingError::Bech32(e.to_string())))?;
    if !ALL_NETWORKS.iter().any(|n| n.bech32_hrp() == hrp) {
        return Err(ScriptError::InvalidAddress(format!("unknown hrp {}", hrp)));
    }
    let (version, program) = data
        .split_first()
        .ok_or_else(|| ScriptError::InvalidAddress("empty bech32 payload".into()))?;
    let version = version.to_u8();
    let program = Vec::<u8>::from_base32(program)
        .map_err(|e| ScriptError::Encoding(EncodingError::Bech32(e.to_string())))?;
    let expected_variant = if version == 0 { Variant::Bech32 } else { Variant::Bech32m };
    if variant != expected_variant || version > 16 {
        return Err(ScriptError::InvalidAddress("wrong bech32 variant".into()));
    }
    if (version == 0 && program.len() != 20 && program.len() != 32)
        || program.len() < 2
        || program.len() > 40
    {
        return Err(ScriptError::InvalidAddress("bad witness program length".into()));
    }
    let mut spk = vec![if version == 0 { OP_0 } else { 0x50 + version }];
    push_data(&mut spk, &program);
    Ok(Script(spk))
}

fn strip_uri(address: &str) -> &str {
    if address.len() >= 8 && address[..8].eq_ignore_ascii_case("bitcoin:") {
        let rest = &address[8..];
        match rest.find('?') {
            Some(end) => &rest[..end],
            None => rest,
        }
    } else {
        address
    }
}
