//! BIP-32 hierarchical deterministic keys.
//!
//! # Serialization
//!
//! ```text
//! version(4) | depth(1) | parent fingerprint(4) | child number(4, BE)
//!            | chain code(32) | 0x00 || secret(32)  or  compressed pubkey(33)
//! ```
//!
//! Base58Check of the 78 bytes gives the familiar `xprv`/`xpub` strings.
//! The version must encode to a string whose letters 2..4 are `prv` for a
//! private key and `pub` for a public one.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use thiserror::Error;

use crate::ec::{EcError, PrivateKey, PublicKey, Signature};
use crate::encode::{base58_decode_check, base58_encode_check, EncodingError};
use crate::hashes::{hash160, hmac_sha512};
use crate::networks::{KeyRole, Network};

/// First hardened child index.
pub const HARDENED: u32 = 0x8000_0000;

/// Length of a serialized extended key.
pub const EXTENDED_KEY_LEN: usize = 78;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HdError {
    #[error("Extended key must be {EXTENDED_KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("Version does not match key privacy")]
    VersionMismatch,
    #[error("Unknown extended key version {0}")]
    UnknownVersion(String),
    #[error("Hardened derivation requires a private key")]
    HardenedFromPublic,
    #[error("Key is not private")]
    NotPrivate,
    #[error("Already a public key")]
    AlreadyPublic,
    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),
    #[error("Derivation index out of range: {0}")]
    IndexOutOfRange(String),
    #[error("Key at depth 255 has no children")]
    MaxDepth,
    #[error("Invalid seed length {0}")]
    InvalidSeedLength(usize),
    #[error(transparent)]
    Ec(#[from] EcError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum KeyMaterial {
    Private(PrivateKey),
    Public(PublicKey),
}

/// An extended private or public key. Immutable: derivation returns new keys.
#[derive(Clone)]
pub struct HDKey {
    key: KeyMaterial,
    chain_code: [u8; 32],
    version: [u8; 4],
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_number: u32,
}

impl HDKey {
    fn build(
        key: KeyMaterial,
        chain_code: [u8; 32],
        version: [u8; 4],
        depth: u8,
        parent_fingerprint: [u8; 4],
        child_number: u32,
    ) -> Result<Self, HdError> {
        if let KeyMaterial::Public(pk) = &key {
            if !pk.is_compressed() {
                return Err(HdError::Ec(EcError::InvalidPublicKey));
            }
        }
        let hd = Self {
            key,
            chain_code,
            version,
            depth,
            parent_fingerprint,
            child_number,
        };
        let expected = if hd.is_private() { "prv" } else { "pub" };
        if version_marker(&hd.serialize()) != expected {
            return Err(HdError::VersionMismatch);
        }
        Ok(hd)
    }

    pub fn from_private(
        key: PrivateKey,
        chain_code: [u8; 32],
        version: [u8; 4],
        depth: u8,
        parent_fingerprint: [u8; 4],
        child_number: u32,
    ) -> Result<Self, HdError> {
        Self::build(
            KeyMaterial::Private(key),
            chain_code,
            version,
            depth,
            parent_fingerprint,
            child_number,
        )
    }

    pub fn from_public(
        key: PublicKey,
        chain_code: [u8; 32],
        version: [u8; 4],
        depth: u8,
        parent_fingerprint: [u8; 4],
        child_number: u32,
    ) -> Result<Self, HdError> {
        Self::build(
            KeyMaterial::Public(key),
            chain_code,
            version,
            depth,
            parent_fingerprint,
            child_number,
        )
    }

    /// Root key from a BIP-39 seed (normally 64 bytes).
    pub fn from_seed(seed: &[u8], version: [u8; 4]) -> Result<Self, HdError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(HdError::InvalidSeedLength(seed.len()));
        }
        let raw = hmac_sha512(b"Bitcoin seed", seed);
        let key = PrivateKey::from_bytes(&raw[..32])?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&raw[32..]);
        Self::from_private(key, chain_code, version, 0, [0; 4], 0)
    }

    pub fn is_private(&self) -> bool {
        matches!(self.key, KeyMaterial::Private(_))
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        match &self.key {
            KeyMaterial::Private(sk) => Some(sk),
            KeyMaterial::Public(_) => None,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match &self.key {
            KeyMaterial::Private(sk) => sk.public_key(),
            KeyMaterial::Public(pk) => *pk,
        }
    }

    pub fn sec(&self) -> [u8; 33] {
        self.public_key().compressed_sec()
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn version(&self) -> [u8; 4] {
        self.version
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    pub fn child_number(&self) -> u32 {
        self.child_number
    }

    /// Network the version bytes belong to, if known.
    pub fn network(&self) -> Option<Network> {
        Network::from_key_version(self.version).map(|(n, _, _)| n)
    }

    /// First four bytes of HASH160 of the compressed public key.
    pub fn fingerprint(&self) -> [u8; 4] {
        let mut fp = [0u8; 4];
        fp.copy_from_slice(&hash160(&self.sec())[..4]);
        fp
    }

    /// Derive a single child. Indices at or above [`HARDENED`] are always
    /// hardened; `hardened = true` lifts a lower index into that range.
    pub fn child(&self, index: u32, hardened: bool) -> Result<HDKey, HdError> {
        let index = if hardened && index < HARDENED {
            index + HARDENED
        } else {
            index
        };
        let hardened = index >= HARDENED;
        let depth = self.depth.checked_add(1).ok_or(HdError::MaxDepth)?;

        let sec = self.sec();
        let mut data = Vec::with_capacity(37);
        if hardened {
            let sk = self.private_key().ok_or(HdError::HardenedFromPublic)?;
            data.push(0x00);
            data.extend_from_slice(&sk.secret_bytes());
        } else {
            data.extend_from_slice(&sec);
        }
        data.extend_from_slice(&index.to_be_bytes());

        let raw = hmac_sha512(&self.chain_code, &data);
        let mut tweak = [0u8; 32];
        tweak.copy_from_slice(&raw[..32]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&raw[32..]);

        let key = match &self.key {
            KeyMaterial::Private(sk) => KeyMaterial::Private(sk.tweak_add(&tweak)?),
            KeyMaterial::Public(pk) => KeyMaterial::Public(pk.tweak_add(&tweak)?),
        };

        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&hash160(&sec)[..4]);

        Ok(HDKey {
            key,
            chain_code,
            version: self.version,
            depth,
            parent_fingerprint,
            child_number: index,
        })
    }

    /// Repeated [`HDKey::child`] along `path`.
    pub fn derive(&self, path: &[u32]) -> Result<HDKey, HdError> {
        let mut key = self.clone();
        for &index in path {
            key = key.child(index, false)?;
        }
        Ok(key)
    }

    /// Derive from a textual path such as `m/84h/0h/0h`.
    pub fn derive_path(&self, path: &str) -> Result<HDKey, HdError> {
        self.derive(&parse_path(path)?)
    }

    /// Neutered copy with the matching public version (xprv -> xpub,
    /// zprv -> zpub, ...).
    pub fn to_public(&self) -> Result<HDKey, HdError> {
        if !self.is_private() {
            return Err(HdError::AlreadyPublic);
        }
        let (network, role, _) = Network::from_key_version(self.version)
            .ok_or_else(|| HdError::UnknownVersion(hex::encode(self.version)))?;
        self.to_public_with_version(network.key_version(role, false))
    }

    pub fn to_public_with_version(&self, version: [u8; 4]) -> Result<HDKey, HdError> {
        Self::from_public(
            self.public_key(),
            self.chain_code,
            version,
            self.depth,
            self.parent_fingerprint,
            self.child_number,
        )
    }

    pub fn sign(&self, msg: &[u8; 32]) -> Result<Signature, HdError> {
        self.private_key()
            .map(|sk| sk.sign(msg))
            .ok_or(HdError::NotPrivate)
    }

    pub fn serialize(&self) -> [u8; EXTENDED_KEY_LEN] {
        self.serialize_with_version(self.version)
    }

    pub fn serialize_with_version(&self, version: [u8; 4]) -> [u8; EXTENDED_KEY_LEN] {
        let mut out = [0u8; EXTENDED_KEY_LEN];
        out[..4].copy_from_slice(&version);
        out[4] = self.depth;
        out[5..9].copy_from_slice(&self.parent_fingerprint);
        out[9..13].copy_from_slice(&self.child_number.to_be_bytes());
        out[13..45].copy_from_slice(&self.chain_code);
        match &self.key {
            KeyMaterial::Private(sk) => out[46..].copy_from_slice(&sk.secret_bytes()),
            KeyMaterial::Public(pk) => out[45..].copy_from_slice(&pk.compressed_sec()),
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, HdError> {
        if data.len() != EXTENDED_KEY_LEN {
            return Err(HdError::InvalidLength(data.len()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&data[..4]);
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let child_number = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);
        let key = if data[45] == 0x00 {
            KeyMaterial::Private(PrivateKey::from_bytes(&data[46..])?)
        } else {
            KeyMaterial::Public(PublicKey::parse(&data[45..])?)
        };
        Self::build(key, chain_code, version, data[4], parent_fingerprint, child_number)
    }

    pub fn to_base58(&self) -> String {
        base58_encode_check(&self.serialize())
    }

    /// Re-encode with other version bytes, e.g. to show a zpub.
    pub fn to_base58_with_version(&self, version: [u8; 4]) -> String {
        base58_encode_check(&self.serialize_with_version(version))
    }

    pub fn from_base58(s: &str) -> Result<Self, HdError> {
        Self::parse(&base58_decode_check(s)?)
    }

    // Equality, ordering and hashing ignore the version bytes.
    fn identity(&self) -> [u8; EXTENDED_KEY_LEN - 4] {
        let mut out = [0u8; EXTENDED_KEY_LEN - 4];
        out.copy_from_slice(&self.serialize()[4..]);
        out
    }
}

fn version_marker(serialized: &[u8]) -> String {
    base58_encode_check(serialized).chars().skip(1).take(3).collect()
}

impl PartialEq for HDKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for HDKey {}

impl Hash for HDKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl Ord for HDKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl PartialOrd for HDKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HDKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for HDKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_private() {
            write!(f, "HDKey(private, fingerprint={})", hex::encode(self.fingerprint()))
        } else {
            write!(f, "HDKey({})", self.to_base58())
        }
    }
}

impl FromStr for HDKey {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

/// Master fingerprint plus the path from that master, as carried by
/// descriptor key origins and PSBT derivation records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyOrigin {
    pub fingerprint: [u8; 4],
    pub path: Vec<u32>,
}

impl KeyOrigin {
    pub fn new(fingerprint: [u8; 4], path: Vec<u32>) -> Self {
        Self { fingerprint, path }
    }

    /// PSBT encoding: fingerprint followed by little-endian u32 indices.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 * self.path.len());
        out.extend_from_slice(&self.fingerprint);
        for index in &self.path {
            out.extend_from_slice(&index.to_le_bytes());
        }
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, HdError> {
        if data.len() < 4 || data.len() % 4 != 0 {
            return Err(HdError::InvalidPath(format!(
                "derivation record of {} bytes",
                data.len()
            )));
        }
        let mut fingerprint = [0u8; 4];
        fingerprint.copy_from_slice(&data[..4]);
        let path = data[4..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { fingerprint, path })
    }
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.fingerprint))?;
        for index in &self.path {
            write!(f, "/{}", path_element_to_string(*index))?;
        }
        Ok(())
    }
}

/// `55f8fc5d/84h/0h/0h`
impl FromStr for KeyOrigin {
    type Err = HdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (fp, path) = match s.split_once('/') {
            Some((fp, path)) => (fp, path),
            None => (s, ""),
        };
        let bytes = hex::decode(fp).map_err(|_| HdError::InvalidPath(s.to_string()))?;
        let fingerprint: [u8; 4] = bytes
            .try_into()
            .map_err(|_| HdError::InvalidPath(format!("bad fingerprint in {}", s)))?;
        let path = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/')
                .map(parse_path_element)
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self { fingerprint, path })
    }
}

/// Parse `m/84h/0'/1` (leading `m` optional) into child indices.
pub fn parse_path(path: &str) -> Result<Vec<u32>, HdError> {
    let path = path.trim();
    let mut parts = path.split('/').peekable();
    if parts.peek().is_some_and(|p| *p == "m" || p.is_empty()) {
        parts.next();
    }
    parts.map(parse_path_element).collect()
}

/// Parse one path element such as `84h`, `0'` or `7`.
pub fn parse_path_element(element: &str) -> Result<u32, HdError> {
    let (digits, hardened) = match element.strip_suffix(['h', 'H', '\'']) {
        Some(d) => (d, true),
        None => (element, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HdError::InvalidPath(element.to_string()));
    }
    let index: u32 = digits
        .parse()
        .map_err(|_| HdError::IndexOutOfRange(element.to_string()))?;
    if hardened {
        if index >= HARDENED {
            return Err(HdError::IndexOutOfRange(element.to_string()));
        }
        Ok(index + HARDENED)
    } else {
        Ok(index)
    }
}

/// Render indices as `m/84h/0h/0h`.
pub fn path_to_string(path: &[u32]) -> String {
    let mut out = String::from("m");
    for index in path {
        out.push('/');
        out.push_str(&path_element_to_string(*index));
    }
    out
}

pub fn path_element_to_string(index: u32) -> String {
    if index >= HARDENED {
        format!("{}h", index - HARDENED)
    } else {
        index.to_string()
    }
}

/// Guess the SLIP-132 version for an account path: `84h` gives z-keys,
/// `49h` y-keys, `48h/../1h` Y-keys and `48h/../2h` Z-keys. A coin type of
/// `1h` selects testnet when no network is given.
pub fn detect_version(path: &[u32], private: bool, network: Option<Network>) -> [u8; 4] {
    let role = match path.first() {
        Some(&p) if p == HARDENED + 84 => KeyRole::NativeSegwit,
        Some(&p) if p == HARDENED + 49 => KeyRole::NestedSegwit,
        Some(&p) if p == HARDENED + 48 => match path.get(3) {
            Some(&s) if s == HARDENED + 1 => KeyRole::NestedSegwitMultisig,
            Some(&s) if s == HARDENED + 2 => KeyRole::NativeSegwitMultisig,
            _ => KeyRole::Legacy,
        },
        _ => KeyRole::Legacy,
    };
    let network = network.unwrap_or(match path.get(1) {
        Some(&c) if c == HARDENED + 1 => Network::Testnet,
        _ => Network::Bitcoin,
    });
    network.key_version(role, private)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector1_root() -> HDKey {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        HDKey::from_seed(&seed, Network::Bitcoin.xprv()).unwrap()
    }

    /// BIP-32 test vector 1, chain m.
    #[test]
    fn test_vector1_master() {
        let root = vector1_root();
        assert_eq!(
            root.to_base58(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(
            root.to_public().unwrap().to_base58(),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
    }

    #[test]
    fn test_depth_limit() {
        let root = vector1_root().to_public().unwrap();
        let deepest = root.derive(&[7; 255]).unwrap();
        assert_eq!(deepest.depth(), 255);
        assert_eq!(deepest.child(0, false), Err(HdError::MaxDepth));
        assert_eq!(root.derive(&[7; 256]), Err(HdError::MaxDepth));
    }

    /// BIP-32 test vector 1, chains m/0H and m/0H/1.
    #[test]
    fn test_vector1_children() {
        let root = vector1_root();
        let child = root.child(0, true).unwrap();
        assert_eq!(
            child.to_base58(),
            "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7"
        );
        assert_eq!(
            child.to_public().unwrap().to_base58(),
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw"
        );

        // public derivation of a normal child matches private derivation
        let via_private = root.derive_path("m/0h/1").unwrap().to_public().unwrap();
        let via_public = child.to_public().unwrap().child(1, false).unwrap();
        assert_eq!(via_private, via_public);
        assert_eq!(
            via_public.to_base58(),
            "xpub6ASuArnXKPbfEwhqN6e3mwBcDTgzisQN1wXN9BJcM47sSikHjJf3UFHKkNAWbWMiGj7Wf5uMash7SyYq527Hqck2AxYysAA7xmALppuCkwQ"
        );
    }

    #[test]
    fn test_deterministic_derivation() {
        let root = vector1_root();
        let a = root.derive_path("m/84h/0h/0h/0/5").unwrap();
        let b = root.derive_path("m/84'/0'/0'/0/5").unwrap();
        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn test_base58_roundtrip() {
        let root = vector1_root();
        for path in ["m", "m/0h", "m/44h/1h/0h/1/7"] {
            let key = root.derive_path(path).unwrap();
            let parsed = HDKey::from_base58(&key.to_base58()).unwrap();
            assert_eq!(parsed.serialize(), key.serialize());
            let xpub = key.to_public().unwrap();
            let parsed = HDKey::from_base58(&xpub.to_base58()).unwrap();
            assert_eq!(parsed.serialize(), xpub.serialize());
        }
    }

    #[test]
    fn test_hardened_from_public_fails() {
        let xpub = vector1_root().to_public().unwrap();
        assert_eq!(xpub.child(0, true).unwrap_err(), HdError::HardenedFromPublic);
        assert_eq!(
            xpub.child(HARDENED + 3, false).unwrap_err(),
            HdError::HardenedFromPublic
        );
    }

    #[test]
    fn test_version_mismatch() {
        let root = vector1_root();
        let err = HDKey::from_private(
            *root.private_key().unwrap(),
            *root.chain_code(),
            Network::Bitcoin.xpub(),
            0,
            [0; 4],
            0,
        )
        .unwrap_err();
        assert_eq!(err, HdError::VersionMismatch);

        // private payload re-labelled with an xpub version
        let mut bytes = root.serialize();
        bytes[..4].copy_from_slice(&Network::Bitcoin.xpub());
        assert_eq!(HDKey::parse(&bytes).unwrap_err(), HdError::VersionMismatch);
    }

    #[test]
    fn test_malformed_length() {
        assert_eq!(HDKey::parse(&[0u8; 77]).unwrap_err(), HdError::InvalidLength(77));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("m/84h/1'/0H/5").unwrap(),
            vec![HARDENED + 84, HARDENED + 1, HARDENED, 5]
        );
        assert_eq!(parse_path("m").unwrap(), Vec::<u32>::new());
        assert_eq!(parse_path("44h/0h").unwrap(), vec![HARDENED + 44, HARDENED]);
        assert!(parse_path("m/abc").is_err());
        assert!(parse_path("m/2147483648h").is_err());
        assert!(parse_path("m/4294967296").is_err());
        assert_eq!(path_to_string(&[HARDENED + 48, 1, 2]), "m/48h/1/2");
    }

    #[test]
    fn test_key_origin() {
        let origin: KeyOrigin = "55f8fc5d/84'/0h/0h".parse().unwrap();
        assert_eq!(origin.fingerprint, [0x55, 0xf8, 0xfc, 0x5d]);
        assert_eq!(origin.path, vec![HARDENED + 84, HARDENED, HARDENED]);
        assert_eq!(origin.to_string(), "55f8fc5d/84h/0h/0h");
        assert_eq!(KeyOrigin::parse(&origin.serialize()).unwrap(), origin);
        assert!("55f8fc/84h".parse::<KeyOrigin>().is_err());
        assert!(KeyOrigin::parse(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_detect_version() {
        let path = parse_path("m/84h/0h/0h").unwrap();
        assert_eq!(
            detect_version(&path, false, None),
            Network::Bitcoin.key_version(KeyRole::NativeSegwit, false)
        );
        let path = parse_path("m/48h/1h/0h/2h").unwrap();
        assert_eq!(
            detect_version(&path, true, None),
            Network::Testnet.key_version(KeyRole::NativeSegwitMultisig, true)
        );
    }
}
