//! Thin adapter over libsecp256k1.
//!
//! The signer only needs a handful of curve operations: key creation and
//! SEC (de)serialization, ECDSA sign/verify and scalar/point tweak-add.
//! All of them go through the process-wide `SECP256K1` context.

use std::cmp::Ordering;
use std::fmt;

use secp256k1::{ecdsa, Message, Scalar, SecretKey, SECP256K1};
use thiserror::Error;

use crate::encode::{base58_decode_check, base58_encode_check};
use crate::hashes::hash160;
use crate::networks::{Network, ALL_NETWORKS};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EcError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid DER signature")]
    InvalidSignature,
    #[error("Tweak is out of range")]
    TweakOutOfRange,
    #[error("Invalid WIF: {0}")]
    InvalidWif(String),
}

/// A secp256k1 point plus its preferred SEC encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    inner: secp256k1::PublicKey,
    compressed: bool,
}

impl PublicKey {
    /// Parse a 33-byte compressed or 65-byte uncompressed SEC encoding.
    pub fn parse(sec: &[u8]) -> Result<Self, EcError> {
        let inner = secp256k1::PublicKey::from_slice(sec).map_err(|_| EcError::InvalidPublicKey)?;
        Ok(Self {
            inner,
            compressed: sec.len() == 33,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// SEC serialization honoring the compressed flag.
    pub fn sec(&self) -> Vec<u8> {
        if self.compressed {
            self.inner.serialize().to_vec()
        } else {
            self.inner.serialize_uncompressed().to_vec()
        }
    }

    pub fn compressed_sec(&self) -> [u8; 33] {
        self.inner.serialize()
    }

    pub fn hash160(&self) -> [u8; 20] {
        hash160(&self.sec())
    }

    /// `self + tweak * G`
    pub fn tweak_add(&self, tweak: &[u8; 32]) -> Result<Self, EcError> {
        let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| EcError::TweakOutOfRange)?;
        let inner = self
            .inner
            .add_exp_tweak(SECP256K1, &scalar)
            .map_err(|_| EcError::TweakOutOfRange)?;
        Ok(Self {
            inner,
            compressed: self.compressed,
        })
    }

    pub fn verify(&self, sig: &Signature, msg: &[u8; 32]) -> bool {
        let msg = Message::from_digest(*msg);
        let mut normalized = sig.0;
        normalized.normalize_s();
        SECP256K1.verify_ecdsa(&msg, &normalized, &self.inner).is_ok()
    }

    pub fn as_inner(&self) -> &secp256k1::PublicKey {
        &self.inner
    }
}

impl From<secp256k1::PublicKey> for PublicKey {
    fn from(inner: secp256k1::PublicKey) -> Self {
        Self {
            inner,
            compressed: true,
        }
    }
}

// Ordered by serialized bytes so sorted key lists match sortedmulti order.
impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec().cmp(&other.sec())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.sec()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

/// A 32-byte secret scalar.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrivateKey {
    secret: SecretKey,
    compressed: bool,
}

impl PrivateKey {
    pub fn from_bytes(secret: &[u8]) -> Result<Self, EcError> {
        let secret = SecretKey::from_slice(secret).map_err(|_| EcError::InvalidPrivateKey)?;
        Ok(Self {
            secret,
            compressed: true,
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: secp256k1::PublicKey::from_secret_key(SECP256K1, &self.secret),
            compressed: self.compressed,
        }
    }

    /// `(self + tweak) mod n`
    pub fn tweak_add(&self, tweak: &[u8; 32]) -> Result<Self, EcError> {
        let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| EcError::TweakOutOfRange)?;
        let secret = self
            .secret
            .add_tweak(&scalar)
            .map_err(|_| EcError::TweakOutOfRange)?;
        Ok(Self {
            secret,
            compressed: self.compressed,
        })
    }

    /// Deterministic (RFC6979) low-S ECDSA signature over a 32-byte digest.
    pub fn sign(&self, msg: &[u8; 32]) -> Signature {
        let msg = Message::from_digest(*msg);
        Signature(SECP256K1.sign_ecdsa(&msg, &self.secret))
    }

    pub fn to_wif(&self, network: Network) -> String {
        let mut data = Vec::with_capacity(34);
        data.push(network.wif_prefix());
        data.extend_from_slice(&self.secret.secret_bytes());
        if self.compressed {
            data.push(0x01);
        }
        base58_encode_check(&data)
    }

    /// Decode a WIF string; the network is inferred from its prefix.
    pub fn from_wif(wif: &str) -> Result<(Self, Network), EcError> {
        let data = base58_decode_check(wif).map_err(|e| EcError::InvalidWif(e.to_string()))?;
        let compressed = match data.len() {
            33 => false,
            34 if data[33] == 0x01 => true,
            _ => return Err(EcError::InvalidWif("bad length".into())),
        };
        let network = ALL_NETWORKS
            .into_iter()
            .find(|n| n.wif_prefix() == data[0])
            .ok_or_else(|| EcError::InvalidWif(format!("unknown prefix {:#04x}", data[0])))?;
        let secret = SecretKey::from_slice(&data[1..33]).map_err(|_| EcError::InvalidPrivateKey)?;
        Ok((Self { secret, compressed }, network))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// ECDSA signature, DER encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(ecdsa::Signature);

impl Signature {
    pub fn from_der(der: &[u8]) -> Result<Self, EcError> {
        ecdsa::Signature::from_der(der)
            .map(Signature)
            .map_err(|_| EcError::InvalidSignature)
    }

    pub fn to_der(&self) -> Vec<u8> {
        self.0.serialize_der().to_vec()
    }
}
