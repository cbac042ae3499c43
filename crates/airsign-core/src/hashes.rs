//! Hash helpers over `bitcoin::hashes`.
//!
//! Every digest used by the signer returns a plain byte array so callers
//! never depend on the hash newtypes.

use bitcoin::hashes::{hash160, ripemd160, sha256, sha256d, sha512, Hash, HashEngine, Hmac, HmacEngine};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).to_byte_array()
}

/// SHA256(SHA256(data)), the digest behind txids, sighashes and Base58Check.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    ripemd160::Hash::hash(data).to_byte_array()
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}

pub fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut engine = HmacEngine::<sha512::Hash>::new(key);
    engine.input(data);
    Hmac::from_engine(engine).to_byte_array()
}
