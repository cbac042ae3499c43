//! Finalized transactions checked by the consensus script interpreter.
//!
//! Signs and finalizes every supported script type, then runs the result
//! through libbitcoinconsensus. Sighashes and BIP-32 derivation are also
//! cross-checked against rust-bitcoin.
//!
//! Run with: cargo test --test consensus_verify

use airsign_core::bip32::{HDKey, KeyOrigin};
use airsign_core::ec::PublicKey;
use airsign_core::networks::Network;
use airsign_core::script::{self, Script};
use airsign_psbt::finalizer;
use airsign_psbt::{
    Psbt, SighashType, SignOptions, SigningKey, Transaction, TxIn, TxOut,
};
use bitcoin::hashes::Hash;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use std::str::FromStr;

/// Consensus-verify every input of a transaction using libbitcoinconsensus.
fn consensus_verify(tx: &Transaction, spent_outputs: &[TxOut]) {
    let tx_bytes = tx.serialize();
    let all_utxos: Vec<bitcoinconsensus::Utxo> = spent_outputs
        .iter()
        .map(|o| {
            let sb = o.script_pubkey.as_bytes();
            bitcoinconsensus::Utxo {
                script_pubkey: sb.as_ptr(),
                script_pubkey_len: sb.len() as u32,
                value: o.value as i64,
            }
        })
        .collect();

    for (input_index, txout) in spent_outputs.iter().enumerate() {
        let result = bitcoinconsensus::verify(
            txout.script_pubkey.as_bytes(),
            txout.value,
            &tx_bytes,
            Some(&all_utxos),
            input_index,
        );
        assert!(
            result.is_ok(),
            "consensus verification failed for input {}: {:?}",
            input_index,
            result.err()
        );
    }
}

fn roots() -> Vec<HDKey> {
    (1u8..=3)
        .map(|b| HDKey::from_seed(&[b; 32], Network::Bitcoin.xprv()).unwrap())
        .collect()
}

fn child_key(root: &HDKey) -> PublicKey {
    root.derive(&[0]).unwrap().public_key()
}

fn record(psbt: &mut Psbt, root: &HDKey) {
    psbt.inputs[0]
        .bip32_derivations
        .insert(child_key(root), KeyOrigin::new(root.fingerprint(), vec![0]));
}

/// One input spending `[0x42; 32]:0`, one output; 1000 sat fee.
fn spending_tx(prev_txid: [u8; 32]) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TxIn::new(prev_txid, 0, 0xffff_fffd)],
        outputs: vec![TxOut::new(
            49_000,
            script::p2wpkh(&child_key(&roots()[2])),
        )],
        locktime: 0,
    }
}

/// A funding transaction whose first output is `spk`.
fn funding_tx(spk: Script) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new([0x10; 32], 0, 0xffff_ffff)],
        outputs: vec![TxOut::new(50_000, spk)],
        locktime: 0,
    }
}

fn sign_all(psbt: &mut Psbt, roots: &[HDKey]) {
    sign_all_with(psbt, roots, SignOptions::default(), 1);
}

fn sign_all_with(psbt: &mut Psbt, roots: &[HDKey], options: SignOptions, expected: usize) {
    for root in roots {
        let added = psbt.sign_with(SigningKey::Hd(root), options).unwrap();
        assert_eq!(added, expected);
    }
}

fn finalize_and_verify(psbt: &Psbt) -> Transaction {
    let spent = psbt.utxo(0).unwrap();
    let tx = finalizer::finalize(psbt, false).unwrap();
    consensus_verify(&tx, &[spent]);
    tx
}

// ============================================================================
// Script types
// ============================================================================

#[test]
fn test_p2wpkh_spend_is_valid() {
    let roots = roots();
    let spk = script::p2wpkh(&child_key(&roots[0]));
    let mut psbt = Psbt::from_transaction(&spending_tx([0x42; 32]));
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, spk));
    record(&mut psbt, &roots[0]);

    sign_all(&mut psbt, &roots[..1]);
    let tx = finalize_and_verify(&psbt);
    assert!(tx.inputs[0].script_sig.is_empty());
}

#[test]
fn test_p2sh_p2wpkh_spend_is_valid() {
    let roots = roots();
    let redeem = script::p2wpkh(&child_key(&roots[0]));
    let mut psbt = Psbt::from_transaction(&spending_tx([0x42; 32]));
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, script::p2sh(&redeem)));
    psbt.inputs[0].redeem_script = Some(redeem);
    record(&mut psbt, &roots[0]);

    sign_all(&mut psbt, &roots[..1]);
    let tx = finalize_and_verify(&psbt);
    assert!(!tx.inputs[0].script_sig.is_empty());
    assert_eq!(tx.inputs[0].witness.items.len(), 2);
}

#[test]
fn test_p2pkh_spend_is_valid() {
    let roots = roots();
    let prev = funding_tx(script::p2pkh(&child_key(&roots[0])));
    let mut psbt = Psbt::from_transaction(&spending_tx(prev.txid()));
    psbt.inputs[0].non_witness_utxo = Some(prev);
    record(&mut psbt, &roots[0]);

    sign_all(&mut psbt, &roots[..1]);
    let tx = finalize_and_verify(&psbt);
    assert!(!tx.is_segwit());
}

#[test]
fn test_p2wsh_multisig_spend_is_valid() {
    let roots = roots();
    let pubkeys: Vec<PublicKey> = roots.iter().map(child_key).collect();
    let ws = script::multisig(2, &pubkeys).unwrap();
    let mut psbt = Psbt::from_transaction(&spending_tx([0x42; 32]));
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, script::p2wsh(&ws)));
    psbt.inputs[0].witness_script = Some(ws);
    for root in &roots {
        record(&mut psbt, root);
    }

    // the second and third keys sign, out of script order
    sign_all(&mut psbt, &[roots[2].clone(), roots[1].clone()]);
    finalize_and_verify(&psbt);
}

#[test]
fn test_p2sh_p2wsh_multisig_spend_is_valid() {
    let roots = roots();
    let pubkeys: Vec<PublicKey> = roots.iter().map(child_key).collect();
    let ws = script::multisig(2, &pubkeys).unwrap();
    let redeem = script::p2wsh(&ws);
    let mut psbt = Psbt::from_transaction(&spending_tx([0x42; 32]));
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, script::p2sh(&redeem)));
    psbt.inputs[0].redeem_script = Some(redeem);
    psbt.inputs[0].witness_script = Some(ws);
    for root in &roots {
        record(&mut psbt, root);
    }

    sign_all(&mut psbt, &roots[..2]);
    finalize_and_verify(&psbt);
}

#[test]
fn test_legacy_p2sh_multisig_spend_is_valid() {
    let roots = roots();
    let pubkeys: Vec<PublicKey> = roots[..2].iter().map(child_key).collect();
    let redeem = script::multisig(2, &pubkeys).unwrap();
    let prev = funding_tx(script::p2sh(&redeem));
    let mut psbt = Psbt::from_transaction(&spending_tx(prev.txid()));
    psbt.inputs[0].non_witness_utxo = Some(prev);
    psbt.inputs[0].redeem_script = Some(redeem);
    for root in &roots[..2] {
        record(&mut psbt, root);
    }

    sign_all(&mut psbt, &roots[..2]);
    let tx = finalize_and_verify(&psbt);
    assert!(!tx.is_segwit());
}

#[test]
fn test_anyonecanpay_signature_is_valid() {
    let roots = roots();
    let spk = script::p2wpkh(&child_key(&roots[0]));
    let mut psbt = Psbt::from_transaction(&spending_tx([0x42; 32]));
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, spk));
    psbt.inputs[0].sighash_type = Some(0x81);
    record(&mut psbt, &roots[0]);

    // the default options only sign SIGHASH_ALL
    sign_all_with(&mut psbt, &roots[..1], SignOptions::default(), 0);
    let options = SignOptions {
        sighash: Some(SighashType::from_str("ALL|ANYONECANPAY").unwrap()),
        allow_sighash_override: false,
    };
    sign_all_with(&mut psbt, &roots[..1], options, 1);
    let sig = psbt.inputs[0].partial_sigs.values().next().unwrap();
    assert_eq!(sig.last(), Some(&0x81));
    finalize_and_verify(&psbt);
}

// ============================================================================
// Cross-checks against rust-bitcoin
// ============================================================================

fn all_sighash_types() -> Vec<SighashType> {
    ["ALL", "NONE", "SINGLE", "ALL|ANYONECANPAY", "NONE|ANYONECANPAY", "SINGLE|ANYONECANPAY"]
        .iter()
        .map(|s| SighashType::from_str(s).unwrap())
        .collect()
}

/// Two inputs: a p2wpkh one and a legacy p2pkh one; two outputs.
fn mixed_psbt() -> (Psbt, Script, Script) {
    let roots = roots();
    let segwit_spk = script::p2wpkh(&child_key(&roots[0]));
    let legacy_spk = script::p2pkh(&child_key(&roots[1]));
    let prev = funding_tx(legacy_spk.clone());

    let tx = Transaction {
        version: 2,
        inputs: vec![
            TxIn::new([0x42; 32], 3, 0xffff_fffd),
            TxIn::new(prev.txid(), 0, 0xffff_fffe),
        ],
        outputs: vec![
            TxOut::new(60_000, script::p2wpkh(&child_key(&roots[2]))),
            TxOut::new(38_000, Script::new(vec![0x51])),
        ],
        locktime: 800_000,
    };
    let mut psbt = Psbt::from_transaction(&tx);
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, segwit_spk.clone()));
    psbt.inputs[1].non_witness_utxo = Some(prev);
    (psbt, segwit_spk, legacy_spk)
}

#[test]
fn test_segwit_sighash_matches_rust_bitcoin() {
    let (psbt, segwit_spk, _) = mixed_psbt();
    let btx: bitcoin::Transaction =
        bitcoin::consensus::deserialize(&psbt.tx().serialize()).unwrap();
    let mut cache = SighashCache::new(&btx);
    let spk = bitcoin::ScriptBuf::from_bytes(segwit_spk.as_bytes().to_vec());

    for ty in all_sighash_types() {
        let expected = cache
            .p2wpkh_signature_hash(
                0,
                &spk,
                bitcoin::Amount::from_sat(50_000),
                EcdsaSighashType::from_consensus(ty.to_u32()),
            )
            .unwrap();
        assert_eq!(
            psbt.sighash(0, ty).unwrap(),
            expected.to_byte_array(),
            "{}",
            ty
        );
    }
}

#[test]
fn test_p2wsh_sighash_matches_rust_bitcoin() {
    let roots = roots();
    let pubkeys: Vec<PublicKey> = roots.iter().map(child_key).collect();
    let ws = script::multisig(2, &pubkeys).unwrap();
    let mut psbt = Psbt::from_transaction(&spending_tx([0x42; 32]));
    psbt.inputs[0].witness_utxo = Some(TxOut::new(50_000, script::p2wsh(&ws)));
    psbt.inputs[0].witness_script = Some(ws.clone());

    let btx: bitcoin::Transaction =
        bitcoin::consensus::deserialize(&psbt.tx().serialize()).unwrap();
    let mut cache = SighashCache::new(&btx);
    let witness_script = bitcoin::ScriptBuf::from_bytes(ws.as_bytes().to_vec());
    let expected = cache
        .p2wsh_signature_hash(
            0,
            &witness_script,
            bitcoin::Amount::from_sat(50_000),
            EcdsaSighashType::All,
        )
        .unwrap();
    assert_eq!(
        psbt.sighash(0, SighashType::ALL).unwrap(),
        expected.to_byte_array()
    );
}

#[test]
fn test_legacy_sighash_matches_rust_bitcoin() {
    let (psbt, _, legacy_spk) = mixed_psbt();
    let btx: bitcoin::Transaction =
        bitcoin::consensus::deserialize(&psbt.tx().serialize()).unwrap();
    let cache = SighashCache::new(&btx);
    let spk = bitcoin::ScriptBuf::from_bytes(legacy_spk.as_bytes().to_vec());

    for ty in all_sighash_types() {
        let expected = cache
            .legacy_signature_hash(1, &spk, ty.to_u32())
            .unwrap();
        assert_eq!(
            psbt.sighash(1, ty).unwrap(),
            expected.to_byte_array(),
            "{}",
            ty
        );
    }
}

#[test]
fn test_transaction_encoding_matches_rust_bitcoin() {
    let (psbt, _, _) = mixed_psbt();
    let tx = psbt.tx();
    let btx: bitcoin::Transaction = bitcoin::consensus::deserialize(&tx.serialize()).unwrap();
    assert_eq!(btx.compute_txid().to_string(), tx.txid_hex());
    assert_eq!(bitcoin::consensus::serialize(&btx), tx.serialize());
}

#[test]
fn test_bip32_matches_rust_bitcoin() {
    use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};

    let secp = bitcoin::secp256k1::Secp256k1::new();
    let seed = [0x5au8; 64];
    let master = Xpriv::new_master(bitcoin::Network::Bitcoin, &seed).unwrap();
    let ours = HDKey::from_seed(&seed, Network::Bitcoin.xprv()).unwrap();
    assert_eq!(ours.to_base58(), master.to_string());

    for path in ["m/84'/0'/0'", "m/48'/0'/0'/2'/0/7", "m/0/1/2147483647'"] {
        let derived = master
            .derive_priv(&secp, &DerivationPath::from_str(path).unwrap())
            .unwrap();
        let expected = Xpub::from_priv(&secp, &derived).to_string();
        let child = ours.derive_path(path).unwrap();
        assert_eq!(child.to_base58(), derived.to_string(), "{}", path);
        assert_eq!(child.to_public().unwrap().to_base58(), expected, "{}", path);
    }
}
