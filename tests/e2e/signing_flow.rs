//! Coordinator-to-signer round trips.
//!
//! A coordinator builds a PSBT, each cosigner reviews and signs it on its
//! own wallet, the coordinator merges the partial signatures back and
//! finalizes. Exercises wallet loading, policy checks, change detection,
//! transport encodings and the finalizer together.

use airsign_core::bip32::{HDKey, KeyOrigin};
use airsign_core::ec::PublicKey;
use airsign_core::keys::AccountKey;
use airsign_core::networks::Network;
use airsign_core::script::{self, Script};
use airsign_psbt::finalizer;
use airsign_psbt::{
    Psbt, PsbtSigner, SignerError, Transaction, TransportEncoding, TxIn, TxOut, Wallet,
};

const MNEMONICS: [&str; 3] = [
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong",
    "olympic term tissue route sense program under choose bean emerge velvet absurd",
];

fn accounts(multisig: bool) -> Vec<AccountKey> {
    MNEMONICS
        .iter()
        .map(|words| AccountKey::from_mnemonic(words, "", Network::Testnet, multisig).unwrap())
        .collect()
}

fn multisig_descriptor(accounts: &[AccountKey]) -> String {
    let keys: Vec<String> = accounts
        .iter()
        .map(|a| format!("{}/<0;1>/*", a.key_expression()))
        .collect();
    format!("wsh(sortedmulti(2,{}))", keys.join(","))
}

fn cosigner_wallet(account: &AccountKey, descriptor: &str) -> Wallet {
    let mut wallet = Wallet::new(account.clone()).unwrap();
    wallet.load(descriptor).unwrap();
    wallet
}

fn foreign_script() -> Script {
    let key = HDKey::from_seed(&[5u8; 32], Network::Testnet.xprv()).unwrap();
    script::p2wpkh(&key.public_key())
}

/// Witness script and derivation records for `branch/index` of the wallet.
fn multisig_leg(
    accounts: &[AccountKey],
    branch: u32,
    index: u32,
) -> (Script, Vec<(PublicKey, KeyOrigin)>) {
    let mut records: Vec<(PublicKey, KeyOrigin)> = accounts
        .iter()
        .map(|a| {
            let pubkey = a.account().derive(&[branch, index]).unwrap().public_key();
            let mut path = a.derivation().to_vec();
            path.extend([branch, index]);
            (pubkey, KeyOrigin::new(a.fingerprint(), path))
        })
        .collect();
    records.sort_by(|x, y| x.0.cmp(&y.0));
    let pubkeys: Vec<PublicKey> = records.iter().map(|(k, _)| *k).collect();
    (script::multisig(2, &pubkeys).unwrap(), records)
}

/// Spends receive/0 of the 2-of-3 wallet: 70k out, 29.5k to change/1.
fn multisig_psbt(accounts: &[AccountKey], with_xpubs: bool) -> Psbt {
    let (input_ws, input_records) = multisig_leg(accounts, 0, 0);
    let (change_ws, change_records) = multisig_leg(accounts, 1, 1);

    let tx = Transaction {
        version: 2,
        inputs: vec![TxIn::new([0x77; 32], 0, 0xffff_fffd)],
        outputs: vec![
            TxOut::new(70_000, foreign_script()),
            TxOut::new(29_500, script::p2wsh(&change_ws)),
        ],
        locktime: 0,
    };
    let mut psbt = Psbt::from_transaction(&tx);
    psbt.inputs[0].witness_utxo = Some(TxOut::new(100_000, script::p2wsh(&input_ws)));
    psbt.inputs[0].witness_script = Some(input_ws);
    psbt.inputs[0].bip32_derivations.extend(input_records);
    psbt.outputs[1].witness_script = Some(change_ws);
    psbt.outputs[1].bip32_derivations.extend(change_records);
    if with_xpubs {
        for a in accounts {
            psbt.xpubs.insert(
                a.account().clone(),
                KeyOrigin::new(a.fingerprint(), a.derivation().to_vec()),
            );
        }
    }
    psbt
}

/// Copy the partial signatures of a returned PSBT into `psbt`.
fn merge(psbt: &mut Psbt, returned: &Psbt) {
    for (mine, theirs) in psbt.inputs.iter_mut().zip(&returned.inputs) {
        mine.partial_sigs
            .extend(theirs.partial_sigs.iter().map(|(k, v)| (*k, v.clone())));
    }
}

// ============================================================================
// Multisig
// ============================================================================

#[test]
fn test_multisig_two_cosigners_sign_and_finalize() {
    let accounts = accounts(true);
    let descriptor = multisig_descriptor(&accounts);
    let mut psbt = multisig_psbt(&accounts, true);

    for account in &accounts[..2] {
        let wallet = cosigner_wallet(account, &descriptor);
        let mut signer = PsbtSigner::new(&wallet, psbt.to_base64().as_bytes()).unwrap();
        assert_eq!(signer.encoding(), TransportEncoding::Base64);
        assert_eq!(signer.policy(), wallet.policy().unwrap());

        let summary = signer.outputs().unwrap();
        assert_eq!(summary.spends.len(), 1);
        assert_eq!(summary.spends[0].value, 70_000);
        assert!(summary.spends[0].address.starts_with("tb1q"));
        assert_eq!(summary.change, 29_500);
        assert_eq!(summary.fee, 500);

        assert_eq!(signer.sign().unwrap(), 1);
        let returned =
            Psbt::from_base64(std::str::from_utf8(&signer.psbt_bytes()).unwrap()).unwrap();
        assert!(returned.inputs[0].witness_script.is_none());
        merge(&mut psbt, &returned);
    }
    assert_eq!(psbt.inputs[0].partial_sigs.len(), 2);

    let tx = finalizer::finalize(&psbt, false).unwrap();
    let witness = &tx.inputs[0].witness.items;
    assert_eq!(witness.len(), 4);
    assert!(witness[0].is_empty());
    assert_eq!(
        witness[3],
        psbt.inputs[0].witness_script.as_ref().unwrap().as_bytes()
    );
    assert_eq!(tx.txid(), psbt.tx().txid());
}

#[test]
fn test_one_signature_is_not_enough() {
    let accounts = accounts(true);
    let descriptor = multisig_descriptor(&accounts);
    let wallet = cosigner_wallet(&accounts[2], &descriptor);
    let mut signer = PsbtSigner::new(&wallet, &multisig_psbt(&accounts, true).serialize()).unwrap();
    assert_eq!(signer.encoding(), TransportEncoding::Binary);
    signer.sign().unwrap();

    assert!(signer.finalize(false).is_err());
    let partial = signer.finalize(true).unwrap();
    // empty, one signature, witness script
    assert_eq!(partial.inputs[0].witness.items.len(), 3);
}

#[test]
fn test_descriptor_supplies_missing_xpubs() {
    let accounts = accounts(true);
    let descriptor = multisig_descriptor(&accounts);
    let psbt = multisig_psbt(&accounts, false);

    let wallet = cosigner_wallet(&accounts[1], &descriptor);
    let signer = PsbtSigner::new(&wallet, &psbt.serialize()).unwrap();
    assert_eq!(signer.xpubs().unwrap().len(), 3);
    assert_eq!(signer.outputs().unwrap().change, 29_500);

    let unloaded = Wallet::new(accounts[1].clone()).unwrap();
    assert_eq!(
        PsbtSigner::new(&unloaded, &psbt.serialize()).err(),
        Some(SignerError::MissingXpubs)
    );
}

#[test]
fn test_other_multisig_wallet_rejected() {
    let accounts = accounts(true);
    let psbt = multisig_psbt(&accounts, true);

    // same cosigner in a 2-of-2 with only the first two keys
    let other = multisig_descriptor(&accounts[..2]);
    let wallet = cosigner_wallet(&accounts[0], &other);
    assert_eq!(
        PsbtSigner::new(&wallet, &psbt.serialize()).err(),
        Some(SignerError::PolicyMismatch)
    );

    let single = Wallet::new(AccountKey::from_mnemonic(MNEMONICS[0], "", Network::Testnet, false).unwrap())
        .unwrap();
    assert_eq!(
        PsbtSigner::new(&single, &psbt.serialize()).err(),
        Some(SignerError::MultisigTx)
    );
}

// ============================================================================
// Single-sig
// ============================================================================

fn single_sig_psbt(account: &AccountKey) -> Psbt {
    let leg = |branch: u32, index: u32| {
        let pubkey = account
            .account()
            .derive(&[branch, index])
            .unwrap()
            .public_key();
        let mut path = account.derivation().to_vec();
        path.extend([branch, index]);
        (pubkey, KeyOrigin::new(account.fingerprint(), path))
    };
    let (input_key, input_origin) = leg(0, 4);
    let (change_key, change_origin) = leg(1, 2);

    let tx = Transaction {
        version: 2,
        inputs: vec![
            TxIn::new([0x21; 32], 0, 0xffff_fffd),
            TxIn::new([0x22; 32], 3, 0xffff_fffd),
        ],
        outputs: vec![
            TxOut::new(10_000, foreign_script()),
            TxOut::new(8_800, script::p2wpkh(&change_key)),
        ],
        locktime: 0,
    };
    let mut psbt = Psbt::from_transaction(&tx);
    for input in psbt.inputs.iter_mut() {
        input.witness_utxo = Some(TxOut::new(10_000, script::p2wpkh(&input_key)));
        input.bip32_derivations.insert(input_key, input_origin.clone());
    }
    psbt.outputs[1]
        .bip32_derivations
        .insert(change_key, change_origin);
    psbt
}

#[test]
fn test_single_sig_json_wallet_hex_transport() {
    let account = AccountKey::from_mnemonic(MNEMONICS[2], "", Network::Testnet, false).unwrap();
    let wallet_json = format!(
        r#"{{"label": "Spending", "descriptor": "wpkh({}/<0;1>/*)"}}"#,
        account.key_expression()
    );
    let mut wallet = Wallet::new(account.clone()).unwrap();
    wallet.load(&wallet_json).unwrap();
    assert_eq!(wallet.label(), Some("Spending"));
    assert!(wallet.is_loaded());

    let psbt = single_sig_psbt(&account);
    let mut signer = PsbtSigner::new(&wallet, psbt.to_hex().as_bytes()).unwrap();
    assert_eq!(signer.encoding(), TransportEncoding::Hex);

    let summary = signer.outputs().unwrap();
    assert_eq!(summary.change, 8_800);
    assert_eq!(summary.fee, 1_200);

    assert_eq!(signer.sign().unwrap(), 2);
    let returned = Psbt::from_hex(std::str::from_utf8(&signer.psbt_bytes()).unwrap()).unwrap();
    assert!(returned.inputs.iter().all(|i| i.partial_sigs.len() == 1));

    let tx = signer.finalize(false).unwrap();
    for input in &tx.inputs {
        assert!(input.script_sig.is_empty());
        assert_eq!(input.witness.items.len(), 2);
    }
}

#[test]
fn test_reencode_for_return() {
    let account = AccountKey::from_mnemonic(MNEMONICS[0], "", Network::Testnet, false).unwrap();
    let wallet = Wallet::new(account.clone()).unwrap();
    let psbt = single_sig_psbt(&account);

    let mut signer = PsbtSigner::new(&wallet, &psbt.serialize()).unwrap();
    signer.sign().unwrap();
    signer.set_encoding(TransportEncoding::Base64);
    let text = String::from_utf8(signer.psbt_bytes()).unwrap();
    assert!(text.starts_with("cHNidP8"));
}

#[test]
fn test_wrong_seed_cannot_sign() {
    let owner = AccountKey::from_mnemonic(MNEMONICS[0], "", Network::Testnet, false).unwrap();
    let psbt = single_sig_psbt(&owner);

    // same words, different passphrase: a different root fingerprint
    let stranger = AccountKey::from_mnemonic(MNEMONICS[0], "TREZOR", Network::Testnet, false).unwrap();
    let wallet = Wallet::new(stranger).unwrap();
    let mut signer = PsbtSigner::new(&wallet, &psbt.serialize()).unwrap();
    assert_eq!(signer.outputs().unwrap().change, 0);
    assert_eq!(signer.sign(), Err(SignerError::CannotSign));
}
