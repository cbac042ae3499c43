//! Published reference vectors run through the public APIs.
//!
//! Covers:
//! 1. BIP-32 test vector 1
//! 2. BIP-84 account, zpub and first addresses
//! 3. BIP-380 descriptor checksums on wallet descriptors
//! 4. BIP-143 native P2WPKH digest and signature through a PSBT
//! 5. A 2-of-2 P2WSH multisig wallet and its addresses

use airsign_core::bip32::HDKey;
use airsign_core::ec::PrivateKey;
use airsign_core::keys::AccountKey;
use airsign_core::networks::Network;
use airsign_core::script::{self, Script};
use airsign_descriptor::checksum::add_checksum;
use airsign_descriptor::{Descriptor, ScriptKind};
use airsign_psbt::{Psbt, SighashType, SignOptions, SigningKey, Transaction, TxOut, Wallet};

const ABANDON: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const ZOO: &str = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";

// ============================================================================
// 1. BIP-32
// ============================================================================

/// BIP-32 test vector 1.
#[test]
fn test_bip32_vector_1() {
    let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
    let master = HDKey::from_seed(&seed, Network::Bitcoin.xprv()).unwrap();

    assert_eq!(
        master.to_base58(),
        "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
    );
    assert_eq!(
        master.to_public().unwrap().to_base58(),
        "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
    );
    assert_eq!(hex::encode(master.fingerprint()), "3442193e");

    let cases = [
        (
            "m/0h",
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw",
        ),
        (
            "m/0h/1/2h/2/1000000000",
            "xpub6H1LXWLaKsWFhvm6RVpEL9P4KfRZSW7abD2ttkWP3SSQvnyA8FSVqNTEcYFgJS2UaFcxupHiYkro49S8yGasTvXEYBVPamhGW6cFJodrTHy",
        ),
    ];
    for (path, xpub) in cases {
        let child = master.derive_path(path).unwrap();
        assert_eq!(child.to_public().unwrap().to_base58(), xpub, "{}", path);
    }

    // public derivation of the non-hardened tail matches private derivation
    let hardened = master.derive_path("m/0h").unwrap().to_public().unwrap();
    let via_public = hardened.derive_path("m/1").unwrap();
    let via_private = master.derive_path("m/0h/1").unwrap().to_public().unwrap();
    assert_eq!(via_public.to_base58(), via_private.to_base58());
}

// ============================================================================
// 2. BIP-84
// ============================================================================

/// BIP-84 reference mnemonic, account 0.
#[test]
fn test_bip84_account() {
    let key = AccountKey::from_mnemonic(ABANDON, "", Network::Bitcoin, false).unwrap();
    assert_eq!(hex::encode(key.fingerprint()), "73c5da0a");
    assert_eq!(
        key.xpub(),
        "xpub6CatWdiZiodmUeTDp8LT5or8nmbKNcuyvz7WyksVFkKB4RHwCD3XyuvPEbvqAQY3rAPshWcMLoP2fMFMKHPJ4ZeZXYVUhLv1VMrjPC7PW6V"
    );
    assert_eq!(
        key.slip132_xpub(),
        "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs"
    );

    let first = key.account().derive_path("m/0/0").unwrap().public_key();
    assert_eq!(
        hex::encode(first.sec()),
        "0330d54fd0dd420a6e5f8d3624f5f3482cae350f79d5f0753bf5beef9c2d91af3c"
    );
}

#[test]
fn test_bip84_wallet_addresses() {
    let key = AccountKey::from_mnemonic(ABANDON, "", Network::Bitcoin, false).unwrap();
    let wallet = Wallet::new(key).unwrap();

    let receive: Vec<String> = wallet
        .addresses(0, Some(1), 0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(receive, vec!["bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"]);

    let change = wallet.addresses(0, Some(1), 1).unwrap().next().unwrap().unwrap();
    assert_eq!(change, "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el");
}

// ============================================================================
// 3. Descriptor checksums
// ============================================================================

#[test]
fn test_default_wallet_descriptor_checksum() {
    let key = AccountKey::from_mnemonic(ABANDON, "", Network::Bitcoin, false).unwrap();
    let wallet = Wallet::new(key).unwrap();
    assert_eq!(
        wallet.descriptor().unwrap().to_string(),
        "wpkh([73c5da0a/84h/0h/0h]xpub6CatWdiZiodmUeTDp8LT5or8nmbKNcuyvz7WyksVFkKB4RHwCD3XyuvPEbvqAQY3rAPshWcMLoP2fMFMKHPJ4ZeZXYVUhLv1VMrjPC7PW6V/<0;1>/*)#qf45pmyh"
    );
}

#[test]
fn test_multisig_descriptor_checksum() {
    let body = multisig_descriptor();
    assert_eq!(
        add_checksum(&body).unwrap(),
        format!("{}#h5gmmm94", body)
    );
    let parsed = Descriptor::parse(&format!("{}#h5gmmm94", body)).unwrap();
    assert_eq!(parsed.without_checksum(), body);
    assert!(Descriptor::parse(&format!("{}#h5gmmm95", body)).is_err());
}

// ============================================================================
// 4. BIP-143
// ============================================================================

/// BIP-143 "native P2WPKH" example: the second input is signed through a
/// PSBT with the published private key.
#[test]
fn test_bip143_native_p2wpkh_signature() {
    let unsigned = "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000";
    let tx = Transaction::parse(&hex::decode(unsigned).unwrap()).unwrap();
    let private = PrivateKey::from_bytes(
        &hex::decode("619c335025c7f4012e556c2a58b2506e30b8511b53ade95ea316fd8c3286feb9").unwrap(),
    )
    .unwrap();
    let pubkey = private.public_key();
    assert_eq!(
        hex::encode(pubkey.sec()),
        "025476c2e83188368da1ff3e292e7acafcdb3566bb0ad253f62fc70f07aeee6357"
    );

    let mut psbt = Psbt::from_transaction(&tx);
    let p2pk = Script::new(
        hex::decode("2103c9f4836b9a4f77fc0d81f7bcb01b7f1b35916864b9476c241ce9fc198bd25432ac")
            .unwrap(),
    );
    psbt.inputs[0].witness_utxo = Some(TxOut::new(625_000_000, p2pk));
    psbt.inputs[1].witness_utxo = Some(TxOut::new(600_000_000, script::p2wpkh(&pubkey)));

    assert_eq!(
        hex::encode(psbt.sighash(1, SighashType::ALL).unwrap()),
        "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
    );

    let added = psbt
        .sign_with(SigningKey::Single(&private), SignOptions::default())
        .unwrap();
    assert_eq!(added, 1);
    assert!(psbt.inputs[0].partial_sigs.is_empty());
    assert_eq!(
        hex::encode(&psbt.inputs[1].partial_sigs[&pubkey]),
        "304402203609e17b84f6a7d30c80bfa610b5b4542f32a8a0d5447a12fb1366d7f01cc44a0220573a954c4518331561406f90300e8f3358f51928d43c212a8caed02de67eebee01"
    );
}

// ============================================================================
// 5. Multisig wallet
// ============================================================================

fn multisig_descriptor() -> String {
    let a = AccountKey::from_mnemonic(ABANDON, "", Network::Bitcoin, true).unwrap();
    let b = AccountKey::from_mnemonic(ZOO, "", Network::Bitcoin, true).unwrap();
    format!(
        "wsh(sortedmulti(2,{}/<0;1>/*,{}/<0;1>/*))",
        a.key_expression(),
        b.key_expression()
    )
}

#[test]
fn test_multisig_account_keys() {
    let a = AccountKey::from_mnemonic(ABANDON, "", Network::Bitcoin, true).unwrap();
    assert_eq!(
        a.key_expression(),
        "[73c5da0a/48h/0h/0h/2h]xpub6DkFAXWQ2dHxq2vatrt9qyA3bXYU4ToWQwCHbf5XB2mSTexcHZCeKS1VZYcPoBd5X8yVcbXFHJR9R8UCVpt82VX1VhR28mCyxUFL4r6KFrf"
    );
    assert_eq!(
        a.slip132_xpub(),
        "Zpub74Jru6aftwwHxCUCWEvP6DgrfFsdA4U6ZRtQ5i8qJpMcC39yZGv3egBhQfV3MS9pZtH5z8iV5qWkJsK6ESs6mSzt4qvGhzJxPeeVS2e1zUG"
    );
    let b = AccountKey::from_mnemonic(ZOO, "", Network::Bitcoin, true).unwrap();
    assert_eq!(hex::encode(b.fingerprint()), "3f635a63");
}

#[test]
fn test_multisig_wallet_addresses() {
    let key = AccountKey::from_mnemonic(ZOO, "", Network::Bitcoin, true).unwrap();
    let mut wallet = Wallet::new(key).unwrap();
    assert!(!wallet.is_loaded());
    wallet.load(&multisig_descriptor()).unwrap();

    let policy = wallet.policy().unwrap();
    assert_eq!(policy.kind, ScriptKind::P2wsh);
    let multisig = policy.multisig.as_ref().unwrap();
    assert_eq!((multisig.m, multisig.n), (2, 2));
    assert_eq!(wallet.label(), Some("2 of 2 multisig"));

    let receive: Vec<String> = wallet
        .addresses(0, Some(2), 0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        receive,
        vec![
            "bc1qkpcfs6lhqh3rx63we7435nf3hqpghkdtmmmvln0yrssv0ulhmngs92dens",
            "bc1qp3z0f9m2yzgax82hw88jaqznsca2gtktnyuvmh4uwzlsg4736y8s2qes5n",
        ]
    );
    let change = wallet.addresses(0, Some(1), 1).unwrap().next().unwrap().unwrap();
    assert_eq!(
        change,
        "bc1qejpmz7hjqlprc6yc852r685wlu3vm9hkf47nw6axqqcareyg6keq0jsuuc"
    );
}
