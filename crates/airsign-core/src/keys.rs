//! Account keys derived from a mnemonic
//!
//! Single-sig wallets use BIP-84 (`m/84'/coin'/0'`), multisig wallets use
//! BIP-48 native segwit (`m/48'/coin'/0'/2'`).

use thiserror::Error;

use crate::bip32::{path_to_string, HDKey, HdError, HARDENED};
use crate::networks::{KeyRole, Network};
use crate::seed::{root_key, SeedError};

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Derivation failed: {0}")]
    DerivationFailed(#[from] HdError),
    #[error(transparent)]
    Seed(#[from] SeedError),
}

/// BIP-84 account path for `network`.
pub fn single_sig_path(network: Network) -> Vec<u32> {
    vec![HARDENED + 84, HARDENED + network.coin_type(), HARDENED]
}

/// BIP-48 p2wsh account path for `network`.
pub fn multisig_path(network: Network) -> Vec<u32> {
    vec![
        HARDENED + 48,
        HARDENED + network.coin_type(),
        HARDENED,
        HARDENED + 2,
    ]
}

/// The signer's root key together with its account-level xpub.
#[derive(Debug, Clone)]
pub struct AccountKey {
    root: HDKey,
    network: Network,
    multisig: bool,
    derivation: Vec<u32>,
    account: HDKey,
}

impl AccountKey {
    pub fn from_mnemonic(
        words: &str,
        passphrase: &str,
        network: Network,
        multisig: bool,
    ) -> Result<Self, KeyError> {
        let root = root_key(words, passphrase, network.xprv())?;
        Self::from_root(root, network, multisig)
    }

    pub fn from_root(root: HDKey, network: Network, multisig: bool) -> Result<Self, KeyError> {
        let derivation = if multisig {
            multisig_path(network)
        } else {
            single_sig_path(network)
        };
        let account = root.derive(&derivation)?.to_public()?;
        log::debug!(
            "account key {} at {}",
            hex::encode(root.fingerprint()),
            path_to_string(&derivation)
        );
        Ok(Self {
            root,
            network,
            multisig,
            derivation,
            account,
        })
    }

    pub fn root(&self) -> &HDKey {
        &self.root
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn is_multisig(&self) -> bool {
        self.multisig
    }

    /// Master key fingerprint.
    pub fn fingerprint(&self) -> [u8; 4] {
        self.root.fingerprint()
    }

    pub fn derivation(&self) -> &[u32] {
        &self.derivation
    }

    /// Account xpub (tpub on test networks).
    pub fn account(&self) -> &HDKey {
        &self.account
    }

    pub fn xpub(&self) -> String {
        self.account.to_base58()
    }

    /// Account xpub re-encoded with its SLIP-132 version (zpub or Zpub).
    pub fn slip132_xpub(&self) -> String {
        let role = if self.multisig {
            KeyRole::NativeSegwitMultisig
        } else {
            KeyRole::NativeSegwit
        };
        self.account
            .to_base58_with_version(self.network.key_version(role, false))
    }

    /// `[fingerprint/path]xpub`, the key expression used in descriptors.
    pub fn key_expression(&self) -> String {
        self.origin_prefix() + &self.xpub()
    }

    pub fn slip132_key_expression(&self) -> String {
        self.origin_prefix() + &self.slip132_xpub()
    }

    fn origin_prefix(&self) -> String {
        let path = path_to_string(&self.derivation);
        format!(
            "[{}{}]",
            hex::encode(self.fingerprint()),
            path.strip_prefix('m').unwrap_or(&path)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str =
        "olympic term tissue route sense program under choose bean emerge velvet absurd";

    #[test]
    fn test_testnet_single_sig() {
        let key = AccountKey::from_mnemonic(MNEMONIC, "", Network::Testnet, false).unwrap();
        assert_eq!(
            key.root().to_base58(),
            "tprv8ZgxMBicQKsPfJtsjGcMm6f7ibxmy2LbqbePeCJnhE3tFNKfuWmNHUyMnAfgwQXDSAhfTLGvN4f8zjEFochGbnHiZcrGXnyHDKQaTRK5trx"
        );
        assert_eq!(hex::encode(key.fingerprint()), "55f8fc5d");
        assert_eq!(
            key.xpub(),
            "tpubDCDuqu5HtBX2aD7wxvnHcj1DgFN1UVgzLkA1Ms4Va4P7TpJ3jDknkPLwWT2SqrKXNNAtJBCPcbJ8Tcpm6nLxgFapCZyhKgqwcEGv1BVpD7s"
        );
        assert_eq!(
            key.slip132_xpub(),
            "vpub5YBkiKumsYUcbpYrr2DwzdUr1ByTbsCvxtXGSXDaU8sTcKzt9gaaMpMqE12VKY4SmBQNBeVQAAkyzs72GXfhCLmKQHqYULYjUpZDU4Y7tv6"
        );
        assert_eq!(
            key.key_expression(),
            "[55f8fc5d/84h/1h/0h]tpubDCDuqu5HtBX2aD7wxvnHcj1DgFN1UVgzLkA1Ms4Va4P7TpJ3jDknkPLwWT2SqrKXNNAtJBCPcbJ8Tcpm6nLxgFapCZyhKgqwcEGv1BVpD7s"
        );
    }

    #[test]
    fn test_testnet_multisig() {
        let key = AccountKey::from_mnemonic(MNEMONIC, "", Network::Testnet, true).unwrap();
        assert_eq!(
            key.xpub(),
            "tpubDDyrxYEe6bifecFTgj8vzsoUhoJmtVWeARR5xRun6haVnVrC2oTAYhj7Ja2KTkcnkW1mZPPuWGDxEsHMtRf8aAf4WfrqhLDN7xi9zAZMphv"
        );
        assert_eq!(
            key.slip132_xpub(),
            "Vpub5j5qqZeDSW2z2PiEnggvphpeiz1ipDtXHAAwMnV7quhsEWZnv5xrSwDm2hyxsyHLzeUM4EVX3P9V82inZkpeLpszEkwwsk1jNYq63ygjZ6V"
        );
    }

    #[test]
    fn test_mainnet_accounts() {
        let single = AccountKey::from_mnemonic(MNEMONIC, "", Network::Bitcoin, false).unwrap();
        assert_eq!(
            single.root().to_base58(),
            "xprv9s21ZrQH143K4VfM4hkrbT38QUYZjWJbW3jGmmtLDFZQTmaav9RcmjburzW2w38u4jAtTEfACi5LXsgWgQMKnj282ydxsSFEJDfA1o1TySf"
        );
        assert_eq!(
            single.xpub(),
            "xpub6DPMTPxGMqdtzMwpqT1dDQaVdyaEppEm2qYSaJ7ANsuES7HkNzrXJst1Ed8D7NAnijUdgSDUFgph1oj5LKKAD5gyxWNhNP2AuDqaKYqzphA"
        );

        let multi = AccountKey::from_mnemonic(MNEMONIC, "", Network::Bitcoin, true).unwrap();
        assert_eq!(
            multi.xpub(),
            "xpub6EKmKYGYc1WY6t9d3d9SksR8keSaPZbFa6tqsGiH4xVxx8d2YyxSX7WG6yXEX3CmG54dPCxaapDw1XsjwCmfoqP7tbsAeqMVfKvqSAu4ndy"
        );
        assert!(multi.key_expression().starts_with("[55f8fc5d/48h/0h/0h/2h]xpub"));
    }
}
