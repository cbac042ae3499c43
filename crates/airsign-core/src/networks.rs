//! Network parameters: address prefixes, bech32 HRPs and SLIP-132 versions.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Network {
    Bitcoin,
    Testnet,
    Regtest,
    Signet,
}

/// Script family an extended key version advertises (SLIP-132).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// xpub / tpub
    Legacy,
    /// ypub / upub
    NestedSegwit,
    /// zpub / vpub
    NativeSegwit,
    /// Ypub / Upub
    NestedSegwitMultisig,
    /// Zpub / Vpub
    NativeSegwitMultisig,
}

const ROLES: [KeyRole; 5] = [
    KeyRole::Legacy,
    KeyRole::NestedSegwit,
    KeyRole::NativeSegwit,
    KeyRole::NestedSegwitMultisig,
    KeyRole::NativeSegwitMultisig,
];

// (private, public) pairs in ROLES order
const MAINNET_VERSIONS: [([u8; 4], [u8; 4]); 5] = [
    ([0x04, 0x88, 0xad, 0xe4], [0x04, 0x88, 0xb2, 0x1e]),
    ([0x04, 0x9d, 0x78, 0x78], [0x04, 0x9d, 0x7c, 0xb2]),
    ([0x04, 0xb2, 0x43, 0x0c], [0x04, 0xb2, 0x47, 0x46]),
    ([0x02, 0x95, 0xb0, 0x05], [0x02, 0x95, 0xb4, 0x3f]),
    ([0x02, 0xaa, 0x7a, 0x99], [0x02, 0xaa, 0x7e, 0xd3]),
];

const TESTNET_VERSIONS: [([u8; 4], [u8; 4]); 5] = [
    ([0x04, 0x35, 0x83, 0x94], [0x04, 0x35, 0x87, 0xcf]),
    ([0x04, 0x4a, 0x4e, 0x28], [0x04, 0x4a, 0x52, 0x62]),
    ([0x04, 0x5f, 0x18, 0xbc], [0x04, 0x5f, 0x1c, 0xf6]),
    ([0x02, 0x42, 0x85, 0xb5], [0x02, 0x42, 0x89, 0x85]),
    ([0x02, 0x57, 0x50, 0x48], [0x02, 0x57, 0x54, 0x83]),
];

pub const ALL_NETWORKS: [Network; 4] = [
    Network::Bitcoin,
    Network::Testnet,
    Network::Regtest,
    Network::Signet,
];

impl Network {
    /// Human-readable part of segwit addresses.
    pub fn bech32_hrp(self) -> &'static str {
        match self {
            Network::Bitcoin => "bc",
            Network::Testnet | Network::Signet => "tb",
            Network::Regtest => "bcrt",
        }
    }

    pub fn p2pkh_prefix(self) -> u8 {
        match self {
            Network::Bitcoin => 0x00,
            _ => 0x6f,
        }
    }

    pub fn p2sh_prefix(self) -> u8 {
        match self {
            Network::Bitcoin => 0x05,
            _ => 0xc4,
        }
    }

    pub fn wif_prefix(self) -> u8 {
        match self {
            Network::Bitcoin => 0x80,
            _ => 0xef,
        }
    }

    /// BIP-44 coin type.
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    fn versions(self) -> &'static [([u8; 4], [u8; 4]); 5] {
        match self {
            Network::Bitcoin => &MAINNET_VERSIONS,
            _ => &TESTNET_VERSIONS,
        }
    }

    /// Extended key version bytes for a role.
    pub fn key_version(self, role: KeyRole, private: bool) -> [u8; 4] {
        let idx = ROLES.iter().position(|r| *r == role).unwrap_or(0);
        let (prv, publ) = self.versions()[idx];
        if private {
            prv
        } else {
            publ
        }
    }

    pub fn xprv(self) -> [u8; 4] {
        self.key_version(KeyRole::Legacy, true)
    }

    pub fn xpub(self) -> [u8; 4] {
        self.key_version(KeyRole::Legacy, false)
    }

    /// Identify version bytes. Regtest and signet share testnet versions
    /// and are reported as testnet.
    pub fn from_key_version(version: [u8; 4]) -> Option<(Network, KeyRole, bool)> {
        for network in [Network::Bitcoin, Network::Testnet] {
            for (role, (prv, publ)) in ROLES.iter().zip(network.versions().iter()) {
                if *prv == version {
                    return Some((network, *role, true));
                }
                if *publ == version {
                    return Some((network, *role, false));
                }
            }
        }
        None
    }

    /// Networks whose base58 p2pkh or p2sh prefix equals `prefix`.
    pub fn from_base58_prefix(prefix: u8) -> Option<Network> {
        ALL_NETWORKS
            .into_iter()
            .find(|n| n.p2pkh_prefix() == prefix || n.p2sh_prefix() == prefix)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
            Network::Signet => "signet",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown network: {0}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "main" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            _ => Err(UnknownNetwork(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_lookup() {
        assert_eq!(
            Network::from_key_version([0x04, 0x88, 0xb2, 0x1e]),
            Some((Network::Bitcoin, KeyRole::Legacy, false))
        );
        assert_eq!(
            Network::from_key_version([0x02, 0x57, 0x54, 0x83]),
            Some((Network::Testnet, KeyRole::NativeSegwitMultisig, false))
        );
        assert_eq!(
            Network::from_key_version([0x04, 0x5f, 0x18, 0xbc]),
            Some((Network::Testnet, KeyRole::NativeSegwit, true))
        );
        assert_eq!(Network::from_key_version([0, 0, 0, 0]), None);
    }

    #[test]
    fn test_key_version_roundtrip() {
        for network in ALL_NETWORKS {
            for role in ROLES {
                for private in [true, false] {
                    let version = network.key_version(role, private);
                    let (_, r, p) = Network::from_key_version(version).unwrap();
                    assert_eq!((r, p), (role, private));
                }
            }
        }
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!("bitcoin".parse::<Network>().unwrap(), Network::Bitcoin);
        assert_eq!("Signet".parse::<Network>().unwrap(), Network::Signet);
        assert!("litecoin".parse::<Network>().is_err());
        assert_eq!(Network::Regtest.bech32_hrp(), "bcrt");
        assert_eq!(Network::Testnet.coin_type(), 1);
    }
}
