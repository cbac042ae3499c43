//! The wallet the signer's account key belongs to.
//!
//! A single-sig wallet is usable out of the box. A multisig wallet has no
//! descriptor until wallet data naming the account as a cosigner is loaded.

use airsign_core::bip32::HdError;
use airsign_core::keys::AccountKey;
use airsign_core::networks::Network;
use airsign_core::script::address_to_script_pubkey;
use airsign_descriptor::{Descriptor, DescriptorError, DescriptorKey};
use serde::Deserialize;
use thiserror::Error;

use crate::policy::{cosigner_id, MultisigPolicy, Policy};

const SINGLE_SIG_LABEL: &str = "Single-sig";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("invalid wallet format")]
    InvalidFormat,
    #[error("not multisig")]
    NotMultisig,
    #[error("not single-sig")]
    NotSingleSig,
    #[error("xpub not a cosigner")]
    NotCosigner,
    #[error("xpub does not match")]
    XpubMismatch,
    #[error("no wallet descriptor loaded")]
    NotLoaded,
    #[error("invalid address")]
    InvalidAddress,
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Hd(#[from] HdError),
}

/// `{"descriptor": "...", "label": "..."}` as exported by Specter and
/// Sparrow.
#[derive(Debug, Deserialize)]
struct WalletJson {
    descriptor: Option<String>,
    label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Wallet {
    key: AccountKey,
    descriptor: Option<Descriptor>,
    label: Option<String>,
    policy: Option<Policy>,
    wallet_data: Option<String>,
}

impl Wallet {
    /// An unloaded wallet. Single-sig accounts get `wpkh(KEY/<0;1>/*)`.
    pub fn new(key: AccountKey) -> Result<Self, WalletError> {
        let mut wallet = Self {
            key,
            descriptor: None,
            label: None,
            policy: None,
            wallet_data: None,
        };
        if !wallet.key.is_multisig() {
            let descriptor =
                Descriptor::parse(&format!("wpkh({}/<0;1>/*)", wallet.key.key_expression()))?;
            wallet.policy = Some(Policy::single(descriptor.kind()));
            wallet.descriptor = Some(descriptor);
            wallet.label = Some(SINGLE_SIG_LABEL.to_string());
        }
        Ok(wallet)
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn network(&self) -> Network {
        self.key.network()
    }

    pub fn is_multisig(&self) -> bool {
        self.key.is_multisig()
    }

    pub fn is_loaded(&self) -> bool {
        self.wallet_data.is_some()
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    /// The wallet data as it was loaded, for re-export.
    pub fn wallet_data(&self) -> Option<&str> {
        self.wallet_data.as_deref()
    }

    /// Load wallet data in any format [`parse_wallet`] understands. The
    /// account must be a cosigner (multisig) or the wallet key (single-sig).
    /// On error the wallet is unchanged.
    pub fn load(&mut self, wallet_data: &str) -> Result<(), WalletError> {
        let (descriptor, label) = parse_wallet(wallet_data, self.network())?;
        let account = self.key.account();

        if self.is_multisig() {
            if !descriptor.is_basic_multisig() {
                return Err(WalletError::NotMultisig);
            }
            if !descriptor.keys().iter().any(|k| k.hd_key() == Some(account)) {
                return Err(WalletError::NotCosigner);
            }
        } else {
            let key = descriptor.key().ok_or(WalletError::NotSingleSig)?;
            if key.hd_key() != Some(account) {
                return Err(WalletError::XpubMismatch);
            }
        }

        let descriptor = to_unambiguous_descriptor(&descriptor)?;
        let (policy, default_label) = match descriptor.multisig() {
            Some((m, n)) if descriptor.key().is_none() => {
                let mut cosigners = descriptor
                    .keys()
                    .iter()
                    .filter_map(|k| k.hd_key())
                    .map(cosigner_id)
                    .collect::<Result<Vec<_>, _>>()?;
                cosigners.sort();
                let policy = Policy {
                    kind: descriptor.kind(),
                    multisig: Some(MultisigPolicy {
                        m: m as usize,
                        n,
                        cosigners,
                    }),
                };
                (policy, format!("{} of {} multisig", m, n))
            }
            _ => (
                Policy::single(descriptor.kind()),
                SINGLE_SIG_LABEL.to_string(),
            ),
        };

        log::info!("Loaded wallet: {}", policy);
        self.label = Some(label.unwrap_or(default_label));
        self.policy = Some(policy);
        self.descriptor = Some(descriptor);
        self.wallet_data = Some(wallet_data.to_string());
        Ok(())
    }

    /// Addresses from `start` on the given branch (0 receive, 1 change),
    /// endless when `limit` is `None`.
    pub fn addresses(
        &self,
        start: u32,
        limit: Option<u32>,
        branch: usize,
    ) -> Result<Addresses<'_>, WalletError> {
        let descriptor = self.descriptor.as_ref().ok_or(WalletError::NotLoaded)?;
        let end = limit.map(|limit| start.saturating_add(limit));
        Ok(Addresses {
            descriptor,
            network: self.network(),
            branch,
            next: Some(start),
            end,
        })
    }
}

/// Iterator returned by [`Wallet::addresses`].
pub struct Addresses<'a> {
    descriptor: &'a Descriptor,
    network: Network,
    branch: usize,
    next: Option<u32>,
    end: Option<u32>,
}

impl Iterator for Addresses<'_> {
    type Item = Result<String, DescriptorError>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        if self.end.is_some_and(|end| index >= end) {
            return None;
        }
        self.next = index.checked_add(1);
        Some(
            self.descriptor
                .derive(index, self.branch)
                .and_then(|d| d.address(self.network)),
        )
    }
}

/// Give every extended key without a child template the default
/// `/{0,1}/*` so receive and change addresses can be derived.
pub fn to_unambiguous_descriptor(descriptor: &Descriptor) -> Result<Descriptor, DescriptorError> {
    descriptor.with_default_derivation()
}

/// Parse wallet data into a descriptor and optional label. Tried in
/// order: JSON with a `descriptor` field, a Coldcard-style multisig
/// export, a descriptor string, a bare extended key (as `wpkh`).
pub fn parse_wallet(
    wallet_data: &str,
    network: Network,
) -> Result<(Descriptor, Option<String>), WalletError> {
    let data = wallet_data.trim();

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(data) {
        let json: WalletJson = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|_| WalletError::InvalidFormat)?;
        let descriptor = json.descriptor.ok_or(WalletError::InvalidFormat)?;
        return Ok((Descriptor::parse(&descriptor)?, json.label));
    }

    if let Some(parsed) = parse_key_value_export(data) {
        return parsed.ok_or(WalletError::InvalidFormat);
    }

    if let Ok(descriptor) = Descriptor::parse(data) {
        return Ok((descriptor, None));
    }

    if let Ok(key) = DescriptorKey::parse(data) {
        if let Some(hd) = key.hd_key() {
            let xpub = hd.to_public_with_version(network.xpub())?.to_base58();
            return Ok((Descriptor::parse(&format!("wpkh({})", xpub))?, None));
        }
    }

    Err(WalletError::InvalidFormat)
}

/// `Name: ..`, `Policy: 2 of 3`, `Derivation: m/48'/0'/0'/2'`,
/// `Format: P2WSH` followed by `FINGERPRINT: xpub` lines.
///
/// `None` when the data is not in this format at all; `Some(None)` when it
/// is but the content is unusable.
fn parse_key_value_export(data: &str) -> Option<Option<(Descriptor, Option<String>)>> {
    let tokens: Vec<&str> = data
        .split(':')
        .flat_map(|part| part.split('\n'))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let required = ["Format", "Policy", "Derivation"];
    let present = required.iter().filter(|k| tokens.contains(k)).count();
    if present == 0 {
        return None;
    }
    if present < required.len() {
        log::debug!("Wallet export is missing one of {:?}", required);
        return Some(None);
    }

    let parsed = parse_export_fields(&tokens);
    if parsed.is_none() {
        log::debug!("Unusable multisig wallet export");
    }
    Some(parsed)
}

fn parse_export_fields(tokens: &[&str]) -> Option<(Descriptor, Option<String>)> {
    let value_of = |key: &str| {
        let pos = tokens.iter().position(|t| *t == key)?;
        tokens.get(pos + 1).copied()
    };

    if !value_of("Format")?.eq_ignore_ascii_case("p2wsh") {
        return None;
    }
    let (m, n) = value_of("Policy")?.split_once("of")?;
    let m: usize = m.trim().parse().ok()?;
    let n: usize = n.trim().parse().ok()?;

    // each extended key follows its fingerprint
    let mut keys: Vec<(&str, &str)> = tokens
        .windows(2)
        .filter(|pair| {
            let lower = pair[1].to_ascii_lowercase();
            lower.starts_with("xpub") || lower.starts_with("tpub")
        })
        .map(|pair| (pair[1], pair[0]))
        .collect();
    if keys.len() != n {
        return None;
    }
    keys.sort();

    let derivation = value_of("Derivation")?;
    let path = derivation.strip_prefix("m/").unwrap_or(derivation);
    let keys: Vec<String> = keys
        .iter()
        .map(|(xpub, fp)| format!("[{}/{}]{}", fp, path, xpub))
        .collect();
    let text = match keys.as_slice() {
        [single] => format!("wpkh({}/<0;1>/*)", single),
        _ => format!("wsh(sortedmulti({},{}))", m, keys.join(",")),
    };
    let descriptor = Descriptor::parse(&text).ok()?;
    Some((descriptor, value_of("Name").map(str::to_string)))
}

/// Validate an address, accepting `bitcoin:` URIs. Returns the bare
/// address.
pub fn parse_address(address_data: &str) -> Result<String, WalletError> {
    let data = address_data.trim();
    let address = match data.get(..8) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bitcoin:") => {
            let rest = &data[8..];
            rest.split_once('?').map_or(rest, |(addr, _)| addr)
        }
        _ => data,
    };
    address_to_script_pubkey(address).map_err(|_| WalletError::InvalidAddress)?;
    Ok(address.to_string())
}
