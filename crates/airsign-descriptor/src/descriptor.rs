//! Output descriptors and ownership checks.
//!
//! Supported forms:
//!
//! ```text
//! pkh(KEY)  wpkh(KEY)  sh(wpkh(KEY))
//! sh(MS)    wsh(MS)    sh(wsh(MS))
//! ```
//!
//! with an optional `#checksum` suffix that is validated when present.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use airsign_core::bip32::KeyOrigin;
use airsign_core::ec::PublicKey;
use airsign_core::networks::Network;
use airsign_core::script::{self, Script, ScriptError, ScriptType};
use thiserror::Error;

use crate::checksum::checksum;
use crate::cursor::Cursor;
use crate::key::{ArgumentError, DescriptorKey, KeyKind};
use crate::miniscript::{Fragment, Miniscript, MiniscriptError, Type};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("Invalid descriptor: {0}")]
    Invalid(String),
    #[error("Invalid checksum: expected {expected}, got {found}")]
    Checksum { expected: String, found: String },
    #[error("Top-level miniscript must be of type B, got {0}")]
    NotTopLevel(Type),
    #[error("All keys must have the same number of branches")]
    InconsistentBranches,
    #[error("Wildcard and non-wildcard extended keys can't be mixed")]
    InconsistentWildcards,
    #[error("Segwit descriptors require compressed keys")]
    UncompressedKey,
    #[error(transparent)]
    Miniscript(#[from] MiniscriptError),
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Full script context of an output, nesting included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
    P2sh,
    P2wsh,
    P2shP2wsh,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::P2pkh => "p2pkh",
            ScriptKind::P2wpkh => "p2wpkh",
            ScriptKind::P2shP2wpkh => "p2sh-p2wpkh",
            ScriptKind::P2sh => "p2sh",
            ScriptKind::P2wsh => "p2wsh",
            ScriptKind::P2shP2wsh => "p2sh-p2wsh",
        }
    }

    /// Classify a scriptPubkey, looking one level into p2sh when the
    /// redeem script is known.
    pub fn classify(script_pubkey: &Script, redeem_script: Option<&Script>) -> Option<ScriptKind> {
        match script_pubkey.script_type() {
            ScriptType::P2pkh => Some(ScriptKind::P2pkh),
            ScriptType::P2wpkh => Some(ScriptKind::P2wpkh),
            ScriptType::P2wsh => Some(ScriptKind::P2wsh),
            ScriptType::P2sh => Some(match redeem_script.map(Script::script_type) {
                Some(ScriptType::P2wpkh) => ScriptKind::P2shP2wpkh,
                Some(ScriptType::P2wsh) => ScriptKind::P2shP2wsh,
                _ => ScriptKind::P2sh,
            }),
            _ => None,
        }
    }

    /// Type of the outermost scriptPubkey.
    pub fn outer_type(&self) -> ScriptType {
        match self {
            ScriptKind::P2pkh => ScriptType::P2pkh,
            ScriptKind::P2wpkh => ScriptType::P2wpkh,
            ScriptKind::P2wsh => ScriptType::P2wsh,
            ScriptKind::P2sh | ScriptKind::P2shP2wpkh | ScriptKind::P2shP2wsh => ScriptType::P2sh,
        }
    }

    pub fn is_segwit(&self) -> bool {
        !matches!(self, ScriptKind::P2pkh | ScriptKind::P2sh)
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A PSBT input or output as seen by [`Descriptor::owns`].
pub trait OwnershipScope {
    /// The scriptPubkey being spent or created, when known.
    fn script_pubkey(&self) -> Option<Script>;

    fn bip32_derivations(&self) -> &BTreeMap<PublicKey, KeyOrigin>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Pkh(DescriptorKey),
    Wpkh(DescriptorKey),
    ShWpkh(DescriptorKey),
    Sh(Miniscript),
    Wsh(Miniscript),
    ShWsh(Miniscript),
}

impl Descriptor {
    /// Parse and validate. A trailing `#checksum` must match.
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let s = s.trim();
        let body = match s.split_once('#') {
            Some((body, found)) => {
                let expected = checksum(body)
                    .ok_or_else(|| DescriptorError::Invalid("invalid character in descriptor".into()))?;
                if expected != found {
                    return Err(DescriptorError::Checksum {
                        expected,
                        found: found.to_string(),
                    });
                }
                body
            }
            None => s,
        };

        let mut cursor = Cursor::new(body);
        let descriptor = Self::read(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(DescriptorError::Invalid(format!(
                "unexpected trailing input '{}'",
                cursor.rest()
            )));
        }
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn read(cursor: &mut Cursor<'_>) -> Result<Self, DescriptorError> {
        let descriptor = if cursor.eat_str("sh(wsh(") {
            let ms = Miniscript::parse_from(cursor)?;
            close(cursor, 2)?;
            Descriptor::ShWsh(ms)
        } else if cursor.eat_str("sh(wpkh(") {
            let key = DescriptorKey::parse(cursor.take_key())?;
            close(cursor, 2)?;
            Descriptor::ShWpkh(key)
        } else if cursor.eat_str("sh(") {
            let ms = Miniscript::parse_from(cursor)?;
            close(cursor, 1)?;
            Descriptor::Sh(ms)
        } else if cursor.eat_str("wsh(") {
            let ms = Miniscript::parse_from(cursor)?;
            close(cursor, 1)?;
            Descriptor::Wsh(ms)
        } else if cursor.eat_str("wpkh(") {
            let key = DescriptorKey::parse(cursor.take_key())?;
            close(cursor, 1)?;
            Descriptor::Wpkh(key)
        } else if cursor.eat_str("pkh(") {
            let key = DescriptorKey::parse(cursor.take_key())?;
            close(cursor, 1)?;
            Descriptor::Pkh(key)
        } else {
            return Err(DescriptorError::Invalid(format!(
                "unsupported descriptor '{}'",
                cursor.rest()
            )));
        };
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        if let Some(ms) = self.miniscript() {
            ms.verify()?;
            if ms.ty() != Type::B {
                return Err(DescriptorError::NotTopLevel(ms.ty()));
            }
        }

        let keys = self.keys();
        if let Some(first) = keys.first() {
            let branches = first.num_branches();
            if keys.iter().any(|k| k.num_branches() != branches) {
                return Err(DescriptorError::InconsistentBranches);
            }
        }
        let mut wildcards = keys.iter().filter(|k| k.is_extended()).map(|k| k.is_wildcard());
        if let Some(first) = wildcards.next() {
            if wildcards.any(|w| w != first) {
                return Err(DescriptorError::InconsistentWildcards);
            }
        }

        if self.is_segwit() && keys.iter().any(|k| is_uncompressed(k)) {
            return Err(DescriptorError::UncompressedKey);
        }
        Ok(())
    }

    pub fn miniscript(&self) -> Option<&Miniscript> {
        match self {
            Descriptor::Sh(ms) | Descriptor::Wsh(ms) | Descriptor::ShWsh(ms) => Some(ms),
            _ => None,
        }
    }

    /// The key of a single-key descriptor.
    pub fn key(&self) -> Option<&DescriptorKey> {
        match self {
            Descriptor::Pkh(k) | Descriptor::Wpkh(k) | Descriptor::ShWpkh(k) => Some(k),
            _ => None,
        }
    }

    pub fn keys(&self) -> Vec<&DescriptorKey> {
        match self {
            Descriptor::Pkh(k) | Descriptor::Wpkh(k) | Descriptor::ShWpkh(k) => vec![k],
            Descriptor::Sh(ms) | Descriptor::Wsh(ms) | Descriptor::ShWsh(ms) => ms.keys(),
        }
    }

    pub fn kind(&self) -> ScriptKind {
        match self {
            Descriptor::Pkh(_) => ScriptKind::P2pkh,
            Descriptor::Wpkh(_) => ScriptKind::P2wpkh,
            Descriptor::ShWpkh(_) => ScriptKind::P2shP2wpkh,
            Descriptor::Sh(_) => ScriptKind::P2sh,
            Descriptor::Wsh(_) => ScriptKind::P2wsh,
            Descriptor::ShWsh(_) => ScriptKind::P2shP2wsh,
        }
    }

    /// `"p2wpkh"`, `"p2sh-p2wsh"`, ...
    pub fn scriptpubkey_type(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn is_segwit(&self) -> bool {
        self.kind().is_segwit()
    }

    pub fn is_legacy(&self) -> bool {
        !self.is_segwit()
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, Descriptor::ShWpkh(_) | Descriptor::ShWsh(_))
    }

    pub fn is_wildcard(&self) -> bool {
        self.keys().iter().any(|k| k.is_wildcard())
    }

    pub fn num_branches(&self) -> usize {
        self.keys().first().map_or(1, |k| k.num_branches())
    }

    pub fn is_basic_multisig(&self) -> bool {
        self.miniscript()
            .is_some_and(|ms| matches!(ms.fragment(), Fragment::Multi(..) | Fragment::SortedMulti(..)))
    }

    pub fn is_sorted(&self) -> bool {
        self.miniscript()
            .is_some_and(|ms| matches!(ms.fragment(), Fragment::SortedMulti(..)))
    }

    /// `(m, n)` of a basic multisig descriptor.
    pub fn multisig(&self) -> Option<(u32, usize)> {
        let ms = self.miniscript()?;
        match ms.fragment() {
            Fragment::Multi(k, keys) | Fragment::SortedMulti(k, keys) => Some((*k, keys.len())),
            _ => None,
        }
    }

    /// One-line summary: "single key", "2 of 3 multisig (sorted)" or
    /// "miniscript".
    pub fn brief_policy(&self) -> String {
        if let Some((m, n)) = self.multisig() {
            let mut s = format!("{} of {} multisig", m, n);
            if self.is_sorted() {
                s.push_str(" (sorted)");
            }
            return s;
        }
        if self.key().is_some() {
            return "single key".to_string();
        }
        "miniscript".to_string()
    }

    /// The policy with keys replaced by `A`, `B`, ... in order of
    /// appearance, followed by the key legend.
    pub fn full_policy(&self) -> (String, Vec<(char, String)>) {
        let inner = match self {
            Descriptor::Pkh(k) | Descriptor::Wpkh(k) | Descriptor::ShWpkh(k) => format!("pk({})", k),
            Descriptor::Sh(ms) | Descriptor::Wsh(ms) | Descriptor::ShWsh(ms) => ms.to_string(),
        };
        let mut policy = inner;
        let mut legend = Vec::new();
        for (letter, key) in ('A'..='Z').zip(self.keys()) {
            let text = key.to_string();
            policy = policy.replace(&text, &letter.to_string());
            legend.push((letter, text));
        }
        (policy, legend)
    }

    fn map_keys<F>(&self, mut f: F) -> Result<Descriptor, DescriptorError>
    where
        F: FnMut(&DescriptorKey) -> Result<DescriptorKey, ArgumentError>,
    {
        Ok(match self {
            Descriptor::Pkh(k) => Descriptor::Pkh(f(k)?),
            Descriptor::Wpkh(k) => Descriptor::Wpkh(f(k)?),
            Descriptor::ShWpkh(k) => Descriptor::ShWpkh(f(k)?),
            Descriptor::Sh(ms) => Descriptor::Sh(ms.map_keys(&mut f)?),
            Descriptor::Wsh(ms) => Descriptor::Wsh(ms.map_keys(&mut f)?),
            Descriptor::ShWsh(ms) => Descriptor::ShWsh(ms.map_keys(&mut f)?),
        })
    }

    /// Concrete descriptor for receive/change `branch` and `index`.
    pub fn derive(&self, index: u32, branch: usize) -> Result<Descriptor, DescriptorError> {
        self.map_keys(|k| k.derive(index, branch))
    }

    /// Keep only branch `branch` of every branch set.
    pub fn branch(&self, branch: usize) -> Result<Descriptor, DescriptorError> {
        self.map_keys(|k| k.branch(branch))
    }

    /// Give every extended key without a template the `/{0,1}/*` default.
    pub fn with_default_derivation(&self) -> Result<Descriptor, DescriptorError> {
        self.map_keys(|k| Ok(k.clone().with_default_derivation()))
    }

    pub fn witness_script(&self) -> Result<Option<Script>, DescriptorError> {
        match self {
            Descriptor::Wsh(ms) | Descriptor::ShWsh(ms) => Ok(Some(ms.compile()?)),
            _ => Ok(None),
        }
    }

    pub fn redeem_script(&self) -> Result<Option<Script>, DescriptorError> {
        match self {
            Descriptor::Sh(ms) => Ok(Some(ms.compile()?)),
            Descriptor::ShWsh(ms) => Ok(Some(script::p2wsh(&ms.compile()?))),
            Descriptor::ShWpkh(k) => Ok(Some(script::p2wpkh(&k.public_key()?))),
            _ => Ok(None),
        }
    }

    /// The scriptPubkey. Wildcard descriptors must be derived first.
    pub fn script_pubkey(&self) -> Result<Script, DescriptorError> {
        Ok(match self {
            Descriptor::Pkh(k) => match k.kind() {
                KeyKind::PkHash(hash) => script::p2pkh_from_hash(hash),
                _ => script::p2pkh(&k.public_key()?),
            },
            Descriptor::Wpkh(k) => script::p2wpkh(&k.public_key()?),
            Descriptor::Wsh(ms) => script::p2wsh(&ms.compile()?),
            Descriptor::Sh(_) | Descriptor::ShWpkh(_) | Descriptor::ShWsh(_) => {
                let redeem = self
                    .redeem_script()?
                    .ok_or_else(|| DescriptorError::Invalid("missing redeem script".into()))?;
                script::p2sh(&redeem)
            }
        })
    }

    pub fn address(&self, network: Network) -> Result<String, DescriptorError> {
        Ok(self.script_pubkey()?.address(network)?)
    }

    /// `(index, branch)` for a derivation record produced by one of this
    /// descriptor's keys.
    pub fn check_derivation(&self, record: &KeyOrigin) -> Option<(u32, usize)> {
        self.keys().iter().find_map(|k| k.check_derivation(record))
    }

    /// Whether a PSBT input or output pays to this descriptor.
    ///
    /// Every derivation entry that points into this descriptor must
    /// reproduce the scope's scriptPubkey; a single inconsistent entry
    /// rejects the scope.
    pub fn owns(&self, scope: &impl OwnershipScope) -> bool {
        let spk = match scope.script_pubkey() {
            Some(spk) => spk,
            None => return false,
        };
        if spk.script_type() != self.kind().outer_type() {
            return false;
        }

        let fixed_keys: Vec<PublicKey> = self
            .keys()
            .iter()
            .filter(|k| !k.can_derive())
            .filter_map(|k| k.public_key().ok())
            .collect();

        let mut matched = false;
        for (pubkey, origin) in scope.bip32_derivations() {
            let (index, branch) = match self.check_derivation(origin) {
                Some(found) => found,
                None if fixed_keys.contains(pubkey) => (0, 0),
                None => continue,
            };
            let derived = match self.derive(index, branch).and_then(|d| d.script_pubkey()) {
                Ok(derived) => derived,
                Err(e) => {
                    log::warn!("Failed to derive {} for ownership check: {}", origin, e);
                    return false;
                }
            };
            if derived != spk {
                log::warn!(
                    "Derivation {} for key {} does not produce the scope's scriptPubkey",
                    origin,
                    pubkey
                );
                return false;
            }
            matched = true;
        }
        matched
    }

    /// The descriptor text without a checksum.
    pub fn without_checksum(&self) -> String {
        match self {
            Descriptor::Pkh(k) => format!("pkh({})", k),
            Descriptor::Wpkh(k) => format!("wpkh({})", k),
            Descriptor::ShWpkh(k) => format!("sh(wpkh({}))", k),
            Descriptor::Sh(ms) => format!("sh({})", ms),
            Descriptor::Wsh(ms) => format!("wsh({})", ms),
            Descriptor::ShWsh(ms) => format!("sh(wsh({}))", ms),
        }
    }
}

fn close(cursor: &mut Cursor<'_>, count: usize) -> Result<(), DescriptorError> {
    for _ in 0..count {
        if !cursor.eat(')') {
            return Err(DescriptorError::Invalid(format!(
                "expected ) but found '{}'",
                cursor.rest()
            )));
        }
    }
    Ok(())
}

fn is_uncompressed(key: &DescriptorKey) -> bool {
    match key.kind() {
        KeyKind::Sec(pk) => !pk.is_compressed(),
        KeyKind::Wif(sk, _) => !sk.is_compressed(),
        KeyKind::Hd(_) | KeyKind::PkHash(_) => false,
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.without_checksum();
        match checksum(&body) {
            Some(sum) => write!(f, "{}#{}", body, sum),
            None => f.write_str(&body),
        }
    }
}

impl FromStr for Descriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
