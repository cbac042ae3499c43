//! Key expressions: `[fingerprint/origin/path]KEY/derivation/template`.
//!
//! `KEY` is a hex SEC public key, a WIF private key, an extended key, or
//! (only inside `pkh()`/`pk_h()`) a raw 20-byte key hash. The derivation
//! template may contain one wildcard `*` and one branch set written either
//! `{0,1}` or `<0;1>`.

use std::fmt;
use std::str::FromStr;

use airsign_core::bip32::{parse_path_element, path_element_to_string, HDKey, HdError, KeyOrigin, HARDENED};
use airsign_core::ec::{EcError, PrivateKey, PublicKey};
use airsign_core::hashes::hash160;
use airsign_core::networks::Network;
use airsign_core::script::push_data;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Invalid key origin: {0}")]
    InvalidOrigin(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid derivation: {0}")]
    InvalidDerivation(String),
    #[error("Only one wildcard is allowed")]
    MultipleWildcards,
    #[error("Only one branch set is allowed")]
    MultipleBranchSets,
    #[error("Hardened derivation is not allowed in {0}")]
    HardenedNotAllowed(String),
    #[error("Derivation index out of range: {0}")]
    IndexOutOfRange(u32),
    #[error("Invalid branch index {index}, key has {count} branches")]
    InvalidBranch { index: usize, count: usize },
    #[error("Key {0} does not support derivation")]
    NotDerivable(String),
    #[error("Key still has an unresolved wildcard")]
    UnresolvedWildcard,
    #[error("Raw key hash has no public key")]
    HashOnly,
    #[error(transparent)]
    Hd(#[from] HdError),
    #[error(transparent)]
    Ec(#[from] EcError),
}

/// One step of a derivation template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DerivationElement {
    Index(u32),
    /// Alternative indices, e.g. receive and change.
    Branches(Vec<u32>),
    Wildcard,
}

/// How a branch set was written, kept so the descriptor re-serializes
/// to the same text (and checksum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BranchStyle {
    #[default]
    Braces,
    Angle,
}

/// Derivation template following a key, with at most one wildcard and at
/// most one branch set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllowedDerivation {
    elements: Vec<DerivationElement>,
    style: BranchStyle,
}

impl AllowedDerivation {
    pub fn new(elements: Vec<DerivationElement>) -> Result<Self, ArgumentError> {
        Self::with_style(elements, BranchStyle::Braces)
    }

    fn with_style(elements: Vec<DerivationElement>, style: BranchStyle) -> Result<Self, ArgumentError> {
        let wildcards = elements
            .iter()
            .filter(|e| matches!(e, DerivationElement::Wildcard))
            .count();
        if wildcards > 1 {
            return Err(ArgumentError::MultipleWildcards);
        }
        let sets = elements
            .iter()
            .filter(|e| matches!(e, DerivationElement::Branches(_)))
            .count();
        if sets > 1 {
            return Err(ArgumentError::MultipleBranchSets);
        }
        Ok(Self { elements, style })
    }

    /// `/{0,1}/*`: receive and change branches, any index.
    pub fn default_template() -> Self {
        Self {
            elements: vec![
                DerivationElement::Branches(vec![0, 1]),
                DerivationElement::Wildcard,
            ],
            style: BranchStyle::Braces,
        }
    }

    pub fn elements(&self) -> &[DerivationElement] {
        &self.elements
    }

    pub fn is_wildcard(&self) -> bool {
        self.elements.contains(&DerivationElement::Wildcard)
    }

    pub fn branches(&self) -> Option<&[u32]> {
        self.elements.iter().find_map(|e| match e {
            DerivationElement::Branches(b) => Some(b.as_slice()),
            _ => None,
        })
    }

    pub fn num_branches(&self) -> usize {
        self.branches().map_or(1, |b| b.len())
    }

    /// Parse the text after the key's first `/`, e.g. `0/*` or `<0;1>/*`.
    pub fn parse(s: &str, allow_hardened: bool) -> Result<Self, ArgumentError> {
        let mut style = BranchStyle::Braces;
        let mut elements = Vec::new();
        for part in s.split('/') {
            let element = if part == "*" {
                DerivationElement::Wildcard
            } else if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                DerivationElement::Branches(parse_branch_set(inner, ',', allow_hardened)?)
            } else if let Some(inner) = part.strip_prefix('<').and_then(|p| p.strip_suffix('>')) {
                style = BranchStyle::Angle;
                DerivationElement::Branches(parse_branch_set(inner, ';', allow_hardened)?)
            } else {
                DerivationElement::Index(parse_index(part, allow_hardened)?)
            };
            elements.push(element);
        }
        Self::with_style(elements, style)
    }

    /// Concrete path with the wildcard set to `index` and the branch set
    /// resolved to its `branch`-th entry.
    pub fn fill(&self, index: u32, branch: usize) -> Result<Vec<u32>, ArgumentError> {
        if index >= HARDENED {
            return Err(ArgumentError::IndexOutOfRange(index));
        }
        self.elements
            .iter()
            .map(|e| match e {
                DerivationElement::Index(i) => Ok(*i),
                DerivationElement::Wildcard => Ok(index),
                DerivationElement::Branches(b) => b.get(branch).copied().ok_or(
                    ArgumentError::InvalidBranch {
                        index: branch,
                        count: b.len(),
                    },
                ),
            })
            .collect()
    }

    /// Same template with the branch set collapsed to one branch.
    pub fn branch(&self, branch: usize) -> Result<Self, ArgumentError> {
        let elements = self
            .elements
            .iter()
            .map(|e| match e {
                DerivationElement::Branches(b) => b
                    .get(branch)
                    .map(|i| DerivationElement::Index(*i))
                    .ok_or(ArgumentError::InvalidBranch {
                        index: branch,
                        count: b.len(),
                    }),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            elements,
            style: self.style,
        })
    }

    /// If `path` is an instance of this template, the `(index, branch)`
    /// that produces it. Templates without a wildcard report index 0.
    pub fn check_derivation(&self, path: &[u32]) -> Option<(u32, usize)> {
        if path.len() != self.elements.len() {
            return None;
        }
        let mut index = 0;
        let mut branch = 0;
        for (element, step) in self.elements.iter().zip(path) {
            match element {
                DerivationElement::Index(i) if i == step => {}
                DerivationElement::Index(_) => return None,
                DerivationElement::Branches(b) => branch = b.iter().position(|i| i == step)?,
                DerivationElement::Wildcard => {
                    if *step >= HARDENED {
                        return None;
                    }
                    index = *step;
                }
            }
        }
        Some((index, branch))
    }
}

impl fmt::Display for AllowedDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.elements {
            match element {
                DerivationElement::Index(i) => write!(f, "/{}", path_element_to_string(*i))?,
                DerivationElement::Wildcard => f.write_str("/*")?,
                DerivationElement::Branches(b) => {
                    let items: Vec<String> = b.iter().map(|i| path_element_to_string(*i)).collect();
                    match self.style {
                        BranchStyle::Braces => write!(f, "/{{{}}}", items.join(","))?,
                        BranchStyle::Angle => write!(f, "/<{}>", items.join(";"))?,
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_branch_set(inner: &str, sep: char, allow_hardened: bool) -> Result<Vec<u32>, ArgumentError> {
    let set = inner
        .split(sep)
        .map(|p| parse_index(p, allow_hardened))
        .collect::<Result<Vec<_>, _>>()?;
    if set.is_empty() {
        return Err(ArgumentError::InvalidDerivation(inner.to_string()));
    }
    Ok(set)
}

fn parse_index(part: &str, allow_hardened: bool) -> Result<u32, ArgumentError> {
    let index = parse_path_element(part).map_err(|_| ArgumentError::InvalidDerivation(part.to_string()))?;
    if index >= HARDENED && !allow_hardened {
        return Err(ArgumentError::HardenedNotAllowed(part.to_string()));
    }
    Ok(index)
}

/// The key material inside a key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Sec(PublicKey),
    Wif(PrivateKey, Network),
    Hd(HDKey),
    /// Only valid inside `pkh()` and `pk_h()`.
    PkHash([u8; 20]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorKey {
    origin: Option<KeyOrigin>,
    key: KeyKind,
    derivation: Option<AllowedDerivation>,
}

impl DescriptorKey {
    pub fn new(
        key: KeyKind,
        origin: Option<KeyOrigin>,
        derivation: Option<AllowedDerivation>,
    ) -> Result<Self, ArgumentError> {
        if derivation.is_some() && !matches!(key, KeyKind::Hd(_)) {
            return Err(ArgumentError::NotDerivable(key_text(&key)));
        }
        Ok(Self {
            origin,
            key,
            derivation,
        })
    }

    /// Parse a key expression where a raw key hash is not allowed.
    pub fn parse(s: &str) -> Result<Self, ArgumentError> {
        Self::parse_with(s, false)
    }

    /// Parse the argument of `pkh()`/`pk_h()`, which may be a raw hash.
    pub fn parse_key_hash(s: &str) -> Result<Self, ArgumentError> {
        Self::parse_with(s, true)
    }

    fn parse_with(s: &str, allow_hash: bool) -> Result<Self, ArgumentError> {
        let (origin, rest) = match s.strip_prefix('[') {
            Some(inner) => {
                let (origin, rest) = inner
                    .split_once(']')
                    .ok_or_else(|| ArgumentError::InvalidOrigin(format!("missing ] in {}", s)))?;
                let origin = KeyOrigin::from_str(origin)
                    .map_err(|e| ArgumentError::InvalidOrigin(e.to_string()))?;
                (Some(origin), rest)
            }
            None => (None, s),
        };
        let (key_str, derivation_str) = match rest.split_once('/') {
            Some((k, d)) => (k, Some(d)),
            None => (rest, None),
        };
        let key = parse_key_kind(key_str, allow_hash)?;
        let derivation = match derivation_str {
            Some(d) => {
                let allow_hardened = matches!(&key, KeyKind::Hd(hd) if hd.is_private());
                Some(AllowedDerivation::parse(d, allow_hardened)?)
            }
            None => None,
        };
        Self::new(key, origin, derivation)
    }

    pub fn kind(&self) -> &KeyKind {
        &self.key
    }

    pub fn origin(&self) -> Option<&KeyOrigin> {
        self.origin.as_ref()
    }

    pub fn allowed_derivation(&self) -> Option<&AllowedDerivation> {
        self.derivation.as_ref()
    }

    pub fn hd_key(&self) -> Option<&HDKey> {
        match &self.key {
            KeyKind::Hd(hd) => Some(hd),
            _ => None,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.key, KeyKind::Hd(_))
    }

    pub fn is_private(&self) -> bool {
        match &self.key {
            KeyKind::Wif(..) => true,
            KeyKind::Hd(hd) => hd.is_private(),
            _ => false,
        }
    }

    pub fn private_key(&self) -> Option<PrivateKey> {
        match &self.key {
            KeyKind::Wif(sk, _) => Some(*sk),
            KeyKind::Hd(hd) => hd.private_key().copied(),
            _ => None,
        }
    }

    /// Origin fingerprint, falling back to the extended key's own.
    pub fn fingerprint(&self) -> Option<[u8; 4]> {
        match (&self.origin, &self.key) {
            (Some(origin), _) => Some(origin.fingerprint),
            (None, KeyKind::Hd(hd)) => Some(hd.fingerprint()),
            _ => None,
        }
    }

    pub fn origin_path(&self) -> &[u32] {
        self.origin.as_ref().map_or(&[], |o| o.path.as_slice())
    }

    pub fn is_wildcard(&self) -> bool {
        self.derivation.as_ref().is_some_and(|d| d.is_wildcard())
    }

    pub fn branches(&self) -> Option<&[u32]> {
        self.derivation.as_ref().and_then(|d| d.branches())
    }

    pub fn num_branches(&self) -> usize {
        self.derivation.as_ref().map_or(1, |d| d.num_branches())
    }

    pub fn can_derive(&self) -> bool {
        self.derivation.is_some() && self.is_extended()
    }

    /// Give an extended key without a template the `/{0,1}/*` default.
    pub fn with_default_derivation(mut self) -> Self {
        if self.is_extended() && self.derivation.is_none() {
            self.derivation = Some(AllowedDerivation::default_template());
        }
        self
    }

    /// If a PSBT derivation record points at a child of this key, return
    /// the `(index, branch)` that produces it. Accepts both the full path
    /// from the origin's master and a path relative to the key itself.
    pub fn check_derivation(&self, record: &KeyOrigin) -> Option<(u32, usize)> {
        let mut rest: Option<&[u32]> = None;
        if self.fingerprint() == Some(record.fingerprint) {
            let origin = self.origin_path();
            if record.path.starts_with(origin) {
                rest = Some(&record.path[origin.len()..]);
            }
        }
        if let KeyKind::Hd(hd) = &self.key {
            if hd.fingerprint() == record.fingerprint {
                rest = Some(&record.path);
            }
        }
        self.derivation.as_ref()?.check_derivation(rest?)
    }

    /// Concrete key for `(index, branch)`. Keys without a template are
    /// returned unchanged; the origin is extended by the filled path.
    pub fn derive(&self, index: u32, branch: usize) -> Result<DescriptorKey, ArgumentError> {
        let (hd, template) = match (&self.key, &self.derivation) {
            (KeyKind::Hd(hd), Some(template)) => (hd, template),
            _ => return Ok(self.clone()),
        };
        let path = template.fill(index, branch)?;
        let child = hd.derive(&path)?;
        let origin = match &self.origin {
            Some(o) => {
                let mut full = o.path.clone();
                full.extend_from_slice(&path);
                KeyOrigin::new(o.fingerprint, full)
            }
            None => KeyOrigin::new(hd.fingerprint(), path),
        };
        Ok(DescriptorKey {
            origin: Some(origin),
            key: KeyKind::Hd(child),
            derivation: None,
        })
    }

    /// Collapse the branch set to a single branch.
    pub fn branch(&self, branch: usize) -> Result<DescriptorKey, ArgumentError> {
        let derivation = match &self.derivation {
            Some(d) => Some(d.branch(branch)?),
            None => None,
        };
        Ok(DescriptorKey {
            origin: self.origin.clone(),
            key: self.key.clone(),
            derivation,
        })
    }

    /// The public key this expression stands for. A template without a
    /// wildcard is followed (first branch); a wildcard must be derived first.
    pub fn public_key(&self) -> Result<PublicKey, ArgumentError> {
        match &self.key {
            KeyKind::Sec(pk) => Ok(*pk),
            KeyKind::Wif(sk, _) => Ok(sk.public_key()),
            KeyKind::PkHash(_) => Err(ArgumentError::HashOnly),
            KeyKind::Hd(hd) => match &self.derivation {
                None => Ok(hd.public_key()),
                Some(d) if d.is_wildcard() => Err(ArgumentError::UnresolvedWildcard),
                Some(d) => Ok(hd.derive(&d.fill(0, 0)?)?.public_key()),
            },
        }
    }

    pub fn sec(&self) -> Result<Vec<u8>, ArgumentError> {
        Ok(self.public_key()?.sec())
    }

    pub fn key_hash(&self) -> Result<[u8; 20], ArgumentError> {
        match &self.key {
            KeyKind::PkHash(h) => Ok(*h),
            _ => Ok(hash160(&self.sec()?)),
        }
    }

    /// Append `<sec>` as a script push.
    pub(crate) fn push_key(&self, out: &mut Vec<u8>) -> Result<(), ArgumentError> {
        push_data(out, &self.sec()?);
        Ok(())
    }

    /// Append `<HASH160(sec)>` as a script push.
    pub(crate) fn push_key_hash(&self, out: &mut Vec<u8>) -> Result<(), ArgumentError> {
        push_data(out, &self.key_hash()?);
        Ok(())
    }
}

fn parse_key_kind(s: &str, allow_hash: bool) -> Result<KeyKind, ArgumentError> {
    let invalid = |e: &dyn fmt::Display| ArgumentError::InvalidKey(format!("{}: {}", s, e));
    if (s.len() == 66 || s.len() == 130) && ["02", "03", "04"].iter().any(|p| s.starts_with(p)) {
        let bytes = hex::decode(s).map_err(|e| invalid(&e))?;
        return Ok(KeyKind::Sec(PublicKey::parse(&bytes)?));
    }
    if s.get(1..4).is_some_and(|m| m == "pub" || m == "prv") {
        return Ok(KeyKind::Hd(HDKey::from_base58(s)?));
    }
    if allow_hash && s.len() == 40 {
        let bytes = hex::decode(s).map_err(|e| invalid(&e))?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        return Ok(KeyKind::PkHash(hash));
    }
    let (sk, network) = PrivateKey::from_wif(s).map_err(|e| invalid(&e))?;
    Ok(KeyKind::Wif(sk, network))
}

fn key_text(key: &KeyKind) -> String {
    match key {
        KeyKind::Sec(pk) => pk.to_string(),
        KeyKind::Wif(sk, network) => sk.to_wif(*network),
        KeyKind::Hd(hd) => hd.to_base58(),
        KeyKind::PkHash(h) => hex::encode(h),
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(origin) = &self.origin {
            write!(f, "[{}]", origin)?;
        }
        f.write_str(&key_text(&self.key))?;
        if let Some(d) = &self.derivation {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

impl FromStr for DescriptorKey {
    type Err = ArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
