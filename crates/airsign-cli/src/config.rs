//! Signer configuration, parsed from a TOML file with environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use airsign_core::Network;
use airsign_psbt::{SighashType, TransportEncoding};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AirsignConfig {
    /// Key and signing settings
    #[serde(default)]
    pub signer: SignerSection,

    /// Wallet the PSBTs must belong to
    #[serde(default)]
    pub wallet: WalletSection,

    /// How signed PSBTs are written back
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerSection {
    /// "bitcoin", "testnet", "regtest" or "signet"
    #[serde(default = "default_network")]
    pub network: String,

    /// Derive the multisig account (m/48h/.../2h) instead of m/84h/...
    #[serde(default)]
    pub multisig: bool,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sighash requested when signing, e.g. "ALL" or "SINGLE|ANYONECANPAY"
    #[serde(default = "default_sighash")]
    pub default_sighash: String,
}

impl Default for SignerSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            multisig: false,
            log_level: default_log_level(),
            default_sighash: default_sighash(),
        }
    }
}

/// Wallet data, inline or from a file. Either is optional; without one a
/// single-sig wallet uses its own default descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletSection {
    /// Descriptor, JSON wallet or key-value export
    #[serde(default)]
    pub descriptor: Option<String>,

    /// Path to a file with the same content
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    /// "base64", "binary" or "hex"
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Also finalize and write the network transaction
    #[serde(default)]
    pub finalize: bool,

    /// Finalize multisig inputs below their threshold
    #[serde(default)]
    pub allow_partial: bool,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            finalize: false,
            allow_partial: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_network() -> String {
    "bitcoin".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_sighash() -> String {
    "ALL".into()
}

fn default_encoding() -> String {
    "base64".into()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl AirsignConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AirsignConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `AIRSIGN_NETWORK`
    /// - `AIRSIGN_MULTISIG`
    /// - `AIRSIGN_LOG_LEVEL`
    /// - `AIRSIGN_DESCRIPTOR`
    /// - `AIRSIGN_OUTPUT_ENCODING`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AIRSIGN_NETWORK") {
            self.signer.network = v;
        }
        if let Ok(v) = std::env::var("AIRSIGN_MULTISIG") {
            if let Ok(multisig) = v.parse::<bool>() {
                self.signer.multisig = multisig;
            }
        }
        if let Ok(v) = std::env::var("AIRSIGN_LOG_LEVEL") {
            self.signer.log_level = v;
        }
        if let Ok(v) = std::env::var("AIRSIGN_DESCRIPTOR") {
            // an inline descriptor replaces a configured file
            self.wallet.descriptor = Some(v);
            self.wallet.file = None;
        }
        if let Ok(v) = std::env::var("AIRSIGN_OUTPUT_ENCODING") {
            self.output.encoding = v;
        }
    }

    pub fn network(&self) -> Result<Network> {
        Ok(self.signer.network.parse::<Network>()?)
    }

    pub fn sighash(&self) -> Result<SighashType> {
        self.signer
            .default_sighash
            .parse::<SighashType>()
            .with_context(|| format!("Unknown sighash: {}", self.signer.default_sighash))
    }

    pub fn encoding(&self) -> Result<TransportEncoding> {
        match self.output.encoding.to_ascii_lowercase().as_str() {
            "base64" => Ok(TransportEncoding::Base64),
            "binary" | "raw" => Ok(TransportEncoding::Binary),
            "hex" => Ok(TransportEncoding::Hex),
            other => anyhow::bail!("Unknown output encoding: {}", other),
        }
    }

    /// Wallet data to load, read from `wallet.file` when set.
    pub fn wallet_data(&self) -> Result<Option<String>> {
        if let Some(ref descriptor) = self.wallet.descriptor {
            return Ok(Some(descriptor.trim().to_string()));
        }
        match self.wallet.file {
            Some(ref path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read wallet file: {}", path.display()))?;
                Ok(Some(data.trim().to_string()))
            }
            None => Ok(None),
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.network()?;
        self.sighash()?;
        self.encoding()?;

        anyhow::ensure!(
            !(self.wallet.descriptor.is_some() && self.wallet.file.is_some()),
            "wallet.descriptor and wallet.file are mutually exclusive"
        );
        if let Some(ref descriptor) = self.wallet.descriptor {
            anyhow::ensure!(
                !descriptor.trim().is_empty(),
                "wallet.descriptor must not be empty"
            );
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
