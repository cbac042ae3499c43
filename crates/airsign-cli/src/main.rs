//! AirSign: offline PSBT signer
//!
//! Loads the account key from a mnemonic, checks a PSBT against the
//! configured wallet, prints what it spends and writes the signed PSBT.
//!
//! # Usage
//!
//! ```bash
//! airsign --config airsign.toml sign tx.psbt -o tx-signed.psbt
//! airsign --config airsign.toml addresses --count 5
//! airsign xpub
//! airsign --config airsign.toml --check
//! ```

mod config;

use airsign_core::keys::AccountKey;
use airsign_psbt::{PsbtSigner, SignOptions, Wallet};
use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use zeroize::Zeroizing;

use config::AirsignConfig;

enum Command {
    Sign {
        psbt: PathBuf,
        out: Option<PathBuf>,
    },
    Addresses {
        change: bool,
        count: u32,
    },
    Xpub,
}

fn main() -> Result<()> {
    // Parse CLI args (minimal, no clap)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut check_only = false;
    let mut command: Option<Command> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--check" => {
                check_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("airsign {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "sign" => {
                command = Some(parse_sign(&args[i + 1..])?);
                break;
            }
            "addresses" => {
                command = Some(parse_addresses(&args[i + 1..])?);
                break;
            }
            "xpub" => {
                command = Some(Command::Xpub);
                break;
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(ref path) => AirsignConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AirsignConfig::default(),
    };
    config.apply_env_overrides();
    config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", &config.signer.log_level);
    }
    env_logger::init();

    if check_only {
        print_config(&config)?;
        return Ok(());
    }

    let command = match command {
        Some(command) => command,
        None => {
            print_help();
            anyhow::bail!("No command given");
        }
    };

    let wallet = open_wallet(&config)?;
    match command {
        Command::Sign { psbt, out } => sign(&config, &wallet, &psbt, out.as_deref()),
        Command::Addresses { change, count } => {
            let branch = usize::from(change);
            for (index, address) in wallet.addresses(0, Some(count), branch)?.enumerate() {
                println!("{:>4}  {}", index, address?);
            }
            Ok(())
        }
        Command::Xpub => {
            let key = wallet.key();
            println!("{}", key.key_expression());
            println!("{}", key.slip132_xpub());
            Ok(())
        }
    }
}

fn parse_sign(args: &[String]) -> Result<Command> {
    let mut psbt = None;
    let mut out = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-o" | "--out" => {
                i += 1;
                let path = args.get(i).context("-o requires a path argument")?;
                out = Some(PathBuf::from(path));
            }
            other if psbt.is_none() => psbt = Some(PathBuf::from(other)),
            other => anyhow::bail!("Unexpected argument: {}", other),
        }
        i += 1;
    }
    Ok(Command::Sign {
        psbt: psbt.context("sign requires a PSBT file")?,
        out,
    })
}

fn parse_addresses(args: &[String]) -> Result<Command> {
    let mut change = false;
    let mut count = 10;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--change" => change = true,
            "--count" | "-n" => {
                i += 1;
                let value = args.get(i).context("--count requires a number")?;
                count = value
                    .parse::<u32>()
                    .with_context(|| format!("Invalid count: {}", value))?;
            }
            other => anyhow::bail!("Unexpected argument: {}", other),
        }
        i += 1;
    }
    Ok(Command::Addresses { change, count })
}

/// Build the wallet from `AIRSIGN_MNEMONIC` (or the first line of stdin)
/// and load the configured wallet data.
fn open_wallet(config: &AirsignConfig) -> Result<Wallet> {
    let words = match std::env::var("AIRSIGN_MNEMONIC") {
        Ok(words) => Zeroizing::new(words),
        Err(_) => {
            eprint!("Mnemonic: ");
            std::io::stderr().flush().ok();
            let mut line = Zeroizing::new(String::new());
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read mnemonic from stdin")?;
            line
        }
    };
    let passphrase = Zeroizing::new(std::env::var("AIRSIGN_PASSPHRASE").unwrap_or_default());

    let key = AccountKey::from_mnemonic(
        words.trim(),
        &passphrase,
        config.network()?,
        config.signer.multisig,
    )
    .context("Failed to derive account key")?;
    log::info!(
        "Account {} on {}",
        hex::encode(key.fingerprint()),
        key.network()
    );

    let mut wallet = Wallet::new(key)?;
    if let Some(data) = config.wallet_data()? {
        wallet.load(&data).context("Failed to load wallet")?;
    }
    Ok(wallet)
}

fn sign(
    config: &AirsignConfig,
    wallet: &Wallet,
    path: &std::path::Path,
    out: Option<&std::path::Path>,
) -> Result<()> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read PSBT: {}", path.display()))?;
    let mut signer = PsbtSigner::new(wallet, &data).context("PSBT rejected")?;

    let label = wallet
        .label()
        .or(config.wallet.label.as_deref())
        .unwrap_or("wallet");
    println!("Wallet:  {}", label);
    println!("Policy:  {}", signer.policy());

    let summary = signer.outputs()?;
    for spend in &summary.spends {
        println!("Send:    {} sats to {}", spend.value, spend.address);
    }
    println!("Change:  {} sats", summary.change);
    println!("Fee:     {} sats", summary.fee);

    let options = SignOptions {
        sighash: Some(config.sighash()?),
        allow_sighash_override: false,
    };
    let added = signer.sign_with_options(options)?;
    println!("Signed:  {} signatures", added);

    signer.set_encoding(config.encoding()?);
    let out = out
        .map(PathBuf::from)
        .unwrap_or_else(|| path.with_extension("signed.psbt"));
    std::fs::write(&out, signer.psbt_bytes())
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Written: {}", out.display());

    if config.output.finalize {
        let tx = signer.finalize(config.output.allow_partial)?;
        let tx_path = out.with_extension("tx");
        std::fs::write(&tx_path, hex::encode(tx.serialize()))
            .with_context(|| format!("Failed to write {}", tx_path.display()))?;
        println!("Final:   {} ({})", tx.txid_hex(), tx_path.display());
    }
    Ok(())
}

fn print_config(config: &AirsignConfig) -> Result<()> {
    println!("Configuration is valid.");
    println!("  Network:   {}", config.network()?);
    let account = if config.signer.multisig {
        "multisig (m/48h/.../0h/2h)"
    } else {
        "single-sig (m/84h/.../0h)"
    };
    println!("  Account:   {}", account);
    println!("  Sighash:   {}", config.sighash()?);
    match config.wallet_data()? {
        Some(data) => println!("  Wallet:    {}…", &data[..floor_char_boundary(&data, 60)]),
        None => println!("  Wallet:    default"),
    }
    println!("  Encoding:  {:?}", config.encoding()?);
    println!("  Finalize:  {}", config.output.finalize);
    Ok(())
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    (0..=max.min(s.len()))
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0)
}

fn print_help() {
    println!(
        r#"AirSign: offline PSBT signer

USAGE:
    airsign [OPTIONS] <COMMAND>

COMMANDS:
    sign <PSBT> [-o OUT]           Review and sign a PSBT file (binary, base64, base58 or hex)
    addresses [--change] [--count N]
                                   Print wallet addresses (default 10 receive addresses)
    xpub                           Print the account key expression and SLIP-132 xpub

OPTIONS:
    -c, --config <PATH>   Config file path (defaults apply without one)
    --check               Validate the configuration and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES:
    AIRSIGN_MNEMONIC          BIP39 mnemonic (read from stdin when unset)
    AIRSIGN_PASSPHRASE        BIP39 passphrase
    AIRSIGN_NETWORK           Bitcoin network (bitcoin/testnet/signet/regtest)
    AIRSIGN_MULTISIG          Use the multisig account (true/false)
    AIRSIGN_LOG_LEVEL         Log level (error/warn/info/debug/trace)
    AIRSIGN_DESCRIPTOR        Wallet descriptor or export, replaces [wallet]
    AIRSIGN_OUTPUT_ENCODING   Signed PSBT encoding (base64/binary/hex)
"#
    );
}
