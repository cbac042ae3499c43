//! Turns collected partial signatures into final scriptSigs and witnesses.
//!
//! Supported spends: p2pkh, p2wpkh, p2sh-p2wpkh, and bare m-of-n
//! CHECKMULTISIG under p2sh, p2wsh or p2sh-p2wsh.

use airsign_core::ec::PublicKey;
use airsign_core::script::{self, decode_small_int, Script, ScriptType, Witness};

use crate::psbt::{InputScope, Psbt, PsbtError};
use crate::transaction::Transaction;

const OP_0: u8 = 0x00;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Threshold and keys of a `OP_m <keys> OP_n CHECKMULTISIG` script.
/// Returns `None` for anything else.
pub fn parse_multisig(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let data = script.as_bytes();
    if data.len() < 3 || data[data.len() - 1] != OP_CHECKMULTISIG {
        return None;
    }
    let m = decode_small_int(data[0])? as usize;
    let n = decode_small_int(data[data.len() - 2])? as usize;

    let body = &data[1..data.len() - 2];
    let mut pubkeys = Vec::with_capacity(n);
    let mut pos = 0;
    while pos < body.len() {
        let len = body[pos] as usize;
        if len != 33 && len != 65 {
            return None;
        }
        let sec = body.get(pos + 1..pos + 1 + len)?;
        pubkeys.push(PublicKey::parse(sec).ok()?);
        pos += 1 + len;
    }
    if pubkeys.len() != n || m > n {
        return None;
    }
    Some((m, pubkeys))
}

/// What to do with an input short of signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shortfall {
    Fail,
    /// Leave the input as it is.
    Skip,
    /// Assemble whatever signatures there are.
    Assemble,
}

impl Shortfall {
    fn allowed(self) -> bool {
        self != Shortfall::Fail
    }
}

#[derive(Debug, Default)]
struct Satisfaction {
    script_sig: Script,
    witness: Witness,
}

/// Fill `final_script_sig` / `final_script_witness` on every input that has
/// all the signatures it needs and drop the data finalization consumes.
/// Returns how many inputs are finalized afterwards.
///
/// With `allow_partial`, inputs short of signatures keep their partial
/// signatures and stay open for other cosigners. Without it, such an input
/// is an error and no input is modified.
pub fn finalize_inputs(psbt: &mut Psbt, allow_partial: bool) -> Result<usize, PsbtError> {
    let shortfall = if allow_partial {
        Shortfall::Skip
    } else {
        Shortfall::Fail
    };
    finalize_scopes(psbt, shortfall)
}

/// Finalize a copy of `psbt` and extract the network transaction.
///
/// With `allow_partial`, inputs short of signatures get a scriptSig or
/// witness built from the signatures they have.
pub fn finalize(psbt: &Psbt, allow_partial: bool) -> Result<Transaction, PsbtError> {
    let shortfall = if allow_partial {
        Shortfall::Assemble
    } else {
        Shortfall::Fail
    };
    let mut psbt = psbt.clone();
    finalize_scopes(&mut psbt, shortfall)?;
    Ok(extract(&psbt))
}

fn finalize_scopes(psbt: &mut Psbt, shortfall: Shortfall) -> Result<usize, PsbtError> {
    let mut satisfied = Vec::with_capacity(psbt.inputs.len());
    for i in 0..psbt.inputs.len() {
        if psbt.inputs[i].is_finalized() {
            satisfied.push(None);
            continue;
        }
        let spk = psbt.utxo(i)?.script_pubkey;
        satisfied.push(satisfy(&psbt.inputs[i], &spk, i, shortfall)?);
    }

    for (input, found) in psbt.inputs.iter_mut().zip(satisfied) {
        let Some(found) = found else { continue };
        input.final_script_sig = (!found.script_sig.is_empty()).then_some(found.script_sig);
        input.final_script_witness = (!found.witness.is_empty()).then_some(found.witness);
        input.partial_sigs.clear();
        input.bip32_derivations.clear();
        input.sighash_type = None;
        input.redeem_script = None;
        input.witness_script = None;
    }
    let finalized = psbt.inputs.iter().filter(|i| i.is_finalized()).count();
    log::info!("{} of {} inputs finalized", finalized, psbt.inputs.len());
    Ok(finalized)
}

/// The transaction with every final scriptSig and witness applied.
pub fn extract(psbt: &Psbt) -> Transaction {
    let mut tx = psbt.tx();
    for (txin, input) in tx.inputs.iter_mut().zip(&psbt.inputs) {
        if let Some(script_sig) = &input.final_script_sig {
            txin.script_sig = script_sig.clone();
        }
        if let Some(witness) = &input.final_script_witness {
            txin.witness = witness.clone();
        }
    }
    tx
}

fn satisfy(
    input: &InputScope,
    spk: &Script,
    index: usize,
    shortfall: Shortfall,
) -> Result<Option<Satisfaction>, PsbtError> {
    match spk.script_type() {
        ScriptType::P2pkh => {
            let Some((pubkey, sig)) = key_hash_sig(input, &spk.as_bytes()[3..23]) else {
                return missing(index, 0, 1, shortfall);
            };
            let mut script_sig = Vec::new();
            script::push_data(&mut script_sig, sig);
            script::push_data(&mut script_sig, &pubkey.sec());
            Ok(Some(Satisfaction {
                script_sig: Script::new(script_sig),
                ..Default::default()
            }))
        }
        ScriptType::P2wpkh => {
            let Some((pubkey, sig)) = key_hash_sig(input, &spk.as_bytes()[2..22]) else {
                return missing(index, 0, 1, shortfall);
            };
            Ok(Some(Satisfaction {
                witness: Witness::new(vec![sig.clone(), pubkey.sec()]),
                ..Default::default()
            }))
        }
        ScriptType::P2wsh => {
            let ws = input
                .witness_script
                .as_ref()
                .ok_or(PsbtError::UnsupportedScript(index))?;
            let Some(sigs) = multisig_sigs(input, ws, index, shortfall)? else {
                return Ok(None);
            };
            Ok(Some(Satisfaction {
                witness: multisig_witness(sigs, ws),
                ..Default::default()
            }))
        }
        ScriptType::P2sh => {
            let redeem = input
                .redeem_script
                .as_ref()
                .ok_or(PsbtError::UnsupportedScript(index))?;
            let mut redeem_push = Vec::new();
            script::push_data(&mut redeem_push, redeem.as_bytes());

            match redeem.script_type() {
                ScriptType::P2wpkh => {
                    let Some((pubkey, sig)) = key_hash_sig(input, &redeem.as_bytes()[2..22])
                    else {
                        return missing(index, 0, 1, shortfall);
                    };
                    Ok(Some(Satisfaction {
                        script_sig: Script::new(redeem_push),
                        witness: Witness::new(vec![sig.clone(), pubkey.sec()]),
                    }))
                }
                ScriptType::P2wsh => {
                    let ws = input
                        .witness_script
                        .as_ref()
                        .ok_or(PsbtError::UnsupportedScript(index))?;
                    let Some(sigs) = multisig_sigs(input, ws, index, shortfall)? else {
                        return Ok(None);
                    };
                    Ok(Some(Satisfaction {
                        script_sig: Script::new(redeem_push),
                        witness: multisig_witness(sigs, ws),
                    }))
                }
                _ => {
                    let Some(sigs) = multisig_sigs(input, redeem, index, shortfall)? else {
                        return Ok(None);
                    };
                    let mut script_sig = vec![OP_0];
                    for sig in sigs {
                        script::push_data(&mut script_sig, &sig);
                    }
                    script_sig.extend_from_slice(&redeem_push);
                    Ok(Some(Satisfaction {
                        script_sig: Script::new(script_sig),
                        ..Default::default()
                    }))
                }
            }
        }
        other => {
            log::warn!("Input {} spends an unsupported {} output", index, other.as_str());
            Err(PsbtError::UnsupportedScript(index))
        }
    }
}

fn key_hash_sig<'a>(input: &'a InputScope, hash: &[u8]) -> Option<(&'a PublicKey, &'a Vec<u8>)> {
    input
        .partial_sigs
        .iter()
        .find(|(pubkey, _)| pubkey.hash160().as_slice() == hash)
}

fn missing(
    index: usize,
    have: usize,
    need: usize,
    shortfall: Shortfall,
) -> Result<Option<Satisfaction>, PsbtError> {
    if shortfall.allowed() {
        log::debug!("Input {} left unfinalized with {} of {} signatures", index, have, need);
        return Ok(None);
    }
    Err(PsbtError::MissingSignatures {
        input: index,
        have,
        need,
    })
}

/// Up to `m` signatures in the script's key order. `None` when the input
/// is left as it is.
fn multisig_sigs(
    input: &InputScope,
    script: &Script,
    index: usize,
    shortfall: Shortfall,
) -> Result<Option<Vec<Vec<u8>>>, PsbtError> {
    let (m, pubkeys) = parse_multisig(script).ok_or(PsbtError::UnsupportedScript(index))?;
    let sigs: Vec<Vec<u8>> = pubkeys
        .iter()
        .filter_map(|pubkey| input.partial_sigs.get(pubkey).cloned())
        .take(m)
        .collect();
    if sigs.len() < m {
        match shortfall {
            Shortfall::Fail => {
                return Err(PsbtError::MissingSignatures {
                    input: index,
                    have: sigs.len(),
                    need: m,
                });
            }
            Shortfall::Skip => {
                log::debug!("Input {} left open with {} of {} signatures", index, sigs.len(), m);
                return Ok(None);
            }
            Shortfall::Assemble if sigs.is_empty() => return Ok(None),
            Shortfall::Assemble => {
                log::debug!("Input {} assembled with {} of {} signatures", index, sigs.len(), m);
            }
        }
    }
    Ok(Some(sigs))
}

/// `[<empty>, sig1..sigm, witness_script]`; the empty item is consumed by
/// the CHECKMULTISIG off-by-one.
fn multisig_witness(sigs: Vec<Vec<u8>>, witness_script: &Script) -> Witness {
    let mut items = Vec::with_capacity(sigs.len() + 2);
    items.push(Vec::new());
    items.extend(sigs);
    items.push(witness_script.as_bytes().to_vec());
    Witness::new(items)
}
