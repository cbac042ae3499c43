#![no_main]

use airsign_psbt::signer::decode_psbt;
use airsign_psbt::Psbt;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Binary PSBTs and every text transport must parse to Ok or Err, never panic.
    if let Ok(psbt) = Psbt::parse(data) {
        let _ = Psbt::parse(&psbt.serialize());
        let _ = psbt.fee();
        let _ = psbt.verify();
        let _ = psbt.trimmed().to_base64();
    }
    let _ = decode_psbt(data);
});
