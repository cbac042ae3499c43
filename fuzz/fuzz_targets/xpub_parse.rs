#![no_main]

use airsign_core::bip32::HDKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw 78-byte serializations and base58 strings.
    let _ = HDKey::parse(data);
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(key) = HDKey::from_base58(s) {
            assert_eq!(HDKey::from_base58(&key.to_base58()).ok(), Some(key));
        }
    }
});
