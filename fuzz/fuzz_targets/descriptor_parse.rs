#![no_main]

use airsign_descriptor::Descriptor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Descriptor text, including miniscript fragments, must never panic.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(desc) = Descriptor::parse(s) {
            let _ = desc.to_string();
            let _ = desc.derive(0, 0).and_then(|d| d.script_pubkey());
        }
    }
});
