#![no_main]

use libfuzzer_sys::fuzz_target;

static KEY: [u8; 32] = [0x42; 32];

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    // Plain and encrypted parsing must reject garbage without panicking.
    let _ = citadel_hsm::audit::sink::decode_batch(line, None);
    let _ = citadel_hsm::audit::sink::decode_batch(line, Some(&KEY));
});
