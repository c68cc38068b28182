//! Hostile ciphertexts against a live session: decryption may fail but must
//! not panic or disturb the session state.

#![no_main]

use libfuzzer_sys::fuzz_target;
use securecomm_core::RatchetConfig;
use securecomm_harness::ratchet_pair;

fuzz_target!(|data: &[u8]| {
    let (mut alice, mut bob) =
        ratchet_pair(0, RatchetConfig::default()).expect("fixture pair initializes");
    let before = bob.export_state().expect("export");

    if bob.decrypt(data, b"").is_err() {
        assert_eq!(bob.export_state().expect("export"), before);
    }

    // The session still works afterwards
    let ct = alice.encrypt(b"after fuzz", b"").expect("encrypt");
    let _ = bob.decrypt(&ct, b"");
});
