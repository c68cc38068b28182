//! Arbitrary bytes must never panic the envelope decoder, and anything it
//! accepts must re-encode to an envelope that decodes to the same value.

#![no_main]

use libfuzzer_sys::fuzz_target;
use securecomm_proto::Envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::deserialize(data) else {
        return;
    };
    let Ok(wire) = envelope.serialize() else {
        return;
    };
    let reparsed = Envelope::deserialize(&wire).expect("re-encoded envelope must decode");
    assert_eq!(reparsed, envelope);
});
