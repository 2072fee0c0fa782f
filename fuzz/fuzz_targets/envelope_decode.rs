#![no_main]

use gwatch_codec::{CapsuleEnvelope, GtraceEnvelope, ProfilerEnvelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = GtraceEnvelope::decode_bytes(data) {
        let text = envelope.encode().expect("decoded envelope re-encodes");
        let again = GtraceEnvelope::decode(&text).expect("re-encoded envelope decodes");
        assert_eq!(again.type_id(), envelope.type_id());
    }
    let _ = CapsuleEnvelope::decode_bytes(data);
    let _ = ProfilerEnvelope::decode_bytes(data);
});
