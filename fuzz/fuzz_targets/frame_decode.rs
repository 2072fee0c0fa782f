#![no_main]

use gwatch_codec::frame::{decode_frame, encode_frame, stream_decode};
use libfuzzer_sys::fuzz_target;

const MAX_CHUNK: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = decode_frame(data, MAX_CHUNK) {
        let bytes = encode_frame(frame.kind, &frame.data).expect("decoded frame re-encodes");
        let again = decode_frame(bytes.as_slice(), MAX_CHUNK).expect("re-encoded frame decodes");
        assert_eq!(again.data, frame.data);
    }

    let mut buffer = data.to_vec();
    while let Ok(Some(_)) = stream_decode(&mut buffer, MAX_CHUNK) {}
});
