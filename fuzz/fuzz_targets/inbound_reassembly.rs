#![no_main]

use gwatch_codec::frame::{FrameKind, stream_decode};
use gwatch_core::connection::{ConnectionInstance, Role};
use libfuzzer_sys::fuzz_target;

const MAX_MESSAGE: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    let conn = ConnectionInstance::new(Role::Gtrace, None, 4096, MAX_MESSAGE);
    let mut buffer = data.to_vec();
    while let Ok(Some(frame)) = stream_decode(&mut buffer, MAX_MESSAGE) {
        if frame.kind == FrameKind::Handshake {
            continue;
        }
        if let Ok(Some(message)) = conn.on_frame(&frame) {
            assert!(message.len() <= MAX_MESSAGE);
        }
    }
    assert!(conn.inbound_len() <= MAX_MESSAGE);
});
