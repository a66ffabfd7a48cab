//! Fuzz target for SFTP message decoding.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run sftp_message -- -max_total_time=300
//! ```

#![no_main]
use ferry_proto::ssh::sftp::message::{decode_message, encode_message, request_id, FrameBuffer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = request_id(data);

    if let Ok(msg) = decode_message(data) {
        // Whatever decodes must encode and decode to the same message
        let frame = encode_message(&msg);
        let again = decode_message(&frame[4..]).expect("re-encoded message must decode");
        assert_eq!(msg, again);
    }

    let mut frames = FrameBuffer::new();
    frames.extend(data);
    while let Ok(Some(body)) = frames.next_frame() {
        let _ = decode_message(&body);
    }
});
