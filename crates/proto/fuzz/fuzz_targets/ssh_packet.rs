//! Fuzz target for SSH packet decoding.
//!
//! Feeds arbitrary bytes to the plaintext packet parser and to the stream
//! decoder used before keys are in place. Neither may panic or hang.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use ferry_proto::ssh::crypto::OpeningContext;
use ferry_proto::ssh::packet::decode_packet;
use ferry_proto::ssh::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data, 8, false) {
        let serialized = packet.to_bytes();
        let reparsed =
            Packet::from_bytes(&serialized, 8, false).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let mut stream = data;
        let mut open = OpeningContext::none();
        let _ = decode_packet(&mut stream, &mut open).await;
    });
});
