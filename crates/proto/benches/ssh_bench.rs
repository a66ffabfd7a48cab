//! SSH and SFTP performance benchmarks.
//!
//! Benchmarks packet sealing and opening per cipher suite and SFTP message
//! encoding and decoding.
//!
//! Run with: `cargo bench --bench ssh_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ferry_proto::ssh::crypto::{
    CipherAlgorithm, DirectionKeys, MacAlgorithm, OpeningContext, SealingContext,
};
use ferry_proto::ssh::packet::{decode_packet, encode_packet};
use ferry_proto::ssh::sftp::message::{decode_message, encode_message, Request, Response, SftpMessage};
use ferry_proto::ssh::sftp::{DirEntry, FileAttributes};

/// Channel data payload the size of a default SFTP chunk.
const PAYLOAD_SIZE: usize = 32 * 1024;

fn keys(cipher: CipherAlgorithm) -> DirectionKeys {
    DirectionKeys {
        cipher,
        mac: if cipher.is_aead() {
            None
        } else {
            Some(MacAlgorithm::HmacSha256)
        },
        iv: vec![0x24; cipher.iv_size()],
        key: vec![0x42; cipher.key_size()],
        mac_key: vec![0x17; 32],
    }
}

fn bench_packet_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_seal");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));
    let payload = vec![0x5a; PAYLOAD_SIZE];

    for cipher in CipherAlgorithm::ALL {
        let mut seal = SealingContext::new(&keys(cipher), 0).expect("sealing context");
        group.bench_with_input(BenchmarkId::from_parameter(cipher.name()), &payload, |b, payload| {
            b.iter(|| encode_packet(black_box(payload), &mut seal).expect("seal"))
        });
    }
    group.finish();
}

fn bench_packet_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_open");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let payload = vec![0x5a; PAYLOAD_SIZE];

    for cipher in CipherAlgorithm::ALL {
        group.bench_function(BenchmarkId::from_parameter(cipher.name()), |b| {
            // Contexts advance their sequence numbers, so each batch starts fresh
            b.iter_batched(
                || {
                    let mut seal = SealingContext::new(&keys(cipher), 0).expect("sealing context");
                    let wire = encode_packet(&payload, &mut seal).expect("seal");
                    let open = OpeningContext::new(&keys(cipher), 0).expect("opening context");
                    (wire, open)
                },
                |(wire, mut open)| {
                    runtime.block_on(async {
                        let mut stream = &wire[..];
                        decode_packet(&mut stream, &mut open).await.expect("open")
                    })
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_sftp_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("sftp_codec");

    let write = SftpMessage::Request {
        id: 7,
        request: Request::Write {
            handle: b"0".to_vec(),
            offset: 1 << 20,
            data: vec![0xa5; PAYLOAD_SIZE],
        },
    };
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));
    group.bench_function("encode_write", |b| b.iter(|| encode_message(black_box(&write))));

    let frame = encode_message(&write);
    group.bench_function("decode_write", |b| {
        b.iter(|| decode_message(black_box(&frame[4..])).expect("decode"))
    });

    let names = SftpMessage::Response {
        id: 8,
        response: Response::Name(
            (0..100)
                .map(|i| DirEntry::new(format!("file{:03}", i), FileAttributes::with_permissions(0o100644)))
                .collect(),
        ),
    };
    let frame = encode_message(&names);
    group.throughput(Throughput::Elements(100));
    group.bench_function("decode_name_100", |b| {
        b.iter(|| decode_message(black_box(&frame[4..])).expect("decode"))
    });
    group.finish();
}

criterion_group!(benches, bench_packet_seal, bench_packet_open, bench_sftp_codec);
criterion_main!(benches);
