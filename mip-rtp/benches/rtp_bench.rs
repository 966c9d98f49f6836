use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mip_core::MediaTime;
use mip_rtp::packet::RtpPacket;
use mip_rtp::reassembly::{Fragment, Reassembler, DEFAULT_WINDOW_SIZE};
use mip_rtp::timestamp::TimestampUnwrapper;

fn bench_packet_parse(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 960]);
    let bytes = RtpPacket::new(11, 1000, 160_000, 0xCAFE, payload)
        .to_bytes()
        .unwrap()
        .freeze();

    let mut group = c.benchmark_group("rtp_packet");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("parse", |b| {
        b.iter(|| {
            let packet = RtpPacket::from_bytes(black_box(&bytes)).unwrap();
            black_box(packet);
        });
    });
    group.finish();
}

fn bench_timestamp_unwrap(c: &mut Criterion) {
    c.bench_function("timestamp_unwrap_across_wrap", |b| {
        b.iter(|| {
            let mut unwrapper = TimestampUnwrapper::new(0xFFFF_0000);
            let mut ts = 0xFFFF_0000u32;
            for _ in 0..1024 {
                ts = ts.wrapping_add(160);
                black_box(unwrapper.unwrap(black_box(ts)));
            }
        });
    });
}

fn bench_reassembly(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 1200]);

    c.bench_function("reassemble_4_fragment_frames", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new(DEFAULT_WINDOW_SIZE).unwrap();
            for frame in 0..64u64 {
                // Deliver each frame's fragments in reverse order
                for part in (0..4u64).rev() {
                    reassembler.insert(
                        (frame * 3000) as u32,
                        Fragment {
                            sequence: frame * 4 + part,
                            payload: payload.clone(),
                            received_at: MediaTime::ZERO,
                            marker: part == 3,
                            first: part == 0,
                        },
                    );
                }
                while let Some(frame) = reassembler.pop_frame() {
                    black_box(frame);
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_packet_parse,
    bench_timestamp_unwrap,
    bench_reassembly
);
criterion_main!(benches);
