use bytes::{BufMut, Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use poolp2p::checksum::{ChecksumType, Checksummer};
use poolp2p::streaming::protocol::{
    encode_data_block, encode_data_header, encode_data_trailer, Ack, MessageType,
};
use poolp2p::streaming::{Receiver, ReceiverConfig};
use tokio::io::AsyncWriteExt;

/// Everything a source mover sends for one file, after the session id.
fn mover_script(data: &[u8], block_size: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 1024);
    buf.put_i32(0);
    buf.put_slice(&Ack::located(data.len() as u64, 0).encode());
    buf.put_slice(&Ack::ok(MessageType::Ack, MessageType::Read).encode());
    buf.put_slice(&encode_data_header());
    for block in data.chunks(block_size) {
        buf.put_slice(&encode_data_block(block));
    }
    buf.put_slice(&encode_data_trailer());
    buf.put_slice(&Ack::ok(MessageType::Fin, MessageType::Read).encode());
    buf.put_slice(&Ack::ok(MessageType::Ack, MessageType::Close).encode());
    buf.freeze()
}

fn bench_ack_decode(c: &mut Criterion) {
    let ok = Ack::located(1 << 30, 0).encode().slice(8..);
    let err = Ack::error(MessageType::Ack, MessageType::Read, 33, "Disk read error")
        .encode()
        .slice(8..);

    c.bench_function("ack_decode_ok", |b| {
        b.iter(|| Ack::decode(MessageType::Ack, black_box(ok.clone())).unwrap())
    });
    c.bench_function("ack_decode_error", |b| {
        b.iter(|| Ack::decode(MessageType::Ack, black_box(err.clone())).unwrap())
    });
}

fn bench_checksum(c: &mut Criterion) {
    let data = vec![0xA5u8; 1024 * 1024];
    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for kind in [ChecksumType::Xxh3, ChecksumType::Blake3] {
        group.bench_with_input(BenchmarkId::from_parameter(kind), &data, |b, data| {
            b.iter(|| {
                let mut hasher = Checksummer::new(kind);
                for chunk in data.chunks(64 * 1024) {
                    hasher.update(black_box(chunk));
                }
                hasher.finish()
            })
        });
    }
    group.finish();
}

fn bench_receive(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("receive");

    for size in [64 * 1024, 4 * 1024 * 1024] {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let script = mover_script(&data, 64 * 1024);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &script, |b, script| {
            b.to_async(&rt).iter(|| async {
                let (mut local, mut remote) = tokio::io::duplex(256 * 1024);
                let script = script.clone();
                let writer = tokio::spawn(async move {
                    remote.write_all(&script).await.unwrap();
                    remote
                });

                let receiver = Receiver::new(ReceiverConfig {
                    expected_size: size as u64,
                    buffer_size: 256 * 1024,
                    checksum: Some(ChecksumType::Xxh3),
                });
                let mut sink = tokio::io::sink();
                let report = receiver.receive(&mut local, &mut sink).await.unwrap();
                writer.await.unwrap();
                black_box(report)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ack_decode, bench_checksum, bench_receive);
criterion_main!(benches);
