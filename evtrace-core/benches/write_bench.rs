//! Benchmarks for the trace client
//!
//! Measures the write hot path (enqueue only) against decode of a snapshot.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde::{Deserialize, Serialize};

use evtrace_core::{decode, encode_line, Envelope, Event, LocalClient, TraceConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MempoolTx {
    hash: String,
    size: u32,
    peer: String,
}

impl Event for MempoolTx {
    fn table(&self) -> &str {
        "mempool_tx"
    }
}

fn sample(i: u32) -> MempoolTx {
    MempoolTx {
        hash: format!("{:064x}", i),
        size: 250 + i % 100,
        peer: "node-3".to_string(),
    }
}

fn bench_encode_line(c: &mut Criterion) {
    let envelope = Envelope {
        chain_id: "bench_chain".to_string(),
        node_id: "val-0".to_string(),
        table: "mempool_tx".to_string(),
        sequence: 42,
        timestamp: chrono::Utc::now(),
        msg: sample(42),
    };

    c.bench_function("encode_line", |b| {
        b.iter(|| black_box(encode_line(black_box(&envelope)).unwrap()))
    });
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");

    for buffer in [100usize, 10_000] {
        group.bench_function(BenchmarkId::new("buffer", buffer), |b| {
            let dir = tempfile::tempdir().unwrap();
            let config = TraceConfig::new()
                .tables("mempool_tx")
                .buffer_size(buffer)
                .trace_dir(dir.path());
            let client = LocalClient::new(config, "bench_chain", "val-0").unwrap();

            let mut i = 0u32;
            b.iter(|| {
                i = i.wrapping_add(1);
                black_box(client.write(sample(i)).unwrap())
            });

            client.close().unwrap();
        });
    }

    group.finish();
}

fn bench_decode_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let config = TraceConfig::new()
        .tables("mempool_tx")
        .trace_dir(dir.path());
    let client = LocalClient::new(config, "bench_chain", "val-0").unwrap();
    for i in 0..1000 {
        client.write(sample(i)).unwrap();
    }
    client.close().unwrap();

    c.bench_function("decode_1000_events", |b| {
        b.iter(|| {
            let reader = client.read_table("mempool_tx").unwrap();
            let decoded = decode::<MempoolTx, _>(reader).unwrap();
            black_box(decoded.events.len())
        })
    });
}

criterion_group!(benches, bench_encode_line, bench_write, bench_decode_snapshot);
criterion_main!(benches);
