//! IPC codec throughput benchmark.
//!
//! Measures frame write/read latency for the async (broker) and blocking
//! (worker client) paths, and the msgpack cost of a typical request.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use jeeves_procvisor::ipc::codec::{
    decode, encode, read_frame, read_frame_blocking, write_frame, write_frame_blocking,
    MSG_REQUEST,
};
use jeeves_procvisor::ipc::Request;
use jeeves_procvisor::ExecutionContext;
use serde_json::json;
use std::io::Cursor;
use std::time::Duration;

const MAX_FRAME: u32 = 5 * 1024 * 1024;
const PAYLOAD_SIZES: &[usize] = &[0, 64, 1024, 4096, 65536];

fn bench_write_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("write_frame");
    for &size in PAYLOAD_SIZES {
        let payload = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::new("async", size), &payload, |b, p| {
            b.iter(|| {
                rt.block_on(async {
                    let mut buf = Vec::with_capacity(size + 5);
                    write_frame(&mut buf, MSG_REQUEST, black_box(p)).await.unwrap();
                    buf
                })
            });
        });
        group.bench_with_input(BenchmarkId::new("blocking", size), &payload, |b, p| {
            b.iter(|| {
                let mut buf = Vec::with_capacity(size + 5);
                write_frame_blocking(&mut buf, MSG_REQUEST, black_box(p)).unwrap();
                buf
            });
        });
    }
    group.finish();
}

fn bench_read_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("read_frame");
    for &size in PAYLOAD_SIZES {
        // Pre-build the wire frame
        let payload = vec![0xABu8; size];
        let mut wire = Vec::new();
        write_frame_blocking(&mut wire, MSG_REQUEST, &payload).unwrap();

        group.bench_with_input(BenchmarkId::new("async", size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    read_frame(&mut cursor, MAX_FRAME).await.unwrap()
                })
            });
        });
        group.bench_with_input(BenchmarkId::new("blocking", size), &wire, |b, w| {
            b.iter(|| {
                let mut cursor = Cursor::new(black_box(w.as_slice()));
                read_frame_blocking(&mut cursor, MAX_FRAME).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_request_round_trip(c: &mut Criterion) {
    let request = Request::QueuePush {
        name: "jobs".to_string(),
        item: json!({"url": "https://example.org/a", "depth": 2}),
        ctx: ExecutionContext::new(Duration::from_secs(30)),
    };

    c.bench_function("queue_push_round_trip", |b| {
        b.iter(|| {
            let body = encode(black_box(&request)).unwrap();
            let mut buf = Vec::with_capacity(body.len() + 5);
            write_frame_blocking(&mut buf, MSG_REQUEST, &body).unwrap();
            let (_, payload) = read_frame_blocking(&mut Cursor::new(buf), MAX_FRAME)
                .unwrap()
                .unwrap();
            decode::<Request>(&payload).unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_write_frame,
    bench_read_frame,
    bench_request_round_trip
);
criterion_main!(benches);
