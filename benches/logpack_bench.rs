// Logpack pipeline performance benchmarks.
// Covers checksum throughput, header encode/decode, and the builder's
// per-write hot path across a range of batch sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use parking_lot::Mutex;
use std::sync::Arc;
use walb_core::bio_wrapper::BioWrapper;
use walb_core::builder::LogpackBuilder;
use walb_core::checksum;
use walb_core::config::WalbConfig;
use walb_core::device::Bio;
use walb_core::logpack::{LogRecord, LogpackHeader, RecordFlags};

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [512usize, 4096, 65536] {
        let data = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(checksum::checksum(&data, 0x1234_5678)));
        });
    }

    group.finish();
}

fn bench_header_round_trip(c: &mut Criterion) {
    let mut header = LogpackHeader::new(42);
    header.total_io_size_pb = 1;
    header.records.push(LogRecord {
        flags: RecordFlags::EXIST,
        checksum: 0xdead_beef,
        lsid: 43,
        lsid_local: 0,
        io_size_lb: 8,
        offset_lb: 0,
    });

    c.bench_function("header_encode", |b| {
        b.iter(|| black_box(header.encode(4096, 7)));
    });

    let block = header.encode(4096, 7);
    c.bench_function("header_decode", |b| {
        b.iter(|| black_box(LogpackHeader::decode(block.clone(), 7, 4096).unwrap()));
    });
}

fn bench_builder_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("builder_add");

    for batch in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let mut cfg = WalbConfig::default();
                cfg.physical_block_size = 4096;
                cfg.ring_buffer_size = 1024 * 1024;
                cfg.max_logpack_pb = 256;
                let mut builder = LogpackBuilder::new(cfg, 0);

                for i in 0..batch {
                    let wrapper = Arc::new(Mutex::new(BioWrapper::new(
                        Bio::new_write((i as u64) * 8, vec![0u8; 4096]),
                        0,
                    )));
                    black_box(builder.add(wrapper).unwrap());
                }
                black_box(builder.flush_open());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_checksum, bench_header_round_trip, bench_builder_throughput);
criterion_main!(benches);
