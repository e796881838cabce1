//! Throughput of the row parser, the parallel file reducer and record merging

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use trc_aggregator::aggregate::{aggregate_range, FileReducer};
use trc_aggregator::model::{merge, Aggregates, ProcessRecord};

/// Rows over `stations` distinct names with values in [-99.9, 99.9]
fn generate_rows(rows: usize, stations: usize) -> Vec<u8> {
    let mut out = String::with_capacity(rows * 16);
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for _ in 0..rows {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let station = (state % stations as u64) as usize;
        let tenths = (state >> 32) % 1999;
        let value = tenths as i64 - 999;
        let sign = if value < 0 { "-" } else { "" };
        out.push_str(&format!(
            "station-{station};{sign}{}.{}\n",
            value.abs() / 10,
            value.abs() % 10
        ));
    }
    out.into_bytes()
}

fn bench_row_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_parser");

    for stations in [10, 400, 10_000] {
        let data = generate_rows(200_000, stations);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("stations", stations), &data, |b, data| {
            b.iter(|| black_box(aggregate_range(black_box(data))))
        });
    }

    group.finish();
}

fn bench_file_reducer(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_reducer");
    let data = generate_rows(1_000_000, 400);
    group.throughput(Throughput::Bytes(data.len() as u64));

    for parallelism in [1, 2, 4, 8] {
        let reducer = FileReducer::new(parallelism);
        group.bench_with_input(
            BenchmarkId::new("parallelism", parallelism),
            &data,
            |b, data| b.iter(|| black_box(reducer.reduce(black_box(data)))),
        );
    }

    group.finish();
}

fn bench_record_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_merge");

    let files: Vec<Aggregates> = (0..64)
        .map(|i| aggregate_range(&generate_rows(5_000, 400 + i)).aggregates)
        .collect();

    group.bench_function("fold_aggregates", |b| {
        b.iter(|| {
            black_box(
                files
                    .iter()
                    .cloned()
                    .fold(Aggregates::new(), merge),
            )
        })
    });

    group.bench_function("apply_files", |b| {
        b.iter(|| {
            let mut record = ProcessRecord::new("bench");
            record.set_expected(files.len() as u64);
            for (i, aggregate) in files.iter().enumerate() {
                record.apply_file(&format!("file-{i}"), aggregate.clone());
            }
            black_box(record)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_row_parser, bench_file_reducer, bench_record_merge);

criterion_main!(benches);
