//! Benchmarks for consistent reads of the shared region
//!
//! Measures:
//! - Latest data buffer copy with no concurrent writer
//! - The same copy while a writer thread rotates buffers continuously
//! - Session info read and typed parse
//! - Variable table decoding
//!
//! Platform: Cross-platform (uses the in-process local simulator)

use criterion::{Criterion, criterion_group, criterion_main};
use pitwall_connect::data::{DataFileHeader, SessionInfoText, VariableTable, read_latest_buffer_into};
use pitwall_connect::test_utils::{sample_frame, sample_simulator};
use pitwall_connect::{LocalSimulator, SharedRegion};
use serde::Deserialize;
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WeekendInfo {
    track_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Session {
    weekend_info: WeekendInfo,
}

fn started_simulator() -> LocalSimulator {
    let simulator = sample_simulator().expect("Failed to build simulator");
    simulator.start();
    simulator.publish_frame(&sample_frame(&simulator, 1).expect("Failed to encode frame")).expect("Failed to publish");
    simulator
}

fn bench_buffer_reads(c: &mut Criterion) {
    let simulator = started_simulator();
    let memory = simulator.memory();
    let region: &dyn SharedRegion = &*memory;

    let mut group = c.benchmark_group("buffer_read");

    group.bench_function("uncontended", |b| {
        let mut buffer = Vec::new();
        b.iter(|| {
            let snapshot = read_latest_buffer_into(region, &mut buffer).unwrap();
            black_box(snapshot)
        })
    });

    let running = Arc::new(AtomicBool::new(true));
    let writer = {
        let simulator = simulator.clone();
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut step = 0u32;
            while running.load(Ordering::Relaxed) {
                step = step.wrapping_add(1);
                let frame = sample_frame(&simulator, step).expect("Failed to encode frame");
                simulator.publish_frame(&frame).expect("Failed to publish");
            }
        })
    };

    group.bench_function("with_rotating_writer", |b| {
        let mut buffer = Vec::new();
        b.iter(|| {
            let snapshot = read_latest_buffer_into(region, &mut buffer).unwrap();
            black_box(snapshot.retries)
        })
    });

    running.store(false, Ordering::Relaxed);
    writer.join().expect("Writer thread panicked");
    group.finish();
}

fn bench_session_info(c: &mut Criterion) {
    let simulator = started_simulator();
    let memory = simulator.memory();

    let mut group = c.benchmark_group("session_info");

    group.bench_function("read", |b| {
        b.iter(|| black_box(SessionInfoText::read(&*memory).unwrap()))
    });

    let text = SessionInfoText::read(&*memory).unwrap();
    group.bench_function("parse", |b| {
        b.iter(|| {
            let session: Session = text.parse().unwrap();
            black_box(session.weekend_info.track_name)
        })
    });

    group.finish();
}

fn bench_variable_table(c: &mut Criterion) {
    let simulator = started_simulator();
    let memory = simulator.memory();
    let header = DataFileHeader::read_validated(&*memory).unwrap();

    c.bench_function("variable_table_read", |b| {
        b.iter(|| black_box(VariableTable::read(&*memory, &header).unwrap()))
    });
}

criterion_group!(benches, bench_buffer_reads, bench_session_info, bench_variable_table);
criterion_main!(benches);
