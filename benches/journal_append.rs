use std::sync::Arc;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use courier::file::NioSequentialFileFactory;
use courier::journal::{Journal, JournalConfig};

const APPENDS_PER_ITER: u64 = 10_000;

fn open_journal(path: &std::path::Path) -> Journal {
    let config = JournalConfig {
        file_size: 4 * 1024 * 1024,
        ..JournalConfig::default()
    };
    let journal = Journal::new(config, Arc::new(NioSequentialFileFactory::new(path))).expect("journal");
    journal.start().expect("start");
    journal.load().expect("load");
    journal
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_append");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let journal = open_journal(dir.path());
                    let payload = vec![0u8; size];
                    (dir, journal, payload)
                },
                |(_dir, journal, payload)| {
                    for id in 1..=APPENDS_PER_ITER {
                        journal
                            .append_add_record(id, 1, black_box(&payload), false)
                            .expect("append");
                    }
                    journal.flush().expect("flush");
                    journal.stop().expect("stop");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("journal_tx_commit");
    group.sample_size(20);
    group.bench_function("10_records_per_tx", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                let journal = open_journal(dir.path());
                (dir, journal)
            },
            |(_dir, journal)| {
                let payload = [0u8; 128];
                for tx in 0..100u64 {
                    let tx_id = 1_000_000 + tx;
                    for n in 0..10u64 {
                        journal
                            .append_add_record_transactional(tx_id, tx * 10 + n + 1, 1, &payload)
                            .expect("append");
                    }
                    journal.append_commit_record(tx_id, false).expect("commit");
                }
                journal.flush().expect("flush");
                journal.stop().expect("stop");
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_transactions);
criterion_main!(benches);
