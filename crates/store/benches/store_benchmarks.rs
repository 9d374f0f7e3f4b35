use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use fieldqueue_store::{EntryStore, InMemoryEntryStore, SqliteEntryStore};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

async fn fill(store: &dyn EntryStore, n: usize) -> anyhow::Result<()> {
    for i in 0..n {
        store
            .enqueue("requests", "POST", json!({"title": "Water", "n": i}))
            .await?;
    }
    Ok(())
}

/// Deliver everything in the queue, oldest first.
async fn drain(store: &dyn EntryStore) -> anyhow::Result<usize> {
    let mut delivered = 0;
    while let Some(entry) = store.peek_oldest_pending().await? {
        store.mark_in_flight(entry.id).await?;
        store.mark_completed(entry.id).await?;
        delivered += 1;
    }
    Ok(delivered)
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");

    for size in [10usize, 100] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("in_memory", size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryEntryStore::new();
                    fill(&store, black_box(size)).await.expect("fill");
                })
            })
        });

        group.bench_with_input(BenchmarkId::new("sqlite_file", size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let dir = tempfile::tempdir().expect("tempdir");
                    let store = SqliteEntryStore::open(dir.path().join("queue.db"))
                        .await
                        .expect("open");
                    fill(&store, black_box(size)).await.expect("fill");
                    store.close().await;
                })
            })
        });
    }

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("drain");

    for size in [10usize, 100] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("sqlite_memory", size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let store = SqliteEntryStore::open_in_memory().await.expect("open");
                    fill(&store, size).await.expect("fill");
                    let delivered = drain(&store).await.expect("drain");
                    assert_eq!(black_box(delivered), size);
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_drain);
criterion_main!(benches);
