use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use collectq_core::WorkerId;
use collectq_infra::jobs::{InMemoryJobStore, JobStore, JobType, NewJob};
use collectq_infra::reaper::{ReaperConfig, StuckJobReaper};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime")
}

async fn seeded(n: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    for i in 0..n {
        let job_type = if i % 2 == 0 { JobType::IngestCsv } else { JobType::Enrich };
        store
            .enqueue(NewJob::new(job_type, serde_json::json!({ "row": i })))
            .await
            .expect("enqueue");
    }
    store
}

fn bench_claim_complete(c: &mut Criterion) {
    let rt = runtime();
    let worker: WorkerId = "bench-worker".parse().expect("worker id");
    let mut group = c.benchmark_group("claim_complete");

    for depth in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let store = rt.block_on(seeded(depth));
            b.iter(|| {
                rt.block_on(async {
                    let job = store
                        .claim_next(&JobType::IngestCsv, &worker)
                        .await
                        .expect("claim");
                    if let Some(job) = job {
                        // Keep the queue depth constant.
                        store
                            .complete(job.id, serde_json::Value::Null)
                            .await
                            .expect("complete");
                        store
                            .enqueue(NewJob::new(JobType::IngestCsv, black_box(job.payload)))
                            .await
                            .expect("enqueue");
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_reaper_sweep(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("reaper_sweep");

    for stuck in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(stuck as u64));
        group.bench_with_input(BenchmarkId::from_parameter(stuck), &stuck, |b, &stuck| {
            b.iter_batched(
                || {
                    rt.block_on(async {
                        let store = seeded(stuck * 2).await;
                        let dead: WorkerId = "dead-worker".parse().expect("worker id");
                        for _ in 0..stuck {
                            store.claim_next(&JobType::IngestCsv, &dead).await.expect("claim");
                        }
                        StuckJobReaper::new(
                            store,
                            ReaperConfig {
                                batch_size: stuck,
                                ..ReaperConfig::default()
                            },
                        )
                    })
                },
                |reaper| {
                    let later = chrono::Utc::now() + chrono::Duration::days(1);
                    rt.block_on(reaper.sweep_at(later)).expect("sweep")
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_claim_complete, bench_reaper_sweep);
criterion_main!(benches);
