use criterion::{criterion_group, criterion_main, Criterion};
use flywheel::{ThreadPool, ThreadPoolConfig};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Submission throughput: how fast items flow through the global queue and
/// back out of the pool
fn submit_throughput(c: &mut Criterion) {
    let pool = ThreadPool::with_config(ThreadPoolConfig {
        min_threads: 1,
        max_threads: std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4),
        ..Default::default()
    })
    .unwrap();

    c.bench_function("submit/global", |b| {
        b.iter_custom(|iterations| {
            let completed = Arc::new(AtomicUsize::new(0));
            let start = std::time::Instant::now();
            for _ in 0..iterations {
                let completed = completed.clone();
                pool.submit(move || drop(completed.fetch_add(1, Ordering::Relaxed)), false);
            }
            while completed.load(Ordering::Relaxed) < iterations as usize {
                std::hint::spin_loop();
            }
            start.elapsed()
        })
    });

    c.bench_function("submit/fan_out_from_worker", |b| {
        b.iter_custom(|iterations| {
            let completed = Arc::new(AtomicUsize::new(0));
            let start = std::time::Instant::now();
            {
                let completed = completed.clone();
                let inner = ThreadPool::global();
                inner.submit(
                    move || {
                        for _ in 0..iterations {
                            let completed = completed.clone();
                            ThreadPool::global().submit(
                                move || drop(completed.fetch_add(1, Ordering::Relaxed)),
                                true,
                            );
                        }
                    },
                    false,
                );
            }
            while completed.load(Ordering::Relaxed) < iterations as usize {
                std::hint::spin_loop();
            }
            start.elapsed()
        })
    });
}

criterion_group!(benches, submit_throughput);
criterion_main!(benches);
