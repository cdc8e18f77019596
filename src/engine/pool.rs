// src/engine/pool.rs
//
// Global thread pool for `Concurrency::Parallel` batches.
//
// One pool for the whole process, built lazily on first use. Thread count
// follows std::thread::available_parallelism() (respects cgroup quotas) and
// can be capped with LEAN_IMAGE_THREADS. Changes after initialization have
// no effect.

use rayon::ThreadPool;
use std::sync::OnceLock;

/// Minimum number of rayon threads
const MIN_THREADS: usize = 1;

/// Upper bound for LEAN_IMAGE_THREADS
pub const MAX_THREADS: usize = 256;

static GLOBAL_THREAD_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

/// The shared batch pool, or None if no pool could be built at all (callers
/// then fall back to sequential processing).
pub fn get_pool() -> Option<&'static ThreadPool> {
    GLOBAL_THREAD_POOL
        .get_or_init(|| {
            let num_threads = thread_count(std::env::var("LEAN_IMAGE_THREADS").ok().as_deref());
            match rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .thread_name(|i| format!("lean-image-worker-{i}"))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(error = %e, num_threads, "batch pool build failed, retrying with one thread");
                    rayon::ThreadPoolBuilder::new()
                        .num_threads(MIN_THREADS)
                        .build()
                        .map_err(|e| tracing::error!(error = %e, "fallback batch pool build failed"))
                        .ok()
                }
            }
        })
        .as_ref()
}

fn thread_count(env_override: Option<&str>) -> usize {
    let detected = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_THREADS);
    match env_override.and_then(|raw| raw.trim().parse::<usize>().ok()) {
        Some(0) | None => detected.max(MIN_THREADS),
        Some(n) => n.min(MAX_THREADS),
    }
}
