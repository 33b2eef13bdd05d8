use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use graphite_backend::metrics::{MetricsCollector, SampleResult, ThreadTracker};

// ─── Simulated samplers ──────────────────────────────────────────

/// (label, base latency ms, jitter ms, error rate)
const SAMPLERS: &[(&str, u64, u64, f64)] = &[
    ("home page", 15, 10, 0.01),
    ("login", 40, 30, 0.02),
    ("search.results", 80, 120, 0.05),
    ("checkout\\pay", 120, 200, 0.08),
];

// ─── Public entry point ──────────────────────────────────────────

/// Spawns `users` Tokio tasks that play synthetic requests until the
/// deadline or the `running` flag is set to false.
pub async fn run(
    running: Arc<AtomicBool>,
    collector: Arc<MetricsCollector>,
    threads: Arc<ThreadTracker>,
    users: u32,
    duration_secs: u64,
) {
    let deadline = Instant::now() + Duration::from_secs(duration_secs);

    let mut handles = Vec::with_capacity(users as usize);

    for user_id in 0..users {
        let running = running.clone();
        let collector = collector.clone();
        let threads = threads.clone();

        handles.push(tokio::spawn(async move {
            threads.thread_started();
            virtual_user(user_id, &running, &collector, &threads, deadline).await;
            threads.thread_finished();
        }));
    }

    // Wait for all users to finish
    for h in handles {
        let _ = h.await;
    }

    running.store(false, Ordering::SeqCst);
}

// ─── Virtual user loop ───────────────────────────────────────────

async fn virtual_user(
    id: u32,
    running: &AtomicBool,
    collector: &MetricsCollector,
    threads: &ThreadTracker,
    deadline: Instant,
) {
    // Each user gets its own deterministic RNG seeded uniquely.
    let mut rng = StdRng::seed_from_u64(1000 + id as u64);

    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
        let (label, base, jitter, error_rate) = SAMPLERS[rng.gen_range(0..SAMPLERS.len())];
        let latency_ms = base + rng.gen_range(0..=jitter);

        let t0 = Instant::now();
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        let elapsed_ms = t0.elapsed().as_millis() as u64;

        let sample = if rng.gen_bool(error_rate) {
            SampleResult::failure(label, elapsed_ms)
        } else {
            SampleResult::success(label, elapsed_ms)
        };
        collector.record(&sample.with_active_threads(threads.active()));
    }
}
