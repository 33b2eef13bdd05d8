use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;

use graphite_backend::{BackendConfig, BackendListener, ListenerState, SampleResult, ThreadTracker};

/// Line-oriented collector on an ephemeral port; every received line is
/// appended to the shared vector.
async fn spawn_collector() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let lines = Arc::new(Mutex::new(Vec::new()));

    let sink = lines.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    sink.lock().push(line);
                }
            });
        }
    });

    (port, lines)
}

async fn wait_for(lines: &Mutex<Vec<String>>, prefix: &str) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(found) = lines.lock().iter().find(|l| l.starts_with(prefix)) {
            return found.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no line starting with {prefix:?} in {:?}",
            lines.lock()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn config(port: u16) -> BackendConfig {
    BackendConfig {
        host: "127.0.0.1".into(),
        port,
        root_metrics_prefix: "jmeter.".into(),
        percentiles: "90;95".into(),
        ..BackendConfig::default()
    }
}

#[tokio::test]
async fn test_tick_flushes_cumulated_metrics_over_tcp() {
    let (port, lines) = spawn_collector().await;
    let mut listener = BackendListener::new(config(port), Arc::new(ThreadTracker::new())).unwrap();
    listener.setup().await.unwrap();

    let collector = listener.collector();
    for ms in (10..=100).step_by(10) {
        collector.record(&SampleResult::success("home page", ms));
    }

    let success = wait_for(&lines, "jmeter.cumulated.success ").await;
    let parts: Vec<_> = success.split(' ').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[1], "10");
    let ts: i64 = parts[2].parse().unwrap();
    assert!((ts - chrono::Utc::now().timestamp()).abs() < 60);

    let total = wait_for(&lines, "jmeter.cumulated.total ").await;
    assert!(total.starts_with("jmeter.cumulated.total 10 "));

    let p90 = wait_for(&lines, "jmeter.cumulated.percentile90 ").await;
    assert!(p90.starts_with("jmeter.cumulated.percentile90 90 "), "{p90}");
    wait_for(&lines, "jmeter.cumulated.percentile95 ").await;
    wait_for(&lines, "jmeter.cumulated.failure 0 ").await;
    assert_eq!(listener.state(), ListenerState::Ticking);

    listener.teardown().await.unwrap();
    assert_eq!(listener.state(), ListenerState::Stopped);

    // Summary-only by default: no per-label context.
    assert!(!lines.lock().iter().any(|l| l.starts_with("jmeter.home-page.")));
}

#[tokio::test]
async fn test_each_sample_reported_exactly_once() {
    let (port, lines) = spawn_collector().await;
    let mut listener = BackendListener::new(config(port), Arc::new(ThreadTracker::new())).unwrap();
    listener.setup().await.unwrap();

    let collector = listener.collector();
    let writers: Vec<_> = (0..4)
        .map(|_| {
            let collector = collector.clone();
            std::thread::spawn(move || {
                for i in 0..2_500u64 {
                    collector.record(&SampleResult::success("s", i % 50));
                    if i % 500 == 0 {
                        std::thread::sleep(Duration::from_millis(300));
                    }
                }
            })
        })
        .collect();
    for w in writers {
        tokio::task::spawn_blocking(move || w.join().unwrap()).await.unwrap();
    }

    let last = listener.teardown().await.unwrap();
    assert_eq!(last.dropped, 0);

    // Let the collector read the final flush.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let reported: u64 = lines
        .lock()
        .iter()
        .filter_map(|l| l.strip_prefix("jmeter.cumulated.total "))
        .map(|rest| rest.split(' ').next().unwrap().parse::<u64>().unwrap())
        .sum();
    assert_eq!(reported, 10_000);
}

#[tokio::test]
async fn test_unreachable_collector_does_not_break_the_run() {
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let mut listener = BackendListener::new(config(port), Arc::new(ThreadTracker::new())).unwrap();
    listener.setup().await.unwrap();
    listener.handle_sample_results(&[SampleResult::success("a", 5), SampleResult::failure("a", 9)]);

    let stats = listener.send_metrics().await.unwrap();
    assert_eq!(stats.sent, 0);
    assert!(stats.dropped > 0);

    // Nothing is retried; the next cycle reports a fresh interval.
    let again = listener.send_metrics().await.unwrap();
    assert_eq!(again.sent, 0);
    assert!(again.dropped > 0);
    assert_eq!(listener.collector().labels().len(), 0);

    listener.teardown().await.unwrap();
}
