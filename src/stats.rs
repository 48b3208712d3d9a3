use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::{ Duration, Instant };
use tracing::info;

/// Lock-free session counters
#[derive(Debug, Default)]
pub struct Stats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub snapshots_enqueued: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub announces_sent: AtomicU64,
    pub commands_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline(always)]
    pub fn record_recv(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_snapshot(&self) {
        self.snapshots_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_announce(&self) {
        self.announces_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_command(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let pkts = self.packets_received.swap(0, Ordering::Relaxed);
        let bytes = self.bytes_received.swap(0, Ordering::Relaxed);
        let snapshots = self.snapshots_enqueued.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            pps: (pkts as f64) / secs,
            kbps: ((bytes as f64) * 8.0) / (secs * 1_000.0),
            snapshots_per_sec: (snapshots as f64) / secs,
            malformed: self.malformed_messages.swap(0, Ordering::Relaxed),
            announces: self.announces_sent.swap(0, Ordering::Relaxed),
            commands: self.commands_sent.swap(0, Ordering::Relaxed),
            send_errors: self.send_errors.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub pps: f64,
    pub kbps: f64,
    pub snapshots_per_sec: f64,
    pub malformed: u64,
    pub announces: u64,
    pub commands: u64,
    pub send_errors: u64,
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // Stats disabled, park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        info!(
            pps = format!("{:.1}", snap.pps),
            kbps = format!("{:.2}", snap.kbps),
            states_per_sec = format!("{:.1}", snap.snapshots_per_sec),
            malformed = snap.malformed,
            announces = snap.announces,
            commands = snap.commands,
            send_errors = snap.send_errors,
            "📈 session stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rates_and_reset() {
        let stats = Stats::new();
        stats.record_recv(100);
        stats.record_recv(150);
        stats.record_malformed();
        stats.record_announce();

        let snap = stats.snapshot_and_reset(Duration::from_secs(2));
        assert!((snap.pps - 1.0).abs() < 1e-9);
        assert!((snap.kbps - 1.0).abs() < 1e-9);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.announces, 1);

        let again = stats.snapshot_and_reset(Duration::from_secs(1));
        assert_eq!(again.pps, 0.0);
        assert_eq!(again.malformed, 0);
    }
}
