//! Broker runtime statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Length of the sliding window backing the message rate.
const RATE_WINDOW: Duration = Duration::from_secs(60);

pub struct Stats {
    started: Instant,
    total_messages: AtomicU64,
    window: Mutex<VecDeque<Instant>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_messages: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.push_back(now);
        prune(&mut window, now);
    }

    pub fn snapshot(&self, active_links: usize) -> StatsSnapshot {
        let now = Instant::now();
        let in_window = {
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            prune(&mut window, now);
            window.len()
        };
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            active_links,
            total_messages: self.total_messages.load(Ordering::Relaxed),
            messages_per_sec: in_window as f64 / RATE_WINDOW.as_secs_f64(),
            memory_rss_bytes: rss_bytes(),
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > RATE_WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub active_links: usize,
    pub total_messages: u64,
    /// Messages per second over the sliding window.
    pub messages_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
}

/// Resident set size from procfs; `None` on other platforms.
///
/// Reads the `VmRSS` line of `/proc/self/status`, which is reported in
/// kB and does not depend on the kernel's page size.
fn rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_messages() {
        let stats = Stats::new();
        stats.record_message();
        stats.record_message();
        stats.record_message();

        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.total_messages, 3);
        assert_eq!(snapshot.active_links, 2);
        assert!(snapshot.messages_per_sec > 0.0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let stats = Stats::new();
        let value = serde_json::to_value(stats.snapshot(0)).unwrap();
        assert!(value.get("totalMessages").is_some());
        assert!(value.get("messagesPerSec").is_some());
        assert!(value.get("uptimeSecs").is_some());
    }
}
