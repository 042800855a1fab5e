//! Shared pipeline counters, logged once a minute.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct Stats {
    pub pkts_read: AtomicU64,
    pub total_bytes: AtomicU64,
}

/// Scale a byte count to the largest unit that keeps it above one.
pub fn human_bytes(mut n: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut unit = 0;
    while n > 1024 && unit < UNITS.len() - 1 {
        n /= 1024;
        unit += 1;
    }
    format!("{} {}", n, UNITS[unit])
}

/// Log the sensor's packet counter once a minute until stopped.
pub async fn packet_count_loop(stats: Arc<Stats>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(REPORT_INTERVAL) => {
                log::info!(
                    "Total packets read from interface is {}",
                    stats.pkts_read.load(Ordering::Relaxed)
                );
            }
        }
    }
}

/// Log the receiver's byte counter once a minute until stopped.
pub async fn data_size_loop(stats: Arc<Stats>, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(REPORT_INTERVAL) => {
                log::info!(
                    "Total data transfer size is {}",
                    human_bytes(stats.total_bytes.load(Ordering::Relaxed))
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes_scaling() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1024), "1024 B");
        assert_eq!(human_bytes(1025), "1 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3 MB");
        assert_eq!(human_bytes(7 * 1024 * 1024 * 1024), "7 GB");
        assert_eq!(human_bytes(u64::MAX), "15 EB");
    }
}
