use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::adapter::Network;

const BANDWIDTH_HISTORY_SIZE: usize = 60;

/// Process-wide traffic counters of the tunnel.
pub struct TrafficStats {
    total_upload: AtomicU64,
    total_download: AtomicU64,
    total_tcp: AtomicU64,
    total_udp: AtomicU64,
    active_connections: AtomicU64,
    dial_failures: AtomicU64,
    /// Per-destination totals, folded in when a session closes.
    destinations: Mutex<HashMap<String, DestinationTraffic>>,
    /// Last `BANDWIDTH_HISTORY_SIZE` samples, oldest first.
    bandwidth_history: Mutex<Vec<BandwidthSample>>,
    prev_upload: AtomicU64,
    prev_download: AtomicU64,
}

/// Traffic exchanged with one destination address.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct DestinationTraffic {
    pub destination: String,
    pub upload: u64,
    pub download: u64,
    pub connection_count: u64,
}

/// Bytes moved during one sampling interval.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct BandwidthSample {
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_upload: u64,
    pub total_download: u64,
    pub total_tcp: u64,
    pub total_udp: u64,
    pub active_connections: u64,
    pub dial_failures: u64,
    pub top_destinations: Vec<DestinationTraffic>,
    pub bandwidth_history: Vec<BandwidthSample>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            total_upload: AtomicU64::new(0),
            total_download: AtomicU64::new(0),
            total_tcp: AtomicU64::new(0),
            total_udp: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            destinations: Mutex::new(HashMap::new()),
            bandwidth_history: Mutex::new(Vec::with_capacity(BANDWIDTH_HISTORY_SIZE)),
            prev_upload: AtomicU64::new(0),
            prev_download: AtomicU64::new(0),
        }
    }

    /// Pushes the bytes moved since the previous call onto the history.
    /// Meant to be called on a fixed interval.
    pub fn sample_bandwidth(&self) {
        let upload = self.total_upload.load(Ordering::Relaxed);
        let download = self.total_download.load(Ordering::Relaxed);
        let prev_upload = self.prev_upload.swap(upload, Ordering::Relaxed);
        let prev_download = self.prev_download.swap(download, Ordering::Relaxed);

        let sample = BandwidthSample {
            upload: upload.saturating_sub(prev_upload),
            download: download.saturating_sub(prev_download),
        };

        let mut history = lock(&self.bandwidth_history);
        if history.len() >= BANDWIDTH_HISTORY_SIZE {
            history.remove(0);
        }
        history.push(sample);
    }

    pub fn record_connection_open(&self, network: Network) {
        match network {
            Network::Tcp => self.total_tcp.fetch_add(1, Ordering::Relaxed),
            Network::Udp => self.total_udp.fetch_add(1, Ordering::Relaxed),
        };
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished session and folds its totals into the
    /// per-destination table.
    pub fn record_connection_close(&self, destination: &str, upload: u64, download: u64) {
        self.active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();

        let mut destinations = lock(&self.destinations);
        let entry = destinations
            .entry(destination.to_string())
            .or_insert_with(|| DestinationTraffic {
                destination: destination.to_string(),
                ..Default::default()
            });
        entry.upload += upload;
        entry.download += download;
        entry.connection_count += 1;
    }

    pub fn record_upload(&self, n: u64) {
        self.total_upload.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_download(&self, n: u64) {
        self.total_download.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, top_n: usize) -> StatsSnapshot {
        let mut top_destinations: Vec<DestinationTraffic> =
            lock(&self.destinations).values().cloned().collect();
        top_destinations.sort_by(|a, b| (b.upload + b.download).cmp(&(a.upload + a.download)));
        top_destinations.truncate(top_n);

        StatsSnapshot {
            total_upload: self.total_upload.load(Ordering::Relaxed),
            total_download: self.total_download.load(Ordering::Relaxed),
            total_tcp: self.total_tcp.load(Ordering::Relaxed),
            total_udp: self.total_udp.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            top_destinations,
            bandwidth_history: lock(&self.bandwidth_history).clone(),
        }
    }

    pub fn reset(&self) {
        self.total_upload.store(0, Ordering::Relaxed);
        self.total_download.store(0, Ordering::Relaxed);
        self.total_tcp.store(0, Ordering::Relaxed);
        self.total_udp.store(0, Ordering::Relaxed);
        self.dial_failures.store(0, Ordering::Relaxed);
        self.prev_upload.store(0, Ordering::Relaxed);
        self.prev_download.store(0, Ordering::Relaxed);
        lock(&self.destinations).clear();
        lock(&self.bandwidth_history).clear();
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

// Counters stay usable even if a holder panicked mid-update.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
