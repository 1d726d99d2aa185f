//! Round latency and traffic counters, logged under the `metrics` target.

use crate::{Epoch, Round};
use log::{debug, info};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RoundMetrics {
    enabled: bool,
    last_round_start: Option<Instant>,
    last_latency: Option<Duration>,
    bytes_read: u64,
    bytes_written: u64,
}

impl RoundMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_round_start: None,
            last_latency: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Time since the previous round start, tagged with round and epoch.
    pub fn round_started(&mut self, round: Round, epoch: Epoch) {
        let now = Instant::now();
        if let Some(previous) = self.last_round_start.replace(now) {
            let latency = now.duration_since(previous);
            self.last_latency = Some(latency);
            if self.enabled {
                debug!(
                    target: "metrics",
                    "round={} epoch={} latency_ms={} read={} written={}",
                    round,
                    epoch,
                    latency.as_millis(),
                    self.bytes_read,
                    self.bytes_written
                );
            }
        }
    }

    pub fn record_read(&mut self, bytes: usize) {
        self.bytes_read += bytes as u64;
    }

    pub fn record_written(&mut self, bytes: usize) {
        self.bytes_written += bytes as u64;
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Logs the totals once a session ends, if metrics are enabled.
    pub fn report(&self, role: &str) {
        if !self.enabled {
            return;
        }
        info!(
            target: "metrics",
            "{}: read {} bytes, wrote {} bytes, last round latency {:?}",
            role,
            self.bytes_read(),
            self.bytes_written(),
            self.last_latency()
        );
    }
}
