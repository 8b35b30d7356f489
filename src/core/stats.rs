use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{core::task_manager::spawn_task, utils::sleep_1s};

/// Request counters for one listener or connection
#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    responses: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
}

impl Stats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.responses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Logs the counters once per second until the task is aborted.
pub fn spawn_reporter(label: &'static str, stats: Arc<Stats>) -> tokio::task::JoinHandle<()> {
    spawn_task(async move {
        loop {
            sleep_1s().await;
            let snapshot = stats.snapshot();
            log::info!(
                "[{label}] requests={} responses={} errors={}",
                snapshot.requests,
                snapshot.responses,
                snapshot.errors
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = Stats::default();
        stats.record_request();
        stats.record_request();
        stats.record_response();
        stats.record_error();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                requests: 2,
                responses: 1,
                errors: 1
            }
        );
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
