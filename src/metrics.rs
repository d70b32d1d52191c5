//! Engine counters with Prometheus text export

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct EngineMetrics {
    start_time: Instant,
    bets_accepted: AtomicU64,
    bets_rejected: AtomicU64,
    volume_wagered: AtomicU64,
    rounds_settled: AtomicU64,
    rounds_refunded: AtomicU64,
    settlement_conflicts: AtomicU64,
    settlement_failures: AtomicU64,
    resolver_exhausted: AtomicU64,
    jackpots_distributed: AtomicU64,
    orphan_rounds: AtomicU64,
    machine_crashes: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub bets_accepted: u64,
    pub bets_rejected: u64,
    pub volume_wagered: u64,
    pub rounds_settled: u64,
    pub rounds_refunded: u64,
    pub settlement_conflicts: u64,
    pub settlement_failures: u64,
    pub resolver_exhausted: u64,
    pub jackpots_distributed: u64,
    pub orphan_rounds: u64,
    pub machine_crashes: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bets_accepted: AtomicU64::new(0),
            bets_rejected: AtomicU64::new(0),
            volume_wagered: AtomicU64::new(0),
            rounds_settled: AtomicU64::new(0),
            rounds_refunded: AtomicU64::new(0),
            settlement_conflicts: AtomicU64::new(0),
            settlement_failures: AtomicU64::new(0),
            resolver_exhausted: AtomicU64::new(0),
            jackpots_distributed: AtomicU64::new(0),
            orphan_rounds: AtomicU64::new(0),
            machine_crashes: AtomicU64::new(0),
        }
    }

    pub fn record_bet_accepted(&self, amount: u64) {
        self.bets_accepted.fetch_add(1, Ordering::Relaxed);
        self.volume_wagered.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn record_bet_rejected(&self) {
        self.bets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_settled(&self, jackpot_distributed: bool) {
        self.rounds_settled.fetch_add(1, Ordering::Relaxed);
        if jackpot_distributed {
            self.jackpots_distributed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_round_refunded(&self) {
        self.rounds_refunded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settlement_conflict(&self) {
        self.settlement_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settlement_failure(&self) {
        self.settlement_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolver_exhausted(&self) {
        self.resolver_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphan_round(&self) {
        self.orphan_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_machine_crash(&self) {
        self.machine_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            bets_accepted: self.bets_accepted.load(Ordering::Relaxed),
            bets_rejected: self.bets_rejected.load(Ordering::Relaxed),
            volume_wagered: self.volume_wagered.load(Ordering::Relaxed),
            rounds_settled: self.rounds_settled.load(Ordering::Relaxed),
            rounds_refunded: self.rounds_refunded.load(Ordering::Relaxed),
            settlement_conflicts: self.settlement_conflicts.load(Ordering::Relaxed),
            settlement_failures: self.settlement_failures.load(Ordering::Relaxed),
            resolver_exhausted: self.resolver_exhausted.load(Ordering::Relaxed),
            jackpots_distributed: self.jackpots_distributed.load(Ordering::Relaxed),
            orphan_rounds: self.orphan_rounds.load(Ordering::Relaxed),
            machine_crashes: self.machine_crashes.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a snapshot in Prometheus text exposition format
pub fn to_prometheus_format(snapshot: &MetricsSnapshot) -> String {
    let counters: [(&str, &str, u64); 11] = [
        ("bets_accepted_total", "Bets accepted", snapshot.bets_accepted),
        ("bets_rejected_total", "Bets rejected", snapshot.bets_rejected),
        ("volume_wagered_total", "Stake volume accepted", snapshot.volume_wagered),
        ("rounds_settled_total", "Rounds settled", snapshot.rounds_settled),
        ("rounds_refunded_total", "Rounds refunded", snapshot.rounds_refunded),
        ("settlement_conflicts_total", "Settlement commits retried after a conflict", snapshot.settlement_conflicts),
        ("settlement_failures_total", "Settlements abandoned", snapshot.settlement_failures),
        ("resolver_exhausted_total", "Forced rolls that ran out of attempts", snapshot.resolver_exhausted),
        ("jackpots_distributed_total", "Triple outcomes that paid the jackpot", snapshot.jackpots_distributed),
        ("orphan_rounds_total", "Rounds drained at startup", snapshot.orphan_rounds),
        ("machine_crashes_total", "Round machines stopped by an error", snapshot.machine_crashes),
    ];

    let mut output = String::new();
    output.push_str(&format!(
        "# HELP taixiu_uptime_seconds Engine uptime in seconds\n# TYPE taixiu_uptime_seconds gauge\ntaixiu_uptime_seconds {}\n\n",
        snapshot.uptime_seconds
    ));
    for (name, help, value) in counters {
        output.push_str(&format!(
            "# HELP taixiu_{name} {help}\n# TYPE taixiu_{name} counter\ntaixiu_{name} {value}\n\n"
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = EngineMetrics::new();
        metrics.record_bet_accepted(1_000);
        metrics.record_bet_accepted(2_000);
        metrics.record_bet_rejected();
        metrics.record_round_settled(true);
        metrics.record_round_settled(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.bets_accepted, 2);
        assert_eq!(snap.volume_wagered, 3_000);
        assert_eq!(snap.bets_rejected, 1);
        assert_eq!(snap.rounds_settled, 2);
        assert_eq!(snap.jackpots_distributed, 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = EngineMetrics::new();
        metrics.record_settlement_conflict();
        let text = to_prometheus_format(&metrics.snapshot());
        assert!(text.contains("# TYPE taixiu_settlement_conflicts_total counter\ntaixiu_settlement_conflicts_total 1\n"));
        assert!(text.contains("taixiu_uptime_seconds"));
    }
}
