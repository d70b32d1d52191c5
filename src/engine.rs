//! Engine wiring and room administration
//!
//! `EngineBuilder` assembles ledger, clock, announcer and the shared
//! components; `Engine` exposes the operator surface and the startup
//! reconciliation that drains bets left behind by a previous process.

use crate::clock::{Clock, RoundClock, SystemClock};
use crate::config::{EngineConfig, StorageBackend};
use crate::errors::{EngineResult, LedgerError, SchedulerError};
use crate::ledger::{Ledger, MemoryLedger, RocksLedger};
use crate::metrics::{to_prometheus_format, EngineMetrics, MetricsSnapshot};
use crate::notify::{AlertSeverity, Announcer, LogAnnouncer, Notifier, RoomEvent};
use crate::resolver::OutcomeResolver;
use crate::round::{RoundContext, RoundPhase};
use crate::scheduler::RoomScheduler;
use crate::settlement::SettlementEngine;
use crate::types::{Amount, ForcingMode, HistoryEntry, Room, RoomId, RoomStatus};
use crate::wallet::Wallet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Builder for `Engine`
pub struct EngineBuilder {
    config: EngineConfig,
    ledger: Option<Arc<dyn Ledger>>,
    clock: Option<Arc<dyn Clock>>,
    announcer: Option<Arc<dyn Announcer>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ledger: None,
            clock: None,
            announcer: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    /// Validate the config and wire every component. Spawns the announcement
    /// dispatcher, so it must run inside a tokio runtime.
    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let config = self.config;

        let ledger: Arc<dyn Ledger> = match self.ledger {
            Some(ledger) => ledger,
            None => match config.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryLedger::in_memory()),
                StorageBackend::RocksDb => Arc::new(RocksLedger::from_config(&config.storage)?),
            },
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let announcer = self.announcer.unwrap_or_else(|| Arc::new(LogAnnouncer));

        let game = Arc::new(config.game.clone());
        let metrics = Arc::new(EngineMetrics::new());
        let notifier = Notifier::spawn(announcer, game.announcement_queue);
        let resolver = Arc::new(OutcomeResolver::new(game.rng_seed, game.resolver_max_attempts));
        let settlement = Arc::new(SettlementEngine::new(ledger.clone(), &game, metrics.clone()));
        let rounds = RoundClock::new(game.round_seconds);

        let wallet = Arc::new(Wallet::new(
            ledger.clone(),
            clock.clone(),
            game.clone(),
            config.bonus.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let ctx = RoundContext {
            ledger: ledger.clone(),
            clock: clock.clone(),
            rounds,
            game,
            resolver,
            settlement,
            notifier: notifier.clone(),
            metrics: metrics.clone(),
            wallet: wallet.clone(),
        };

        Ok(Engine {
            scheduler: RoomScheduler::new(ctx),
            config,
            ledger,
            clock,
            rounds,
            notifier,
            wallet,
            metrics,
            reporter: Mutex::new(None),
        })
    }
}

/// Summary of startup reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub orphan_rounds: usize,
    pub refunded: Amount,
    pub settled: usize,
    pub rooms_started: usize,
}

pub struct Engine {
    config: EngineConfig,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    rounds: RoundClock,
    notifier: Notifier,
    scheduler: RoomScheduler,
    wallet: Arc<Wallet>,
    metrics: Arc<EngineMetrics>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn scheduler(&self) -> &RoomScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drain orphaned bets, then resume every room marked running
    pub async fn startup(&self) -> EngineResult<StartupReport> {
        let mut report = self.reconcile().await?;
        report.rooms_started = self.scheduler.on_startup().await?;
        self.spawn_reporter();
        tracing::info!(
            orphans = report.orphan_rounds,
            refunded = report.refunded,
            settled = report.settled,
            rooms = report.rooms_started,
            "Engine started"
        );
        Ok(report)
    }

    fn spawn_reporter(&self) {
        if !self.config.monitoring.enable_metrics {
            return;
        }
        let Ok(mut slot) = self.reporter.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let metrics = self.metrics.clone();
        let period = self.config.metrics_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = metrics.snapshot();
                tracing::info!(
                    bets = snapshot.bets_accepted,
                    volume = snapshot.volume_wagered,
                    settled = snapshot.rounds_settled,
                    conflicts = snapshot.settlement_conflicts,
                    failures = snapshot.settlement_failures,
                    "Engine metrics"
                );
                tracing::trace!("{}", to_prometheus_format(&snapshot));
            }
        }));
    }

    /// Settle or refund live bets on rounds no machine will ever finish:
    /// any round before the current epoch, and any round of a room that is
    /// not running.
    pub async fn reconcile(&self) -> EngineResult<StartupReport> {
        let current = self.rounds.round_index(self.clock.now());
        let mut report = StartupReport::default();

        for key in self.ledger.open_rounds().await? {
            let running = self
                .ledger
                .get_room(key.room)
                .await?
                .map_or(false, |room| room.is_running());
            if running && key.round >= current {
                continue;
            }

            report.orphan_rounds += 1;
            match self.scheduler.drain_orphan(key).await {
                Ok(drained) => {
                    report.refunded += drained.refunded;
                    if drained.plan.is_some() {
                        report.settled += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(round = %key, "Orphaned round not drained: {}", e);
                    self.notifier.alert(
                        Some(key.room),
                        AlertSeverity::Critical,
                        format!("Orphaned round {} could not be drained: {}", key, e),
                    );
                }
            }
        }
        Ok(report)
    }

    /// A chat asks to host a room. Creates it unapproved and pings operators.
    pub async fn request_room(&self, room: RoomId, title: &str) -> EngineResult<Room> {
        let record = self.ledger.upsert_room(room, title, self.clock.now()).await?;
        if !record.is_approved() {
            self.notifier.publish(RoomEvent::ApprovalRequested {
                room,
                title: record.title.clone(),
            });
        }
        Ok(record)
    }

    /// Approve and start the room
    pub async fn approve_room(&self, room: RoomId) -> EngineResult<bool> {
        let record = self
            .ledger
            .get_room(room)
            .await?
            .ok_or(SchedulerError::RoomNotFound(room))?;
        if !record.is_approved() {
            self.ledger.set_room_status(room, RoomStatus::Stopped).await?;
        }
        tracing::info!(room = %room, "Room approved");
        self.scheduler.start(room).await
    }

    /// Revoke approval; stops the room if it is running
    pub async fn deny_room(&self, room: RoomId) -> EngineResult<()> {
        self.scheduler.stop(room).await?;
        self.ledger.set_room_status(room, RoomStatus::Unapproved).await?;
        tracing::info!(room = %room, "Room approval revoked");
        Ok(())
    }

    pub async fn start_room(&self, room: RoomId) -> EngineResult<bool> {
        self.scheduler.start(room).await
    }

    pub async fn stop_room(&self, room: RoomId) -> EngineResult<bool> {
        self.scheduler.stop(room).await
    }

    pub async fn set_forcing_mode(&self, room: RoomId, mode: ForcingMode) -> EngineResult<Room> {
        let record = self.ledger.set_room_mode(room, mode).await?;
        tracing::info!(room = %room, mode = %mode, "Forcing mode set");
        Ok(record)
    }

    pub async fn room(&self, room: RoomId) -> EngineResult<Room> {
        Ok(self
            .ledger
            .get_room(room)
            .await?
            .ok_or(LedgerError::RoomNotFound(room))?)
    }

    pub fn room_phase(&self, room: RoomId) -> RoundPhase {
        self.scheduler.phase(room).unwrap_or(RoundPhase::Idle)
    }

    pub async fn recent_history(&self, room: RoomId, limit: usize) -> EngineResult<Vec<HistoryEntry>> {
        Ok(self.ledger.recent_history(room, limit).await?)
    }

    pub async fn jackpot(&self) -> EngineResult<Amount> {
        Ok(self.ledger.jackpot_amount().await?)
    }

    /// Halt all machines; running flags stay set so the next start resumes them
    pub async fn shutdown(&self) -> usize {
        if let Ok(mut slot) = self.reporter.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let halted = self.scheduler.halt_all().await;
        tracing::info!(rooms = halted, "Engine shut down");
        halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::{JackpotChange, SettlementCommit};
    use crate::types::{AccountId, Bet, RoundKey, Side};
    use chrono::{TimeZone, Utc};

    const ROOM: RoomId = RoomId(-9);

    fn empty_commit(key: RoundKey) -> SettlementCommit {
        SettlementCommit {
            key,
            bet_ids: Vec::new(),
            stakes_total: 0,
            credits: Vec::new(),
            streaks: Vec::new(),
            jackpot: JackpotChange::Unchanged,
            history: None,
            history_retain: 20,
        }
    }

    #[tokio::test]
    async fn test_reconcile_refunds_round_behind_later_settlement() {
        // 10s into round 1_002
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_002 * 60 + 10, 0).unwrap()));
        let engine = Engine::builder(EngineConfig::testing())
            .with_clock(clock.clone())
            .build()
            .unwrap();
        let ledger = engine.ledger();
        engine.request_room(ROOM, "stale").await.unwrap();
        ledger.set_room_status(ROOM, RoomStatus::Stopped).await.unwrap();
        ledger.set_room_running(ROOM, true).await.unwrap();

        let alice = AccountId(1);
        engine.wallet().register(alice, "alice").await.unwrap();
        engine.wallet().credit(alice, 5_000).await.unwrap();
        let stale = RoundKey::new(ROOM, 1_000);
        ledger
            .place_bet(Bet::new(stale, alice, Side::Tai, 2_000, clock.now()))
            .await
            .unwrap();
        ledger
            .commit_settlement(empty_commit(RoundKey::new(ROOM, 1_001)))
            .await
            .unwrap();

        let report = engine.reconcile().await.unwrap();
        assert_eq!(report.orphan_rounds, 1);
        assert_eq!(report.refunded, 2_000);
        assert_eq!(engine.wallet().balance(alice).await.unwrap(), 5_000);
        assert!(ledger.open_rounds().await.unwrap().is_empty());
        assert!(ledger.is_settled(stale).await.unwrap());
        assert_eq!(engine.metrics().orphan_rounds, 1);
    }
}
