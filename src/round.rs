//! Round State Machine
//!
//! One instance per running room. Each iteration derives the current round
//! from the wall clock, collects bets until the boundary, then resolves,
//! settles and announces that round before moving on. A stop signal cancels
//! any wait immediately; once resolution has begun the round runs to the end.

use crate::clock::{Clock, RoundClock};
use crate::config::{GameConfig, OrphanPolicy};
use crate::errors::{EngineResult, LedgerError};
use crate::ledger::Ledger;
use crate::metrics::EngineMetrics;
use crate::notify::{AlertSeverity, Notifier, RoomEvent, WinnerPayout};
use crate::resolver::OutcomeResolver;
use crate::settlement::{SettlementEngine, SettlementReport, SettlementStatus};
use crate::types::{ForcingMode, HistoryEntry, RoomId, RoundIndex, RoundKey};
use crate::wallet::Wallet;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Observable lifecycle position of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    Collecting { round: RoundIndex },
    Locked { round: RoundIndex },
    Resolving { round: RoundIndex },
    Settling { round: RoundIndex },
    Announcing { round: RoundIndex },
}

impl RoundPhase {
    pub fn round(&self) -> Option<RoundIndex> {
        match self {
            RoundPhase::Idle => None,
            RoundPhase::Collecting { round }
            | RoundPhase::Locked { round }
            | RoundPhase::Resolving { round }
            | RoundPhase::Settling { round }
            | RoundPhase::Announcing { round } => Some(*round),
        }
    }

    /// Whether new bets may still be placed in this phase
    pub fn accepts_bets(&self) -> bool {
        matches!(self, RoundPhase::Collecting { .. })
    }
}

/// Components every machine shares
#[derive(Clone)]
pub struct RoundContext {
    pub ledger: Arc<dyn Ledger>,
    pub clock: Arc<dyn Clock>,
    pub rounds: RoundClock,
    pub game: Arc<GameConfig>,
    pub resolver: Arc<OutcomeResolver>,
    pub settlement: Arc<SettlementEngine>,
    pub notifier: Notifier,
    pub metrics: Arc<EngineMetrics>,
    pub wallet: Arc<Wallet>,
}

impl RoundContext {
    /// Close a round no machine will finish: refund it, or settle it on an
    /// unconstrained roll, per `orphan_policy`.
    pub async fn drain_orphan(&self, key: RoundKey) -> EngineResult<SettlementReport> {
        self.metrics.record_orphan_round();
        match self.game.orphan_policy {
            OrphanPolicy::Refund => {
                let report = self.settlement.refund(key).await?;
                self.metrics.record_round_refunded();
                tracing::warn!(round = %key, refunded = report.refunded, "Refunded orphaned round");
                Ok(report)
            }
            OrphanPolicy::Settle => {
                // The room's forcing mode is left alone
                let resolution = self.resolver.resolve(ForcingMode::Random)?;
                let entry = HistoryEntry::from_outcome(key.round, &resolution.outcome, self.clock.now());
                let report = self.settlement.settle(key, resolution.outcome, entry).await?;
                if let Some(plan) = &report.plan {
                    self.wallet.record_wagering(key, plan.streaks.keys().copied()).await;
                }
                tracing::warn!(round = %key, side = %resolution.outcome.side, "Settled orphaned round");
                Ok(report)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Mark {
    Countdown(u64),
    Lock,
}

enum Collected {
    Closed,
    Stopped,
}

pub struct RoundMachine {
    room: RoomId,
    ctx: RoundContext,
    phase: watch::Sender<RoundPhase>,
}

impl RoundMachine {
    pub fn new(room: RoomId, ctx: RoundContext) -> (Self, watch::Receiver<RoundPhase>) {
        let (phase, phase_rx) = watch::channel(RoundPhase::Idle);
        (Self { room, ctx, phase }, phase_rx)
    }

    /// Drive rounds until stopped or the room stops running
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> EngineResult<()> {
        tracing::info!(room = %self.room, "Round machine started");
        let result = self.cycle(&mut stop).await;

        self.phase.send_replace(RoundPhase::Idle);
        self.ctx.notifier.publish(RoomEvent::RoomStopped { room: self.room });
        match &result {
            Ok(()) => tracing::info!(room = %self.room, "Round machine stopped"),
            Err(e) => tracing::error!(room = %self.room, "Round machine failed: {}", e),
        }
        result
    }

    async fn cycle(&self, stop: &mut watch::Receiver<bool>) -> EngineResult<()> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let room = self
                .ctx
                .ledger
                .get_room(self.room)
                .await?
                .ok_or(LedgerError::RoomNotFound(self.room))?;
            if !room.is_running() {
                tracing::info!(room = %self.room, "Room no longer running");
                return Ok(());
            }

            let round = self.ctx.rounds.round_index(self.ctx.clock.now());
            let key = RoundKey::new(self.room, round);

            if self.ctx.ledger.is_settled(key).await? {
                // Restarted inside a round that is already final; wait for the next one
                if !self.sleep_until(self.ctx.rounds.closes_at(round), stop).await {
                    return Ok(());
                }
                continue;
            }

            match self.collect(round, stop).await {
                Collected::Closed => self.finish(key).await?,
                Collected::Stopped => {
                    self.abandon(key).await?;
                    return Ok(());
                }
            }
        }
    }

    fn marks(&self, round: RoundIndex) -> Vec<(DateTime<Utc>, Mark)> {
        let game = &self.ctx.game;
        let closes_at = self.ctx.rounds.closes_at(round);
        let mut marks: Vec<(DateTime<Utc>, Mark)> = game
            .countdown_milestones
            .iter()
            .filter(|m| **m > 0 && **m < game.round_seconds)
            .map(|m| (closes_at - seconds(*m), Mark::Countdown(*m)))
            .collect();
        marks.push((self.ctx.rounds.locks_at(round, game.lock_seconds), Mark::Lock));
        marks.sort();
        marks
    }

    async fn collect(&self, round: RoundIndex, stop: &mut watch::Receiver<bool>) -> Collected {
        let closes_at = self.ctx.rounds.closes_at(round);
        self.phase.send_replace(RoundPhase::Collecting { round });
        self.ctx.notifier.publish(RoomEvent::RoundOpened {
            room: self.room,
            round,
            closes_at,
        });
        tracing::debug!(room = %self.room, round, "Collecting bets");

        for (at, mark) in self.marks(round) {
            let passed = at <= self.ctx.clock.now();
            if !passed && !self.sleep_until(at, stop).await {
                return Collected::Stopped;
            }
            match mark {
                Mark::Countdown(seconds_left) => {
                    if !passed {
                        self.ctx.notifier.publish(RoomEvent::Countdown {
                            room: self.room,
                            round,
                            seconds_left,
                        });
                    }
                }
                Mark::Lock => {
                    self.phase.send_replace(RoundPhase::Locked { round });
                    self.ctx.notifier.publish(RoomEvent::RoundLocked {
                        room: self.room,
                        round,
                    });
                }
            }
        }

        if !self.sleep_until(closes_at, stop).await {
            return Collected::Stopped;
        }
        Collected::Closed
    }

    /// Resolve, settle and announce. Not cancellable.
    async fn finish(&self, key: RoundKey) -> EngineResult<()> {
        let round = key.round;

        self.phase.send_replace(RoundPhase::Resolving { round });
        let mode = self.ctx.ledger.take_forcing_mode(self.room).await?;
        let resolution = self.ctx.resolver.resolve(mode)?;
        if resolution.exhausted {
            self.ctx.metrics.record_resolver_exhausted();
            self.ctx.notifier.alert(
                Some(self.room),
                AlertSeverity::Warning,
                format!(
                    "Round {} forced {} but rolled {} after {} attempts",
                    round, mode, resolution.outcome.side, resolution.attempts
                ),
            );
        }
        let outcome = resolution.outcome;

        self.phase.send_replace(RoundPhase::Settling { round });
        let entry = HistoryEntry::from_outcome(round, &outcome, self.ctx.clock.now());
        let report = self.ctx.settlement.settle(key, outcome, entry).await?;

        for failure in &report.failed_credits {
            self.ctx.notifier.alert(
                Some(self.room),
                AlertSeverity::Critical,
                format!(
                    "Round {}: credit of {} to account {} failed: {}",
                    round, failure.amount, failure.account, failure.reason
                ),
            );
        }
        if report.status == SettlementStatus::AlreadySettled {
            tracing::warn!(round = %key, "Round was already settled; skipping announcement");
            return Ok(());
        }
        if let Some(plan) = &report.plan {
            self.ctx.wallet.record_wagering(key, plan.streaks.keys().copied()).await;
        }

        self.phase.send_replace(RoundPhase::Announcing { round });
        let history = match self
            .ctx
            .ledger
            .recent_history(self.room, self.ctx.game.max_history)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(round = %key, "History unavailable for announcement: {}", e);
                Vec::new()
            }
        };
        let jackpot_distributed = report.plan.as_ref().map_or(0, |p| p.jackpot_distributed);

        self.ctx.notifier.publish(RoomEvent::ResultAnnounced {
            room: self.room,
            round,
            outcome,
            jackpot_distributed,
            jackpot_balance: report.jackpot_after,
            history,
        });

        let winners: Vec<WinnerPayout> = report
            .winner_summary()
            .into_iter()
            .map(|(account, stake, payout)| WinnerPayout {
                account,
                stake,
                payout,
            })
            .collect();
        if !winners.is_empty() {
            self.ctx.notifier.publish(RoomEvent::SettlementSummary {
                room: self.room,
                round,
                winners,
            });
        }
        Ok(())
    }

    /// Return the stakes of a round that will never resolve
    async fn abandon(&self, key: RoundKey) -> EngineResult<()> {
        let report = self.ctx.settlement.refund(key).await?;
        if report.refunded > 0 {
            self.ctx.metrics.record_round_refunded();
            tracing::info!(round = %key, refunded = report.refunded, "Open round refunded on stop");
        }
        Ok(())
    }

    /// Sleep until `at`; false if stopped first
    async fn sleep_until(&self, at: DateTime<Utc>, stop: &mut watch::Receiver<bool>) -> bool {
        let wait = (at - self.ctx.clock.now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = stop.wait_for(|stopped| *stopped) => false,
        }
    }
}

fn seconds(s: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(s).unwrap_or(i64::MAX))
}
