//! Settlement Engine
//!
//! `plan` is a pure function from (bets, outcome, jackpot) to the exact money
//! movements of a round. `SettlementEngine` turns a plan into one ledger
//! commit and retries the whole step, recomputing the plan, until it lands or
//! the retry budget is spent. A plan is never resumed halfway.

use crate::config::{GameConfig, HouseShareMode, BPS_DENOMINATOR};
use crate::errors::{LedgerError, SettlementError};
use crate::ledger::{
    CommitOutcome, CreditFailure, JackpotChange, Ledger, SettlementCommit, StreakUpdate,
};
use crate::metrics::EngineMetrics;
use crate::types::{AccountId, Amount, Bet, HistoryEntry, Outcome, RoundKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Payout rules applied to every winning bet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayoutPolicy {
    pub win_multiplier_bps: u64,
    pub house_rate_bps: u64,
    pub house_share_mode: HouseShareMode,
}

impl PayoutPolicy {
    pub fn from_config(game: &GameConfig) -> Self {
        Self {
            win_multiplier_bps: game.win_multiplier_bps,
            house_rate_bps: game.house_rate_bps,
            house_share_mode: game.house_share_mode,
        }
    }
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self::from_config(&GameConfig::default())
    }
}

/// `amount * bps / 10_000`, rounded half up
pub fn apply_bps(amount: Amount, bps: u64) -> Amount {
    let scaled = u128::from(amount) * u128::from(bps) + u128::from(BPS_DENOMINATOR / 2);
    u64::try_from(scaled / u128::from(BPS_DENOMINATOR)).unwrap_or(u64::MAX)
}

/// Split `pool` in proportion to `weights` so the parts sum to `pool` exactly.
/// Leftover units go to the largest fractional remainders, earliest first on ties.
pub fn prorate(pool: Amount, weights: &[Amount]) -> Vec<Amount> {
    let total: u128 = weights.iter().map(|w| u128::from(*w)).sum();
    if total == 0 || weights.is_empty() {
        return vec![0; weights.len()];
    }

    let pool_wide = u128::from(pool);
    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let exact = pool_wide * u128::from(*w);
        shares.push((exact / total) as u64);
        remainders.push((exact % total, i));
    }

    let handed_out: u64 = shares.iter().sum();
    let leftover = pool.saturating_sub(handed_out) as usize;
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, i) in remainders.into_iter().take(leftover) {
        shares[i] += 1;
    }
    shares
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerLine {
    pub bet_id: Uuid,
    pub account: AccountId,
    pub stake: Amount,
    /// Multiplier payout before any jackpot share
    pub payout: Amount,
    pub house_share: Amount,
    pub jackpot_share: Amount,
}

impl WinnerLine {
    /// Amount actually credited for this bet
    pub fn credited(&self, mode: HouseShareMode) -> Amount {
        let base = match mode {
            HouseShareMode::Separate => self.payout,
            HouseShareMode::Deducted => self.payout.saturating_sub(self.house_share),
        };
        base.saturating_add(self.jackpot_share)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoserLine {
    pub bet_id: Uuid,
    pub account: AccountId,
    pub stake: Amount,
}

/// Exact money movements for one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementPlan {
    pub key: RoundKey,
    pub outcome: Outcome,
    pub policy: PayoutPolicy,
    pub winners: Vec<WinnerLine>,
    pub losers: Vec<LoserLine>,
    pub jackpot_before: Amount,
    /// Losing stakes plus house shares
    pub jackpot_contribution: Amount,
    pub jackpot_distributed: Amount,
    pub jackpot_after: Amount,
    pub streaks: BTreeMap<AccountId, StreakUpdate>,
}

impl SettlementPlan {
    pub fn stakes_total(&self) -> Amount {
        let won: Amount = self.winners.iter().map(|w| w.stake).sum();
        let lost: Amount = self.losers.iter().map(|l| l.stake).sum();
        won + lost
    }

    /// Credits aggregated per account
    pub fn credits(&self) -> BTreeMap<AccountId, Amount> {
        let mut credits = BTreeMap::new();
        for w in &self.winners {
            *credits.entry(w.account).or_insert(0) += w.credited(self.policy.house_share_mode);
        }
        credits
    }

    pub fn credited_total(&self) -> Amount {
        self.credits().values().sum()
    }

    fn jackpot_change(&self) -> JackpotChange {
        if self.jackpot_distributed > 0 || (self.outcome.triple && !self.winners.is_empty()) {
            JackpotChange::Drain {
                expected: self.jackpot_before,
            }
        } else {
            JackpotChange::Add(self.jackpot_contribution)
        }
    }

    pub fn into_commit(&self, history: Option<HistoryEntry>, history_retain: usize) -> SettlementCommit {
        SettlementCommit {
            key: self.key,
            bet_ids: self
                .winners
                .iter()
                .map(|w| w.bet_id)
                .chain(self.losers.iter().map(|l| l.bet_id))
                .collect(),
            stakes_total: self.stakes_total(),
            credits: self.credits().into_iter().collect(),
            streaks: self.streaks.iter().map(|(a, s)| (*a, *s)).collect(),
            jackpot: self.jackpot_change(),
            history,
            history_retain,
        }
    }
}

/// Compute the settlement of one round
pub fn plan(
    key: RoundKey,
    bets: &[Bet],
    outcome: &Outcome,
    policy: PayoutPolicy,
    jackpot_before: Amount,
) -> SettlementPlan {
    let mut winners = Vec::new();
    let mut losers = Vec::new();
    let mut streaks = BTreeMap::new();

    for bet in bets {
        if bet.side == outcome.side {
            winners.push(WinnerLine {
                bet_id: bet.id,
                account: bet.account,
                stake: bet.amount,
                payout: apply_bps(bet.amount, policy.win_multiplier_bps),
                house_share: apply_bps(bet.amount, policy.house_rate_bps),
                jackpot_share: 0,
            });
            streaks.entry(bet.account).or_insert(StreakUpdate::Won);
        } else {
            losers.push(LoserLine {
                bet_id: bet.id,
                account: bet.account,
                stake: bet.amount,
            });
            // Any losing bet in the round resets the streak
            streaks.insert(bet.account, StreakUpdate::Lost);
        }
    }

    let lost: Amount = losers.iter().map(|l| l.stake).sum();
    let shares: Amount = winners.iter().map(|w| w.house_share).sum();
    let jackpot_contribution = lost.saturating_add(shares);

    let (jackpot_distributed, jackpot_after) = if outcome.triple && !winners.is_empty() {
        let pool = jackpot_before.saturating_add(jackpot_contribution);
        let weights: Vec<Amount> = winners.iter().map(|w| w.stake).collect();
        for (w, share) in winners.iter_mut().zip(prorate(pool, &weights)) {
            w.jackpot_share = share;
        }
        (pool, 0)
    } else {
        (0, jackpot_before.saturating_add(jackpot_contribution))
    };

    SettlementPlan {
        key,
        outcome: *outcome,
        policy,
        winners,
        losers,
        jackpot_before,
        jackpot_contribution,
        jackpot_distributed,
        jackpot_after,
        streaks,
    }
}

/// Whether the round paid out or was found already final
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    Applied,
    AlreadySettled,
}

/// What happened when a round was settled or refunded
#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub key: RoundKey,
    pub status: SettlementStatus,
    /// None for refunds and already-settled rounds
    pub plan: Option<SettlementPlan>,
    pub refunded: Amount,
    pub jackpot_after: Amount,
    pub failed_credits: Vec<CreditFailure>,
    pub attempts: u32,
}

impl SettlementReport {
    fn already_settled(key: RoundKey, jackpot_after: Amount, attempts: u32) -> Self {
        Self {
            key,
            status: SettlementStatus::AlreadySettled,
            plan: None,
            refunded: 0,
            jackpot_after,
            failed_credits: Vec::new(),
            attempts,
        }
    }

    /// Stake and credited amount per winning bet, for operator summaries
    pub fn winner_summary(&self) -> Vec<(AccountId, Amount, Amount)> {
        match &self.plan {
            Some(plan) => plan
                .winners
                .iter()
                .map(|w| (w.account, w.stake, w.credited(plan.policy.house_share_mode)))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Applies settlement plans through the ledger
pub struct SettlementEngine {
    ledger: Arc<dyn Ledger>,
    policy: PayoutPolicy,
    retry_limit: u32,
    backoff: Duration,
    history_retain: usize,
    metrics: Arc<EngineMetrics>,
}

enum Step {
    Done(SettlementReport),
    Retry(LedgerError),
}

impl SettlementEngine {
    pub fn new(ledger: Arc<dyn Ledger>, game: &GameConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            ledger,
            policy: PayoutPolicy::from_config(game),
            retry_limit: game.settlement_retry_limit.max(1),
            backoff: Duration::from_millis(game.settlement_retry_backoff_ms),
            history_retain: game.max_history,
            metrics,
        }
    }

    pub fn policy(&self) -> PayoutPolicy {
        self.policy
    }

    /// Settle `key` against `outcome`, recording `history`
    pub async fn settle(
        &self,
        key: RoundKey,
        outcome: Outcome,
        history: HistoryEntry,
    ) -> Result<SettlementReport, SettlementError> {
        self.run(key, |attempt| {
            let history = history.clone();
            async move { self.settle_once(key, &outcome, history, attempt).await }
        })
        .await
    }

    /// Return every live stake of `key` to its bettor and close the round
    pub async fn refund(&self, key: RoundKey) -> Result<SettlementReport, SettlementError> {
        self.run(key, |attempt| async move { self.refund_once(key, attempt).await })
            .await
    }

    async fn run<F, Fut>(&self, key: RoundKey, mut attempt_fn: F) -> Result<SettlementReport, SettlementError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<Step, LedgerError>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.retry_limit {
            match attempt_fn(attempt).await {
                Ok(Step::Done(report)) => {
                    for failure in &report.failed_credits {
                        tracing::error!(
                            round = %key,
                            account = %failure.account,
                            amount = failure.amount,
                            reason = %failure.reason,
                            "Winner credit failed"
                        );
                    }
                    return Ok(report);
                }
                Ok(Step::Retry(conflict)) => {
                    self.metrics.record_settlement_conflict();
                    tracing::debug!(round = %key, attempt, "Settlement conflict: {}", conflict);
                    last_error = conflict.to_string();
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(round = %key, attempt, "Settlement storage error: {}", e);
                    last_error = e.to_string();
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    self.metrics.record_settlement_failure();
                    return Err(SettlementError::Ledger(e));
                }
            }
        }

        self.metrics.record_settlement_failure();
        Err(SettlementError::SettlementFailure {
            key,
            attempts: self.retry_limit,
            reason: last_error,
        })
    }

    async fn settle_once(
        &self,
        key: RoundKey,
        outcome: &Outcome,
        history: HistoryEntry,
        attempt: u32,
    ) -> Result<Step, LedgerError> {
        if self.ledger.is_settled(key).await? {
            let jackpot = self.ledger.jackpot_amount().await?;
            return Ok(Step::Done(SettlementReport::already_settled(key, jackpot, attempt)));
        }

        let bets = self.ledger.bets_for_round(key).await?;
        let jackpot_before = self.ledger.jackpot_amount().await?;
        let plan = plan(key, &bets, outcome, self.policy, jackpot_before);
        let commit = plan.into_commit(Some(history), self.history_retain);

        match self.ledger.commit_settlement(commit).await {
            Ok(CommitOutcome::Applied {
                jackpot_after,
                failed_credits,
            }) => {
                self.metrics.record_round_settled(plan.jackpot_distributed > 0);
                tracing::info!(
                    round = %key,
                    dice = ?outcome.dice,
                    side = %outcome.side,
                    winners = plan.winners.len(),
                    losers = plan.losers.len(),
                    jackpot_after,
                    "Round settled"
                );
                Ok(Step::Done(SettlementReport {
                    key,
                    status: SettlementStatus::Applied,
                    plan: Some(plan),
                    refunded: 0,
                    jackpot_after,
                    failed_credits,
                    attempts: attempt,
                }))
            }
            Ok(CommitOutcome::AlreadySettled) => {
                let jackpot = self.ledger.jackpot_amount().await?;
                Ok(Step::Done(SettlementReport::already_settled(key, jackpot, attempt)))
            }
            Err(e) if e.is_conflict() => Ok(Step::Retry(e)),
            Err(e) => Err(e),
        }
    }

    async fn refund_once(&self, key: RoundKey, attempt: u32) -> Result<Step, LedgerError> {
        let bets = self.ledger.bets_for_round(key).await?;
        let mut credits: BTreeMap<AccountId, Amount> = BTreeMap::new();
        for bet in &bets {
            *credits.entry(bet.account).or_insert(0) += bet.amount;
        }
        let refunded: Amount = credits.values().sum();

        let commit = SettlementCommit {
            key,
            bet_ids: bets.iter().map(|b| b.id).collect(),
            stakes_total: refunded,
            credits: credits.into_iter().collect(),
            streaks: Vec::new(),
            jackpot: JackpotChange::Unchanged,
            history: None,
            history_retain: self.history_retain,
        };

        match self.ledger.commit_settlement(commit).await {
            Ok(CommitOutcome::Applied {
                jackpot_after,
                failed_credits,
            }) => {
                tracing::info!(round = %key, bets = bets.len(), refunded, "Round refunded");
                Ok(Step::Done(SettlementReport {
                    key,
                    status: SettlementStatus::Applied,
                    plan: None,
                    refunded,
                    jackpot_after,
                    failed_credits,
                    attempts: attempt,
                }))
            }
            Ok(CommitOutcome::AlreadySettled) => {
                let jackpot = self.ledger.jackpot_amount().await?;
                Ok(Step::Done(SettlementReport::already_settled(key, jackpot, attempt)))
            }
            Err(e) if e.is_conflict() => Ok(Step::Retry(e)),
            Err(e) => Err(e),
        }
    }
}
