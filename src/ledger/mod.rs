//! Ledger: durable accounts, rooms, live bets, round history and the jackpot
//!
//! The ledger is a data-access contract. Every mutation is atomic with respect
//! to concurrent callers touching the same account, room or the jackpot;
//! unrelated rooms and accounts never wait on each other.

mod keys;
mod kv;
mod locks;
mod rocks;
mod store;

pub use kv::{MemoryLedger, RocksLedger, StoreLedger};
pub use locks::{KeyLocks, LockKey};
pub use rocks::RocksStore;
pub use store::{KvBatch, KvStore, MemoryStore};

use crate::errors::LedgerResult;
use crate::types::{
    Account, AccountId, Amount, Bet, ForcingMode, HistoryEntry, Leaderboard, PromoCode,
    PromoRedemption, Room, RoomId, RoomStatus, RoundKey,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of a successful bet insertion
#[derive(Debug, Clone)]
pub struct BetReceipt {
    pub bet: Bet,
    pub balance_after: Amount,
}

/// Streak effect of a settled round on one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreakUpdate {
    Won,
    Lost,
}

/// How a settlement moves the jackpot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JackpotChange {
    Unchanged,
    Add(Amount),
    /// Zero the jackpot; it must still hold `expected` at commit time
    Drain { expected: Amount },
}

/// Everything a settlement or refund writes, applied as one unit
#[derive(Debug, Clone)]
pub struct SettlementCommit {
    pub key: RoundKey,
    /// Ids of the live bets the plan consumed; must match the ledger exactly
    pub bet_ids: Vec<Uuid>,
    pub stakes_total: Amount,
    pub credits: Vec<(AccountId, Amount)>,
    pub streaks: Vec<(AccountId, StreakUpdate)>,
    pub jackpot: JackpotChange,
    pub history: Option<HistoryEntry>,
    pub history_retain: usize,
}

/// A credit that could not be applied; the rest of the round still settles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditFailure {
    pub account: AccountId,
    pub amount: Amount,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied {
        jackpot_after: Amount,
        failed_credits: Vec<CreditFailure>,
    },
    /// The round was already settled; nothing was written
    AlreadySettled,
}

/// Effect of counting one round toward wagering requirements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WageringProgress {
    /// False when the round had already been counted for this account
    pub counted: bool,
    /// Start-bonus progress after this round, if the bonus was claimed
    pub bonus_progress: Option<u32>,
    /// Promo redemptions whose requirement this round completed
    pub promos_completed: Vec<PromoRedemption>,
}

/// Data-access contract for the round engine
#[async_trait]
pub trait Ledger: Send + Sync {
    // Accounts

    async fn get_account(&self, id: AccountId) -> LedgerResult<Option<Account>>;

    /// Fetch or create the account, refreshing its display name
    async fn ensure_account(
        &self,
        id: AccountId,
        username: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Account>;

    /// Operator top-up; counted as deposited money. Returns the new balance.
    async fn credit(&self, id: AccountId, amount: Amount) -> LedgerResult<Amount>;

    /// Remove money from circulation; fails with `InsufficientFunds`
    async fn debit(&self, id: AccountId, amount: Amount) -> LedgerResult<Amount>;

    /// One-time start bonus grant
    async fn claim_start_bonus(&self, id: AccountId, amount: Amount) -> LedgerResult<Account>;

    /// Debit with a per-day cap
    async fn withdraw(
        &self,
        id: AccountId,
        amount: Amount,
        on: NaiveDate,
        daily_limit: Amount,
    ) -> LedgerResult<Account>;

    async fn withdrawn_on(&self, id: AccountId, on: NaiveDate) -> LedgerResult<Amount>;

    async fn top_accounts(&self, order: Leaderboard, limit: usize) -> LedgerResult<Vec<Account>>;

    /// Count `key` toward bonus and promo wagering, once per distinct round
    async fn advance_wagering(&self, id: AccountId, key: RoundKey) -> LedgerResult<WageringProgress>;

    // Bets

    /// Atomic debit + insert. Rejects bets on stopped rooms and settled rounds.
    async fn place_bet(&self, bet: Bet) -> LedgerResult<BetReceipt>;

    async fn bets_for_round(&self, key: RoundKey) -> LedgerResult<Vec<Bet>>;

    /// Drop live bets without moving money; returns how many were removed
    async fn clear_bets(&self, key: RoundKey) -> LedgerResult<usize>;

    /// Every round that still has live bets, ascending
    async fn open_rounds(&self) -> LedgerResult<Vec<RoundKey>>;

    // History

    async fn append_history(&self, room: RoomId, entry: HistoryEntry, retain: usize) -> LedgerResult<()>;

    /// Most recent `limit` entries, oldest first
    async fn recent_history(&self, room: RoomId, limit: usize) -> LedgerResult<Vec<HistoryEntry>>;

    // Jackpot

    async fn jackpot_amount(&self) -> LedgerResult<Amount>;

    async fn jackpot_add(&self, amount: Amount) -> LedgerResult<Amount>;

    /// Read and zero the jackpot in one step
    async fn jackpot_take_all(&self) -> LedgerResult<Amount>;

    /// Net money the house has put in to cover multiplier payouts
    async fn house_funded(&self) -> LedgerResult<i64>;

    // Rooms

    async fn get_room(&self, id: RoomId) -> LedgerResult<Option<Room>>;

    /// Create an unapproved room, or refresh the title of an existing one
    async fn upsert_room(&self, id: RoomId, title: &str, at: DateTime<Utc>) -> LedgerResult<Room>;

    async fn set_room_status(&self, id: RoomId, status: RoomStatus) -> LedgerResult<Room>;

    async fn set_room_mode(&self, id: RoomId, mode: ForcingMode) -> LedgerResult<Room>;

    /// Toggle running on an approved room
    async fn set_room_running(&self, id: RoomId, running: bool) -> LedgerResult<Room>;

    /// Read the forcing mode and clear it if one-shot, as one step
    async fn take_forcing_mode(&self, id: RoomId) -> LedgerResult<ForcingMode>;

    async fn running_rooms(&self) -> LedgerResult<Vec<Room>>;

    // Settlement

    async fn is_settled(&self, key: RoundKey) -> LedgerResult<bool>;

    /// Apply a settlement exactly once per round
    async fn commit_settlement(&self, commit: SettlementCommit) -> LedgerResult<CommitOutcome>;

    // Promo codes

    async fn create_promo(&self, promo: PromoCode) -> LedgerResult<PromoCode>;

    async fn get_promo(&self, code: &str) -> LedgerResult<Option<PromoCode>>;

    /// Mark used, credit the redeemer and open a wagering requirement
    async fn redeem_promo(
        &self,
        code: &str,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> LedgerResult<PromoRedemption>;

    /// Redemptions whose wagering requirement is not yet met
    async fn active_redemptions(&self, account: AccountId) -> LedgerResult<Vec<PromoRedemption>>;
}
