//! Ledger implementation over any ordered key-value store
//!
//! Values are JSON; keys follow `keys.rs`. Each multi-key mutation takes the
//! relevant entries in `KeyLocks`, reads, and writes one `KvBatch`.

use super::keys::*;
use super::locks::{KeyLocks, LockKey};
use super::rocks::RocksStore;
use super::store::{KvBatch, KvStore, MemoryStore};
use super::{
    BetReceipt, CommitOutcome, CreditFailure, JackpotChange, Ledger, SettlementCommit,
    StreakUpdate, WageringProgress,
};
use crate::config::StorageConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::types::{
    Account, AccountId, Amount, Bet, ForcingMode, HistoryEntry, Leaderboard, PromoCode,
    PromoRedemption, Room, RoomId, RoomStatus, RoundIndex, RoundKey,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Settled markers kept per room. A marker is dropped once the room settles
/// the round this many rounds later.
pub const SETTLED_MARKERS_KEPT: RoundIndex = 1_440;

pub struct StoreLedger<S: KvStore> {
    store: S,
    locks: KeyLocks,
}

/// Ledger kept entirely in process memory
pub type MemoryLedger = StoreLedger<MemoryStore>;

/// Ledger persisted in RocksDB
pub type RocksLedger = StoreLedger<RocksStore>;

impl StoreLedger<MemoryStore> {
    pub fn in_memory() -> Self {
        Self::with_store(MemoryStore::new())
    }
}

impl StoreLedger<RocksStore> {
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        Ok(Self::with_store(RocksStore::open(path)?))
    }

    pub fn from_config(config: &StorageConfig) -> LedgerResult<Self> {
        Ok(Self::with_store(RocksStore::from_config(config)?))
    }
}

fn encode<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

impl<S: KvStore> StoreLedger<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            locks: KeyLocks::new(),
        }
    }

    fn load<T: DeserializeOwned>(&self, key: &[u8]) -> LedgerResult<Option<T>> {
        match self.store.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                LedgerError::Corrupted(format!("{}: {}", String::from_utf8_lossy(key), e))
            }),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &[u8]) -> LedgerResult<Vec<(Vec<u8>, T)>> {
        self.store
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(k, v)| -> LedgerResult<(Vec<u8>, T)> { Ok((k, serde_json::from_slice(&v)?)) })
            .collect()
    }

    fn put<T: Serialize>(&self, key: Vec<u8>, value: &T) -> LedgerResult<()> {
        let mut batch = KvBatch::new();
        batch.put(key, encode(value)?);
        self.store.write(batch)
    }

    fn require_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.load(&account_key(id))?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    fn require_room(&self, id: RoomId) -> LedgerResult<Room> {
        self.load(&room_key(id))?.ok_or(LedgerError::RoomNotFound(id))
    }

    fn round_settled(&self, key: RoundKey) -> LedgerResult<bool> {
        Ok(self.store.get(&settled_key(key))?.is_some())
    }

    fn jackpot(&self) -> LedgerResult<Amount> {
        Ok(self.load(JACKPOT_KEY)?.unwrap_or(0))
    }

    fn update_room<F>(&self, id: RoomId, f: F) -> LedgerResult<Room>
    where
        F: FnOnce(&mut Room) -> LedgerResult<()>,
    {
        self.locks.with([LockKey::Room(id)], || {
            let mut room = self.require_room(id)?;
            f(&mut room)?;
            self.put(room_key(id), &room)?;
            Ok(room)
        })
    }

    fn update_account<F, R>(&self, id: AccountId, f: F) -> LedgerResult<R>
    where
        F: FnOnce(&mut Account) -> LedgerResult<R>,
    {
        self.locks.with([LockKey::Account(id)], || {
            let mut account = self.require_account(id)?;
            let out = f(&mut account)?;
            self.put(account_key(id), &account)?;
            Ok(out)
        })
    }

    /// Stage a history insert plus eviction of entries beyond `retain`
    fn stage_history(
        &self,
        batch: &mut KvBatch,
        room: RoomId,
        entry: &HistoryEntry,
        retain: usize,
    ) -> LedgerResult<()> {
        let new_key = history_key(room, entry.round);
        let mut keys: BTreeSet<Vec<u8>> = self
            .store
            .scan_prefix(&history_room_prefix(room))?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.insert(new_key.clone());
        batch.put(new_key, encode(entry)?);

        let excess = keys.len().saturating_sub(retain.max(1));
        for old in keys.into_iter().take(excess) {
            batch.delete(old);
        }
        Ok(())
    }

    fn commit_locked(&self, commit: &SettlementCommit) -> LedgerResult<CommitOutcome> {
        let key = commit.key;
        let mut room = self.require_room(key.room)?;
        if self.round_settled(key)? {
            return Ok(CommitOutcome::AlreadySettled);
        }

        let live = self.store.scan_prefix(&bet_round_prefix(key))?;
        let mut live_ids = HashSet::with_capacity(live.len());
        for (_, bytes) in &live {
            let bet: Bet = serde_json::from_slice(bytes)?;
            live_ids.insert(bet.id);
        }
        let planned: HashSet<_> = commit.bet_ids.iter().copied().collect();
        if live_ids != planned {
            return Err(LedgerError::BetSetChanged(key));
        }

        let jackpot_before = self.jackpot()?;
        let jackpot_after = match commit.jackpot {
            JackpotChange::Unchanged => jackpot_before,
            JackpotChange::Add(amount) => jackpot_before
                .checked_add(amount)
                .ok_or(LedgerError::Overflow("jackpot"))?,
            JackpotChange::Drain { expected } => {
                if expected != jackpot_before {
                    return Err(LedgerError::JackpotConflict {
                        expected,
                        actual: jackpot_before,
                    });
                }
                0
            }
        };

        let mut per_account: BTreeMap<AccountId, (Amount, Option<StreakUpdate>)> = BTreeMap::new();
        for (id, amount) in &commit.credits {
            let slot = per_account.entry(*id).or_default();
            slot.0 = slot.0.saturating_add(*amount);
        }
        for (id, update) in &commit.streaks {
            per_account.entry(*id).or_default().1 = Some(*update);
        }

        let mut batch = KvBatch::new();
        let mut applied: Amount = 0;
        let mut failed_credits = Vec::new();

        for (id, (amount, streak)) in per_account {
            let mut account = match self.load::<Account>(&account_key(id)) {
                Ok(Some(account)) => account,
                Ok(None) => {
                    if amount > 0 {
                        failed_credits.push(CreditFailure {
                            account: id,
                            amount,
                            reason: "account not found".to_string(),
                        });
                    }
                    continue;
                }
                Err(e) => {
                    if amount > 0 {
                        failed_credits.push(CreditFailure {
                            account: id,
                            amount,
                            reason: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            if amount > 0 {
                match account.balance.checked_add(amount) {
                    Some(balance) => {
                        account.balance = balance;
                        applied = applied.saturating_add(amount);
                    }
                    None => failed_credits.push(CreditFailure {
                        account: id,
                        amount,
                        reason: "balance overflow".to_string(),
                    }),
                }
            }
            match streak {
                Some(StreakUpdate::Won) => {
                    account.current_streak = account.current_streak.saturating_add(1);
                    account.best_streak = account.best_streak.max(account.current_streak);
                }
                Some(StreakUpdate::Lost) => account.current_streak = 0,
                None => {}
            }
            batch.put(account_key(id), encode(&account)?);
        }

        for (bet_key, _) in live {
            batch.delete(bet_key);
        }

        if let Some(entry) = &commit.history {
            self.stage_history(&mut batch, key.room, entry, commit.history_retain)?;
        }

        batch.put(settled_key(key), encode(&commit.stakes_total)?);
        if let Some(expired) = key.round.checked_sub(SETTLED_MARKERS_KEPT) {
            batch.delete(settled_key(RoundKey::new(key.room, expired)));
        }
        room.last_settled_round = Some(room.last_settled_round.map_or(key.round, |r| r.max(key.round)));
        batch.put(room_key(key.room), encode(&room)?);
        batch.put(JACKPOT_KEY.to_vec(), encode(&jackpot_after)?);

        let house: i64 = self.load(HOUSE_KEY)?.unwrap_or(0);
        let delta = i128::from(applied) + i128::from(jackpot_after)
            - i128::from(jackpot_before)
            - i128::from(commit.stakes_total);
        let house = i64::try_from(i128::from(house) + delta).map_err(|_| LedgerError::Overflow("house"))?;
        batch.put(HOUSE_KEY.to_vec(), encode(&house)?);

        self.store.write(batch)?;

        tracing::debug!(
            room = %key.room,
            round = key.round,
            bets = commit.bet_ids.len(),
            jackpot_before,
            jackpot_after,
            "Committed settlement"
        );

        Ok(CommitOutcome::Applied {
            jackpot_after,
            failed_credits,
        })
    }
}

#[async_trait]
impl<S: KvStore> Ledger for StoreLedger<S> {
    async fn get_account(&self, id: AccountId) -> LedgerResult<Option<Account>> {
        self.load(&account_key(id))
    }

    async fn ensure_account(&self, id: AccountId, username: &str, at: DateTime<Utc>) -> LedgerResult<Account> {
        self.locks.with([LockKey::Account(id)], || {
            let account = match self.load::<Account>(&account_key(id))? {
                Some(mut existing) => {
                    if username.is_empty() || existing.username == username {
                        return Ok(existing);
                    }
                    existing.username = username.to_string();
                    existing
                }
                None => Account::new(id, username, at),
            };
            self.put(account_key(id), &account)?;
            Ok(account)
        })
    }

    async fn credit(&self, id: AccountId, amount: Amount) -> LedgerResult<Amount> {
        self.update_account(id, |account| {
            account.balance = account
                .balance
                .checked_add(amount)
                .ok_or(LedgerError::Overflow("balance"))?;
            account.total_deposited = account.total_deposited.saturating_add(amount);
            Ok(account.balance)
        })
    }

    async fn debit(&self, id: AccountId, amount: Amount) -> LedgerResult<Amount> {
        self.update_account(id, |account| {
            if account.balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    account: id,
                    balance: account.balance,
                    requested: amount,
                });
            }
            account.balance -= amount;
            account.total_withdrawn = account.total_withdrawn.saturating_add(amount);
            Ok(account.balance)
        })
    }

    async fn claim_start_bonus(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        self.update_account(id, |account| {
            if account.bonus_claimed {
                return Err(LedgerError::BonusAlreadyClaimed(id));
            }
            account.balance = account
                .balance
                .checked_add(amount)
                .ok_or(LedgerError::Overflow("balance"))?;
            account.total_bonus = account.total_bonus.saturating_add(amount);
            account.bonus_claimed = true;
            account.bonus_progress = 0;
            Ok(account.clone())
        })
    }

    async fn withdraw(
        &self,
        id: AccountId,
        amount: Amount,
        on: NaiveDate,
        daily_limit: Amount,
    ) -> LedgerResult<Account> {
        self.locks.with([LockKey::Account(id)], || {
            let mut account = self.require_account(id)?;
            let day_key = withdrawal_key(id, on);
            let withdrawn: Amount = self.load(&day_key)?.unwrap_or(0);

            if withdrawn.saturating_add(amount) > daily_limit {
                return Err(LedgerError::DailyLimitExceeded {
                    limit: daily_limit,
                    withdrawn,
                    requested: amount,
                });
            }
            if account.balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    account: id,
                    balance: account.balance,
                    requested: amount,
                });
            }

            account.balance -= amount;
            account.total_withdrawn = account.total_withdrawn.saturating_add(amount);

            let mut batch = KvBatch::new();
            batch.put(account_key(id), encode(&account)?);
            batch.put(day_key, encode(&(withdrawn + amount))?);
            self.store.write(batch)?;
            Ok(account)
        })
    }

    async fn withdrawn_on(&self, id: AccountId, on: NaiveDate) -> LedgerResult<Amount> {
        Ok(self.load(&withdrawal_key(id, on))?.unwrap_or(0))
    }

    async fn top_accounts(&self, order: Leaderboard, limit: usize) -> LedgerResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .scan::<Account>(ACCOUNT_PREFIX)?
            .into_iter()
            .map(|(_, a)| a)
            .collect();
        match order {
            Leaderboard::ByBalance => accounts.sort_by(|a, b| b.balance.cmp(&a.balance)),
            Leaderboard::ByDeposits => {
                accounts.sort_by(|a, b| b.total_deposited.cmp(&a.total_deposited))
            }
        }
        accounts.truncate(limit);
        Ok(accounts)
    }

    async fn advance_wagering(&self, id: AccountId, key: RoundKey) -> LedgerResult<WageringProgress> {
        self.locks.with([LockKey::Account(id)], || {
            let mut account = self.require_account(id)?;
            if account.last_wagered_round == Some(key) {
                return Ok(WageringProgress::default());
            }
            account.last_wagered_round = Some(key);

            let mut progress = WageringProgress {
                counted: true,
                ..Default::default()
            };
            if account.bonus_claimed {
                account.bonus_progress = account.bonus_progress.saturating_add(1);
                progress.bonus_progress = Some(account.bonus_progress);
            }

            let mut batch = KvBatch::new();
            for (redeem_key, mut redemption) in
                self.scan::<PromoRedemption>(&redemption_account_prefix(id))?
            {
                if redemption.is_complete() || redemption.last_round == Some(key) {
                    continue;
                }
                redemption.wager_progress += 1;
                redemption.last_round = Some(key);
                batch.put(redeem_key, encode(&redemption)?);
                if redemption.is_complete() {
                    progress.promos_completed.push(redemption);
                }
            }
            batch.put(account_key(id), encode(&account)?);
            self.store.write(batch)?;
            Ok(progress)
        })
    }

    async fn place_bet(&self, bet: Bet) -> LedgerResult<BetReceipt> {
        let key = bet.key();
        self.locks
            .with([LockKey::Room(bet.room), LockKey::Account(bet.account)], || {
                let room = self.require_room(bet.room)?;
                if !room.is_running() {
                    return Err(LedgerError::RoomNotRunning(bet.room));
                }
                if self.round_settled(key)? {
                    return Err(LedgerError::RoundAlreadySettled(key));
                }

                let mut account = self.require_account(bet.account)?;
                if account.balance < bet.amount {
                    return Err(LedgerError::InsufficientFunds {
                        account: bet.account,
                        balance: account.balance,
                        requested: bet.amount,
                    });
                }
                account.balance -= bet.amount;
                account.total_wagered = account.total_wagered.saturating_add(bet.amount);

                let mut batch = KvBatch::new();
                batch.put(account_key(bet.account), encode(&account)?);
                batch.put(bet_key(key, bet.id), encode(&bet)?);
                self.store.write(batch)?;

                Ok(BetReceipt {
                    balance_after: account.balance,
                    bet,
                })
            })
    }

    async fn bets_for_round(&self, key: RoundKey) -> LedgerResult<Vec<Bet>> {
        let mut bets: Vec<Bet> = self
            .scan::<Bet>(&bet_round_prefix(key))?
            .into_iter()
            .map(|(_, b)| b)
            .collect();
        bets.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then(a.id.cmp(&b.id)));
        Ok(bets)
    }

    async fn clear_bets(&self, key: RoundKey) -> LedgerResult<usize> {
        self.locks.with([LockKey::Room(key.room)], || {
            let rows = self.store.scan_prefix(&bet_round_prefix(key))?;
            let count = rows.len();
            let mut batch = KvBatch::new();
            for (k, _) in rows {
                batch.delete(k);
            }
            if !batch.is_empty() {
                self.store.write(batch)?;
            }
            Ok(count)
        })
    }

    async fn open_rounds(&self) -> LedgerResult<Vec<RoundKey>> {
        let rounds: BTreeSet<RoundKey> = self
            .store
            .scan_prefix(BET_PREFIX)?
            .iter()
            .filter_map(|(k, _)| round_of_bet_key(k))
            .collect();
        Ok(rounds.into_iter().collect())
    }

    async fn append_history(&self, room: RoomId, entry: HistoryEntry, retain: usize) -> LedgerResult<()> {
        self.locks.with([LockKey::Room(room)], || {
            let mut batch = KvBatch::new();
            self.stage_history(&mut batch, room, &entry, retain)?;
            self.store.write(batch)
        })
    }

    async fn recent_history(&self, room: RoomId, limit: usize) -> LedgerResult<Vec<HistoryEntry>> {
        let entries: Vec<HistoryEntry> = self
            .scan::<HistoryEntry>(&history_room_prefix(room))?
            .into_iter()
            .map(|(_, e)| e)
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    async fn jackpot_amount(&self) -> LedgerResult<Amount> {
        self.jackpot()
    }

    async fn jackpot_add(&self, amount: Amount) -> LedgerResult<Amount> {
        self.locks.with([LockKey::Jackpot], || {
            let total = self
                .jackpot()?
                .checked_add(amount)
                .ok_or(LedgerError::Overflow("jackpot"))?;
            self.put(JACKPOT_KEY.to_vec(), &total)?;
            Ok(total)
        })
    }

    async fn jackpot_take_all(&self) -> LedgerResult<Amount> {
        self.locks.with([LockKey::Jackpot], || {
            let total = self.jackpot()?;
            self.put(JACKPOT_KEY.to_vec(), &0u64)?;
            Ok(total)
        })
    }

    async fn house_funded(&self) -> LedgerResult<i64> {
        Ok(self.load(HOUSE_KEY)?.unwrap_or(0))
    }

    async fn get_room(&self, id: RoomId) -> LedgerResult<Option<Room>> {
        self.load(&room_key(id))
    }

    async fn upsert_room(&self, id: RoomId, title: &str, at: DateTime<Utc>) -> LedgerResult<Room> {
        self.locks.with([LockKey::Room(id)], || {
            let room = match self.load::<Room>(&room_key(id))? {
                Some(mut existing) => {
                    if title.is_empty() || existing.title == title {
                        return Ok(existing);
                    }
                    existing.title = title.to_string();
                    existing
                }
                None => Room::new(id, title, at),
            };
            self.put(room_key(id), &room)?;
            Ok(room)
        })
    }

    async fn set_room_status(&self, id: RoomId, status: RoomStatus) -> LedgerResult<Room> {
        self.update_room(id, |room| {
            room.status = status;
            Ok(())
        })
    }

    async fn set_room_mode(&self, id: RoomId, mode: ForcingMode) -> LedgerResult<Room> {
        self.update_room(id, |room| {
            room.mode = mode;
            Ok(())
        })
    }

    async fn set_room_running(&self, id: RoomId, running: bool) -> LedgerResult<Room> {
        self.update_room(id, |room| {
            if !room.is_approved() {
                if running {
                    return Err(LedgerError::RoomNotApproved(id));
                }
                return Ok(());
            }
            room.status = if running {
                RoomStatus::Running
            } else {
                RoomStatus::Stopped
            };
            Ok(())
        })
    }

    async fn take_forcing_mode(&self, id: RoomId) -> LedgerResult<ForcingMode> {
        self.locks.with([LockKey::Room(id)], || {
            let mut room = self.require_room(id)?;
            let mode = room.mode;
            if mode.is_one_shot() {
                room.mode = mode.after_consumption();
                self.put(room_key(id), &room)?;
            }
            Ok(mode)
        })
    }

    async fn running_rooms(&self) -> LedgerResult<Vec<Room>> {
        Ok(self
            .scan::<Room>(ROOM_PREFIX)?
            .into_iter()
            .map(|(_, r)| r)
            .filter(Room::is_running)
            .collect())
    }

    async fn is_settled(&self, key: RoundKey) -> LedgerResult<bool> {
        self.round_settled(key)
    }

    async fn commit_settlement(&self, commit: SettlementCommit) -> LedgerResult<CommitOutcome> {
        let mut keys = vec![LockKey::Jackpot, LockKey::Room(commit.key.room)];
        keys.extend(commit.credits.iter().map(|(id, _)| LockKey::Account(*id)));
        keys.extend(commit.streaks.iter().map(|(id, _)| LockKey::Account(*id)));

        self.locks.with(keys, || self.commit_locked(&commit))
    }

    async fn create_promo(&self, promo: PromoCode) -> LedgerResult<PromoCode> {
        self.locks.with([LockKey::Promos], || {
            let key = promo_key(&promo.code);
            if self.store.get(&key)?.is_some() {
                return Err(LedgerError::PromoExists(promo.code.clone()));
            }
            self.put(key, &promo)?;
            Ok(promo)
        })
    }

    async fn get_promo(&self, code: &str) -> LedgerResult<Option<PromoCode>> {
        self.load(&promo_key(code))
    }

    async fn redeem_promo(&self, code: &str, account: AccountId, at: DateTime<Utc>) -> LedgerResult<PromoRedemption> {
        self.locks
            .with([LockKey::Promos, LockKey::Account(account)], || {
                let key = promo_key(code);
                let mut promo: PromoCode = self
                    .load(&key)?
                    .ok_or_else(|| LedgerError::PromoNotFound(code.to_string()))?;
                if promo.used_by.is_some() {
                    return Err(LedgerError::PromoAlreadyUsed(code.to_string()));
                }

                let mut holder = self.require_account(account)?;
                holder.balance = holder
                    .balance
                    .checked_add(promo.amount)
                    .ok_or(LedgerError::Overflow("balance"))?;
                holder.total_bonus = holder.total_bonus.saturating_add(promo.amount);

                promo.used_by = Some(account);
                promo.used_at = Some(at);

                let redemption = PromoRedemption {
                    code: promo.code.clone(),
                    account,
                    amount: promo.amount,
                    wager_required: promo.wager_rounds,
                    wager_progress: 0,
                    last_round: None,
                    redeemed_at: at,
                };

                let mut batch = KvBatch::new();
                batch.put(key, encode(&promo)?);
                batch.put(account_key(account), encode(&holder)?);
                batch.put(redemption_key(account, &promo.code), encode(&redemption)?);
                self.store.write(batch)?;
                Ok(redemption)
            })
    }

    async fn active_redemptions(&self, account: AccountId) -> LedgerResult<Vec<PromoRedemption>> {
        Ok(self
            .scan::<PromoRedemption>(&redemption_account_prefix(account))?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.is_complete())
            .collect())
    }
}
