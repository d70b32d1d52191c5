//! Settlement retries and machine supervision, driven through a ledger that
//! rejects commits on demand

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use taixiu::{
    config::EngineConfig,
    errors::{LedgerError, LedgerResult},
    ledger::{BetReceipt, CommitOutcome, Ledger, MemoryLedger, SettlementCommit, WageringProgress},
    notify::{AlertSeverity, BroadcastAnnouncer, RoomEvent},
    types::{
        Account, AccountId, Amount, Bet, ForcingMode, HistoryEntry, Leaderboard, PromoCode,
        PromoRedemption, Room, RoomId, RoomStatus, RoundKey, Side,
    },
    BetRequest, Engine, TokioClock,
};
use tokio::sync::broadcast;

const ROOM: RoomId = RoomId(-5150);
const ALICE: AccountId = AccountId(7);

/// Memory ledger whose settlement commits can be made to conflict or fail
struct FaultyLedger {
    inner: MemoryLedger,
    /// Commits still to reject with a bet-set conflict
    conflicts: AtomicU32,
    /// Reject every commit with a non-transient error
    broken: AtomicBool,
}

impl FaultyLedger {
    fn new() -> Self {
        Self {
            inner: MemoryLedger::in_memory(),
            conflicts: AtomicU32::new(0),
            broken: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Ledger for FaultyLedger {
    async fn get_account(&self, id: AccountId) -> LedgerResult<Option<Account>> {
        self.inner.get_account(id).await
    }

    async fn ensure_account(&self, id: AccountId, username: &str, at: DateTime<Utc>) -> LedgerResult<Account> {
        self.inner.ensure_account(id, username, at).await
    }

    async fn credit(&self, id: AccountId, amount: Amount) -> LedgerResult<Amount> {
        self.inner.credit(id, amount).await
    }

    async fn debit(&self, id: AccountId, amount: Amount) -> LedgerResult<Amount> {
        self.inner.debit(id, amount).await
    }

    async fn claim_start_bonus(&self, id: AccountId, amount: Amount) -> LedgerResult<Account> {
        self.inner.claim_start_bonus(id, amount).await
    }

    async fn withdraw(
        &self,
        id: AccountId,
        amount: Amount,
        on: NaiveDate,
        daily_limit: Amount,
    ) -> LedgerResult<Account> {
        self.inner.withdraw(id, amount, on, daily_limit).await
    }

    async fn withdrawn_on(&self, id: AccountId, on: NaiveDate) -> LedgerResult<Amount> {
        self.inner.withdrawn_on(id, on).await
    }

    async fn top_accounts(&self, order: Leaderboard, limit: usize) -> LedgerResult<Vec<Account>> {
        self.inner.top_accounts(order, limit).await
    }

    async fn advance_wagering(&self, id: AccountId, key: RoundKey) -> LedgerResult<WageringProgress> {
        self.inner.advance_wagering(id, key).await
    }

    async fn place_bet(&self, bet: Bet) -> LedgerResult<BetReceipt> {
        self.inner.place_bet(bet).await
    }

    async fn bets_for_round(&self, key: RoundKey) -> LedgerResult<Vec<Bet>> {
        self.inner.bets_for_round(key).await
    }

    async fn clear_bets(&self, key: RoundKey) -> LedgerResult<usize> {
        self.inner.clear_bets(key).await
    }

    async fn open_rounds(&self) -> LedgerResult<Vec<RoundKey>> {
        self.inner.open_rounds().await
    }

    async fn append_history(&self, room: RoomId, entry: HistoryEntry, retain: usize) -> LedgerResult<()> {
        self.inner.append_history(room, entry, retain).await
    }

    async fn recent_history(&self, room: RoomId, limit: usize) -> LedgerResult<Vec<HistoryEntry>> {
        self.inner.recent_history(room, limit).await
    }

    async fn jackpot_amount(&self) -> LedgerResult<Amount> {
        self.inner.jackpot_amount().await
    }

    async fn jackpot_add(&self, amount: Amount) -> LedgerResult<Amount> {
        self.inner.jackpot_add(amount).await
    }

    async fn jackpot_take_all(&self) -> LedgerResult<Amount> {
        self.inner.jackpot_take_all().await
    }

    async fn house_funded(&self) -> LedgerResult<i64> {
        self.inner.house_funded().await
    }

    async fn get_room(&self, id: RoomId) -> LedgerResult<Option<Room>> {
        self.inner.get_room(id).await
    }

    async fn upsert_room(&self, id: RoomId, title: &str, at: DateTime<Utc>) -> LedgerResult<Room> {
        self.inner.upsert_room(id, title, at).await
    }

    async fn set_room_status(&self, id: RoomId, status: RoomStatus) -> LedgerResult<Room> {
        self.inner.set_room_status(id, status).await
    }

    async fn set_room_mode(&self, id: RoomId, mode: ForcingMode) -> LedgerResult<Room> {
        self.inner.set_room_mode(id, mode).await
    }

    async fn set_room_running(&self, id: RoomId, running: bool) -> LedgerResult<Room> {
        self.inner.set_room_running(id, running).await
    }

    async fn take_forcing_mode(&self, id: RoomId) -> LedgerResult<ForcingMode> {
        self.inner.take_forcing_mode(id).await
    }

    async fn running_rooms(&self) -> LedgerResult<Vec<Room>> {
        self.inner.running_rooms().await
    }

    async fn is_settled(&self, key: RoundKey) -> LedgerResult<bool> {
        self.inner.is_settled(key).await
    }

    async fn commit_settlement(&self, commit: SettlementCommit) -> LedgerResult<CommitOutcome> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(LedgerError::Corrupted("settlement batch rejected".to_string()));
        }
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::BetSetChanged(commit.key));
        }
        self.inner.commit_settlement(commit).await
    }

    async fn create_promo(&self, promo: PromoCode) -> LedgerResult<PromoCode> {
        self.inner.create_promo(promo).await
    }

    async fn get_promo(&self, code: &str) -> LedgerResult<Option<PromoCode>> {
        self.inner.get_promo(code).await
    }

    async fn redeem_promo(&self, code: &str, account: AccountId, at: DateTime<Utc>) -> LedgerResult<PromoRedemption> {
        self.inner.redeem_promo(code, account, at).await
    }

    async fn active_redemptions(&self, account: AccountId) -> LedgerResult<Vec<PromoRedemption>> {
        self.inner.active_redemptions(account).await
    }
}

/// 10s into round 1_000 of a 60s cadence
fn start_wall() -> DateTime<Utc> {
    Utc.timestamp_opt(60_000 + 10, 0).unwrap()
}

async fn setup() -> (Engine, Arc<FaultyLedger>, broadcast::Receiver<RoomEvent>) {
    let ledger = Arc::new(FaultyLedger::new());
    let announcer = BroadcastAnnouncer::new(1024);
    let events = announcer.subscribe();
    let engine = Engine::builder(EngineConfig::testing())
        .with_ledger(ledger.clone())
        .with_clock(Arc::new(TokioClock::starting_at(start_wall())))
        .with_announcer(Arc::new(announcer))
        .build()
        .unwrap();

    engine.wallet().register(ALICE, "alice").await.unwrap();
    engine.wallet().credit(ALICE, 10_000).await.unwrap();
    engine.request_room(ROOM, "Flaky").await.unwrap();
    (engine, ledger, events)
}

fn bet(side: Side, amount: Amount) -> BetRequest {
    BetRequest {
        room: ROOM,
        account: ALICE,
        side,
        amount,
    }
}

#[tokio::test(start_paused = true)]
async fn test_conflict_retried_then_failure_stops_room() {
    let (engine, ledger, mut events) = setup().await;
    ledger.conflicts.store(1, Ordering::SeqCst);

    engine.approve_room(ROOM).await.unwrap();
    engine.wallet().place_bet(bet(Side::Tai, 1_000)).await.unwrap();

    loop {
        if let RoomEvent::ResultAnnounced { round, .. } = events.recv().await.unwrap() {
            assert_eq!(round, 1_000);
            break;
        }
    }
    let metrics = engine.metrics();
    assert_eq!(metrics.settlement_conflicts, 1);
    assert_eq!(metrics.rounds_settled, 1);
    assert!(engine.ledger().is_settled(RoundKey::new(ROOM, 1_000)).await.unwrap());

    // Round 1_001 can never commit
    ledger.broken.store(true, Ordering::SeqCst);
    let before = engine.wallet().balance(ALICE).await.unwrap();
    let receipt = engine.wallet().place_bet(bet(Side::Xiu, 2_000)).await.unwrap();
    let stranded = receipt.bet.key();
    assert_eq!(stranded.round, 1_001);

    let message = loop {
        if let RoomEvent::OperatorAlert {
            room: Some(room),
            severity: AlertSeverity::Critical,
            message,
        } = events.recv().await.unwrap()
        {
            assert_eq!(room, ROOM);
            break message;
        }
    };
    assert!(message.contains("stopped"), "unexpected alert: {}", message);

    assert_eq!(engine.room(ROOM).await.unwrap().status, RoomStatus::Stopped);
    let metrics = engine.metrics();
    assert_eq!(metrics.machine_crashes, 1);
    assert_eq!(metrics.settlement_failures, 1);
    assert_eq!(engine.wallet().balance(ALICE).await.unwrap(), before - 2_000);
    assert_eq!(engine.ledger().open_rounds().await.unwrap(), vec![stranded]);

    while engine.scheduler().is_active(ROOM) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Restarting in the same process returns the stranded stake first
    ledger.broken.store(false, Ordering::SeqCst);
    assert!(engine.start_room(ROOM).await.unwrap());
    assert_eq!(engine.wallet().balance(ALICE).await.unwrap(), before);
    assert!(engine.ledger().open_rounds().await.unwrap().is_empty());
    assert!(engine.ledger().is_settled(stranded).await.unwrap());
    assert_eq!(engine.metrics().orphan_rounds, 1);
    assert!(engine
        .recent_history(ROOM, 20)
        .await
        .unwrap()
        .iter()
        .all(|entry| entry.round != 1_001));

    engine.shutdown().await;
}
