//! Player and operator money operations
//!
//! Bet placement, the one-time start bonus, promo codes, withdrawals and
//! operator top-ups. Every balance change goes through a single atomic ledger
//! call; the checks here only decide whether to make it.

use crate::clock::{Clock, RoundClock};
use crate::config::{BonusConfig, GameConfig};
use crate::errors::{BetError, EngineResult, LedgerError, WalletError};
use crate::ledger::{BetReceipt, Ledger};
use crate::metrics::EngineMetrics;
use crate::notify::{Notifier, RoomEvent};
use crate::types::{
    Account, AccountId, Amount, Bet, Leaderboard, PromoCode, PromoRedemption, RoomId, RoundKey, Side,
};
use rand::RngCore;
use std::sync::Arc;

/// A wager as received from the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetRequest {
    pub room: RoomId,
    pub account: AccountId,
    pub side: Side,
    pub amount: Amount,
}

pub struct Wallet {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    rounds: RoundClock,
    game: Arc<GameConfig>,
    bonus: BonusConfig,
    notifier: Notifier,
    metrics: Arc<EngineMetrics>,
}

impl Wallet {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        game: Arc<GameConfig>,
        bonus: BonusConfig,
        notifier: Notifier,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            ledger,
            clock,
            rounds: RoundClock::new(game.round_seconds),
            game,
            bonus,
            notifier,
            metrics,
        }
    }

    /// Create the account on first contact, or refresh its display name
    pub async fn register(&self, account: AccountId, username: &str) -> EngineResult<Account> {
        Ok(self.ledger.ensure_account(account, username, self.clock.now()).await?)
    }

    pub async fn balance(&self, account: AccountId) -> EngineResult<Amount> {
        let record = self
            .ledger
            .get_account(account)
            .await?
            .ok_or(LedgerError::AccountNotFound(account))?;
        Ok(record.balance)
    }

    /// Validate and place a bet on the room's current round
    pub async fn place_bet(&self, request: BetRequest) -> Result<BetReceipt, BetError> {
        let result = self.try_place_bet(request).await;
        match &result {
            Ok(receipt) => {
                self.metrics.record_bet_accepted(receipt.bet.amount);
                tracing::debug!(
                    room = %request.room,
                    round = receipt.bet.round,
                    account = %request.account,
                    side = %request.side,
                    amount = request.amount,
                    "Bet accepted"
                );
            }
            Err(e) => {
                self.metrics.record_bet_rejected();
                tracing::debug!(room = %request.room, account = %request.account, "Bet rejected: {}", e);
            }
        }
        result
    }

    async fn try_place_bet(&self, request: BetRequest) -> Result<BetReceipt, BetError> {
        if request.amount < self.game.min_bet {
            return Err(BetError::InvalidBetAmount {
                min: self.game.min_bet,
                amount: request.amount,
            });
        }

        let room = self
            .ledger
            .get_room(request.room)
            .await?
            .ok_or(BetError::RoomNotRunning(request.room))?;
        if !room.is_running() {
            return Err(BetError::RoomNotRunning(request.room));
        }

        // A bet validated just before the lock can still land; the ledger
        // rejects it only once the round is settled.
        let now = self.clock.now();
        let round = self.rounds.round_index(now);
        if self.rounds.is_locked(now, self.game.lock_seconds) {
            return Err(BetError::RoundLocked {
                room: request.room,
                round,
            });
        }

        let key = RoundKey::new(request.room, round);
        let bet = Bet::new(key, request.account, request.side, request.amount, now);
        Ok(self.ledger.place_bet(bet).await?)
    }

    /// Count a settled round toward the wagering requirements of everyone
    /// who bet in it. Refunded rounds never reach here. Progress is
    /// bookkeeping; a failure is logged and the settlement stands.
    pub async fn record_wagering(&self, key: RoundKey, accounts: impl IntoIterator<Item = AccountId>) {
        for account in accounts {
            let progress = match self.ledger.advance_wagering(account, key).await {
                Ok(progress) => progress,
                Err(e) => {
                    tracing::warn!(account = %account, round = %key, "Wagering progress not recorded: {}", e);
                    continue;
                }
            };
            if progress.bonus_progress == Some(self.bonus.required_rounds) {
                self.notifier.publish(RoomEvent::WageringCompleted {
                    account,
                    promo_code: None,
                });
            }
            for redemption in progress.promos_completed {
                self.notifier.publish(RoomEvent::WageringCompleted {
                    account,
                    promo_code: Some(redemption.code),
                });
            }
        }
    }

    pub async fn claim_start_bonus(&self, account: AccountId, username: &str) -> EngineResult<Account> {
        self.ledger.ensure_account(account, username, self.clock.now()).await?;
        let record = self
            .ledger
            .claim_start_bonus(account, self.bonus.start_bonus)
            .await?;
        tracing::info!(account = %account, amount = self.bonus.start_bonus, "Start bonus granted");
        Ok(record)
    }

    /// Operator top-up
    pub async fn credit(&self, account: AccountId, amount: Amount) -> EngineResult<Amount> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount(amount).into());
        }
        let balance = self.ledger.credit(account, amount).await?;
        tracing::info!(account = %account, amount, balance, "Account credited");
        Ok(balance)
    }

    /// Pay out to the player, subject to wagering requirements and the daily cap
    pub async fn withdraw(&self, account: AccountId, amount: Amount) -> EngineResult<Account> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount(amount).into());
        }
        let record = self
            .ledger
            .get_account(account)
            .await?
            .ok_or(LedgerError::AccountNotFound(account))?;

        if record.bonus_claimed && record.bonus_progress < self.bonus.required_rounds {
            return Err(WalletError::WageringIncomplete {
                required: self.bonus.required_rounds,
                progress: record.bonus_progress,
            }
            .into());
        }
        if let Some(active) = self.ledger.active_redemptions(account).await?.into_iter().next() {
            return Err(WalletError::PromoWageringActive {
                code: active.code,
                required: active.wager_required,
                progress: active.wager_progress,
            }
            .into());
        }

        let today = self.clock.now().date_naive();
        let updated = self
            .ledger
            .withdraw(account, amount, today, self.bonus.daily_withdrawal_limit)
            .await?;
        tracing::info!(account = %account, amount, balance = updated.balance, "Withdrawal recorded");
        Ok(updated)
    }

    /// Issue a single-use code worth `amount`
    pub async fn create_promo(
        &self,
        amount: Amount,
        wager_rounds: Option<u32>,
        created_by: Option<AccountId>,
    ) -> EngineResult<PromoCode> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount(amount).into());
        }
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);

        let promo = PromoCode {
            code: hex::encode_upper(bytes),
            amount,
            wager_rounds: wager_rounds.unwrap_or(self.bonus.promo_default_rounds),
            created_by,
            created_at: self.clock.now(),
            used_by: None,
            used_at: None,
        };
        let promo = self.ledger.create_promo(promo).await?;
        tracing::info!(code = %promo.code, amount, "Promo code created");
        Ok(promo)
    }

    pub async fn redeem_promo(&self, account: AccountId, code: &str) -> EngineResult<PromoRedemption> {
        let code = code.trim().to_ascii_uppercase();
        let redemption = self.ledger.redeem_promo(&code, account, self.clock.now()).await?;
        tracing::info!(account = %account, code = %code, amount = redemption.amount, "Promo redeemed");
        Ok(redemption)
    }

    pub async fn leaderboard(&self, order: Leaderboard, limit: usize) -> EngineResult<Vec<Account>> {
        Ok(self.ledger.top_accounts(order, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::errors::EngineError;
    use crate::ledger::MemoryLedger;
    use crate::notify::BroadcastAnnouncer;
    use crate::types::RoomStatus;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    const ROOM: RoomId = RoomId(-300);

    struct Fixture {
        wallet: Wallet,
        ledger: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
        events: tokio::sync::broadcast::Receiver<RoomEvent>,
    }

    async fn fixture() -> Fixture {
        let config = EngineConfig::testing();
        let ledger = Arc::new(MemoryLedger::in_memory());
        // 10s into a round
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(600_010, 0).unwrap()));
        ledger.upsert_room(ROOM, "room", clock.now()).await.unwrap();
        ledger.set_room_status(ROOM, RoomStatus::Running).await.unwrap();

        let announcer = BroadcastAnnouncer::new(64);
        let events = announcer.subscribe();
        let wallet = Wallet::new(
            ledger.clone(),
            clock.clone(),
            Arc::new(config.game.clone()),
            config.bonus.clone(),
            Notifier::spawn(Arc::new(announcer), 64),
            Arc::new(EngineMetrics::new()),
        );
        Fixture {
            wallet,
            ledger,
            clock,
            events,
        }
    }

    fn request(account: i64, side: Side, amount: Amount) -> BetRequest {
        BetRequest {
            room: ROOM,
            account: AccountId(account),
            side,
            amount,
        }
    }

    #[tokio::test]
    async fn test_bet_validation() {
        let fx = fixture().await;
        fx.wallet.register(AccountId(1), "a").await.unwrap();
        fx.wallet.credit(AccountId(1), 500).await.unwrap();

        let err = fx.wallet.place_bet(request(1, Side::Tai, 999)).await.unwrap_err();
        assert!(matches!(err, BetError::InvalidBetAmount { min: 1_000, amount: 999 }));

        let err = fx.wallet.place_bet(request(1, Side::Tai, 1_000)).await.unwrap_err();
        assert!(matches!(err, BetError::InsufficientFunds { balance: 500, requested: 1_000 }));
        assert_eq!(fx.wallet.balance(AccountId(1)).await.unwrap(), 500);

        fx.ledger.set_room_running(ROOM, false).await.unwrap();
        fx.wallet.credit(AccountId(1), 5_000).await.unwrap();
        let err = fx.wallet.place_bet(request(1, Side::Tai, 1_000)).await.unwrap_err();
        assert!(matches!(err, BetError::RoomNotRunning(_)));
    }

    #[tokio::test]
    async fn test_lock_window_rejects() {
        let fx = fixture().await;
        fx.wallet.register(AccountId(1), "a").await.unwrap();
        fx.wallet.credit(AccountId(1), 5_000).await.unwrap();

        // 55s into the round: inside the 5s lock window
        fx.clock.advance(ChronoDuration::seconds(45));
        let err = fx.wallet.place_bet(request(1, Side::Xiu, 1_000)).await.unwrap_err();
        assert!(matches!(err, BetError::RoundLocked { round: 10_000, .. }));

        // Next round opens
        fx.clock.advance(ChronoDuration::seconds(5));
        let receipt = fx.wallet.place_bet(request(1, Side::Xiu, 1_000)).await.unwrap();
        assert_eq!(receipt.bet.round, 10_001);
        assert_eq!(receipt.balance_after, 4_000);
    }

    #[tokio::test]
    async fn test_start_bonus_gates_withdrawal() {
        let mut fx = fixture().await;
        let account = AccountId(5);
        let record = fx.wallet.claim_start_bonus(account, "newbie").await.unwrap();
        assert_eq!(record.balance, 80_000);
        assert!(fx.wallet.claim_start_bonus(account, "newbie").await.is_err());

        let err = fx.wallet.withdraw(account, 10_000).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::WageringIncomplete { required: 8, progress: 0 })
        ));

        for _ in 0..8 {
            let receipt = fx.wallet.place_bet(request(5, Side::Tai, 1_000)).await.unwrap();
            fx.wallet.place_bet(request(5, Side::Xiu, 1_000)).await.unwrap();
            assert_eq!(
                fx.ledger.get_account(account).await.unwrap().unwrap().bonus_progress,
                0,
                "placing a bet alone does not count"
            );
            // Settled once, with both bets in it
            let key = receipt.bet.key();
            fx.wallet.record_wagering(key, [account, account]).await;
            fx.wallet.record_wagering(key, [account]).await;
            fx.ledger.clear_bets(key).await.unwrap();
            fx.clock.advance(ChronoDuration::seconds(60));
        }
        let record = fx.ledger.get_account(account).await.unwrap().unwrap();
        assert_eq!(record.bonus_progress, 8);

        let completed = loop {
            if let RoomEvent::WageringCompleted { account: a, promo_code } = fx.events.recv().await.unwrap() {
                break (a, promo_code);
            }
        };
        assert_eq!(completed, (account, None));

        let after = fx.wallet.withdraw(account, 10_000).await.unwrap();
        assert_eq!(after.balance, 80_000 - 16_000 - 10_000);
    }

    #[tokio::test]
    async fn test_promo_roundtrip() {
        let fx = fixture().await;
        let promo = fx.wallet.create_promo(20_000, Some(1), None).await.unwrap();
        assert_eq!(promo.code.len(), 8);
        assert!(promo.code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));

        fx.wallet.register(AccountId(2), "b").await.unwrap();
        let redemption = fx
            .wallet
            .redeem_promo(AccountId(2), &promo.code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(redemption.amount, 20_000);
        assert!(fx.wallet.redeem_promo(AccountId(2), &promo.code).await.is_err());

        let err = fx.wallet.withdraw(AccountId(2), 1_000).await.unwrap_err();
        assert!(matches!(err, EngineError::Wallet(WalletError::PromoWageringActive { .. })));

        let receipt = fx.wallet.place_bet(request(2, Side::Tai, 1_000)).await.unwrap();
        assert!(fx.wallet.withdraw(AccountId(2), 1_000).await.is_err(), "bet not settled yet");
        fx.wallet.record_wagering(receipt.bet.key(), [AccountId(2)]).await;
        fx.wallet.withdraw(AccountId(2), 1_000).await.unwrap();
        assert_eq!(fx.wallet.balance(AccountId(2)).await.unwrap(), 18_000);
    }

    #[tokio::test]
    async fn test_leaderboard_by_deposits() {
        let fx = fixture().await;
        for (id, amount) in [(1, 3_000), (2, 9_000), (3, 1_000)] {
            fx.wallet.register(AccountId(id), "p").await.unwrap();
            fx.wallet.credit(AccountId(id), amount).await.unwrap();
        }
        let top = fx.wallet.leaderboard(Leaderboard::ByDeposits, 2).await.unwrap();
        let ids: Vec<_> = top.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![AccountId(2), AccountId(1)]);
        assert!(fx.wallet.credit(AccountId(1), 0).await.is_err());
    }
}
