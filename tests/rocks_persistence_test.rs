//! Ledger state survives a restart on RocksDB, and bets left behind by a
//! previous process are drained before rooms resume.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use taixiu::{
    config::{EngineConfig, OrphanPolicy, StorageBackend},
    types::{AccountId, ForcingMode, RoomId, RoomStatus, Side},
    BetRequest, Engine, ManualClock,
};
use tempfile::TempDir;

const ROOM: RoomId = RoomId(-4242);
const ALICE: AccountId = AccountId(1);
const BOB: AccountId = AccountId(2);

/// `seconds_in` seconds into `round` of a 60s cadence
fn wall(round: i64, seconds_in: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(round * 60 + seconds_in, 0).unwrap()
}

fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::testing();
    config.storage.backend = StorageBackend::RocksDb;
    config.storage.data_directory = dir.path().join("ledger").to_string_lossy().to_string();
    config.storage.clear_on_start = false;
    config
}

fn engine_at(config: EngineConfig, at: DateTime<Utc>) -> Engine {
    Engine::builder(config)
        .with_clock(Arc::new(ManualClock::new(at)))
        .build()
        .unwrap()
}

/// First process: a running room with bets on round 1_000, never settled
async fn leave_open_round(config: EngineConfig) {
    let engine = engine_at(config, wall(1_000, 10));
    engine.request_room(ROOM, "Persistent").await.unwrap();
    engine
        .ledger()
        .set_room_status(ROOM, RoomStatus::Stopped)
        .await
        .unwrap();
    engine.ledger().set_room_running(ROOM, true).await.unwrap();

    for (account, name, side, stake) in [(ALICE, "alice", Side::Tai, 3_000), (BOB, "bob", Side::Xiu, 2_000)] {
        engine.wallet().register(account, name).await.unwrap();
        engine.wallet().credit(account, 10_000).await.unwrap();
        engine
            .wallet()
            .place_bet(BetRequest {
                room: ROOM,
                account,
                side,
                amount: stake,
            })
            .await
            .unwrap();
    }
    assert_eq!(engine.ledger().open_rounds().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let code = {
        let engine = engine_at(config(&dir), wall(500, 0));
        engine.request_room(ROOM, "Persistent").await.unwrap();
        engine.set_forcing_mode(ROOM, ForcingMode::StickyTai).await.unwrap();
        engine.wallet().register(ALICE, "alice").await.unwrap();
        engine.wallet().credit(ALICE, 5_000).await.unwrap();
        engine.wallet().claim_start_bonus(ALICE, "alice").await.unwrap();
        engine.ledger().jackpot_add(700).await.unwrap();
        engine.wallet().create_promo(2_500, Some(3), None).await.unwrap().code
    };

    let engine = engine_at(config(&dir), wall(501, 0));
    let alice = engine.ledger().get_account(ALICE).await.unwrap().unwrap();
    assert_eq!(alice.username, "alice");
    assert_eq!(alice.balance, 5_000 + 80_000);
    assert!(alice.bonus_claimed);
    assert_eq!(engine.jackpot().await.unwrap(), 700);

    let room = engine.room(ROOM).await.unwrap();
    assert_eq!(room.status, RoomStatus::Unapproved);
    assert_eq!(room.mode, ForcingMode::StickyTai);

    let promo = engine.ledger().get_promo(&code).await.unwrap().unwrap();
    assert_eq!((promo.amount, promo.wager_rounds, promo.used_by), (2_500, 3, None));
    assert!(engine.wallet().claim_start_bonus(ALICE, "alice").await.is_err());
}

#[tokio::test]
async fn test_orphaned_round_refunded_and_room_resumed() {
    let dir = TempDir::new().unwrap();
    leave_open_round(config(&dir)).await;

    let engine = engine_at(config(&dir), wall(1_002, 10));
    let report = engine.startup().await.unwrap();
    assert_eq!(report.orphan_rounds, 1);
    assert_eq!(report.refunded, 5_000);
    assert_eq!(report.settled, 0);
    assert_eq!(report.rooms_started, 1);
    assert!(engine.scheduler().is_active(ROOM));

    assert_eq!(engine.wallet().balance(ALICE).await.unwrap(), 10_000);
    assert_eq!(engine.wallet().balance(BOB).await.unwrap(), 10_000);
    assert!(engine.ledger().open_rounds().await.unwrap().is_empty());
    assert!(engine.recent_history(ROOM, 20).await.unwrap().is_empty());
    assert_eq!(engine.metrics().orphan_rounds, 1);

    assert_eq!(engine.shutdown().await, 1);
    assert_eq!(engine.room(ROOM).await.unwrap().status, RoomStatus::Running);
}

#[tokio::test]
async fn test_orphaned_round_settled_when_configured() {
    let dir = TempDir::new().unwrap();
    leave_open_round(config(&dir)).await;

    let mut settle = config(&dir);
    settle.game.orphan_policy = OrphanPolicy::Settle;
    {
        // Stop the room so nothing resumes; the open round is still drained
        let engine = engine_at(settle.clone(), wall(1_000, 20));
        engine.ledger().set_room_running(ROOM, false).await.unwrap();
    }

    let engine = engine_at(settle, wall(1_000, 30));
    let report = engine.startup().await.unwrap();
    assert_eq!(report.orphan_rounds, 1);
    assert_eq!(report.settled, 1);
    assert_eq!(report.rooms_started, 0);

    let history = engine.recent_history(ROOM, 20).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].round, 1_000);
    assert_eq!(engine.room(ROOM).await.unwrap().last_settled_round, Some(1_000));

    let alice = engine.wallet().balance(ALICE).await.unwrap();
    let bob = engine.wallet().balance(BOB).await.unwrap();
    let jackpot = engine.jackpot().await.unwrap();
    let house = engine.ledger().house_funded().await.unwrap();
    assert!(engine.ledger().open_rounds().await.unwrap().is_empty());
    assert_eq!((alice + bob + jackpot) as i64, 20_000 + house);

    engine.shutdown().await;
}
