//! Taixiu - Three-Dice Betting Room Engine
//!
//! Runs fixed-length betting rounds per chat room: players stake on tai
//! (11-18) or xiu (3-10), three dice are rolled at the boundary, and every
//! bet is settled atomically against a shared ledger with a global jackpot
//! paid out on triple one or triple six.

pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod resolver;
pub mod round;
pub mod scheduler;
pub mod settlement;
pub mod types;
pub mod wallet;

pub use clock::{Clock, ManualClock, RoundClock, SystemClock, TokioClock};
pub use config::{ConfigLoader, EngineConfig, GameConfig, HouseShareMode, OrphanPolicy};
pub use engine::{Engine, EngineBuilder, StartupReport};
pub use errors::{
    BetError, EngineError, EngineResult, LedgerError, SchedulerError, SettlementError, WalletError,
};
pub use ledger::{Ledger, MemoryLedger, RocksLedger};
pub use notify::{Announcer, BroadcastAnnouncer, LogAnnouncer, Notifier, RoomEvent};
pub use resolver::OutcomeResolver;
pub use round::RoundPhase;
pub use scheduler::RoomScheduler;
pub use settlement::{SettlementEngine, SettlementReport};
pub use types::{
    Account, AccountId, Amount, Bet, ForcingMode, HistoryEntry, Outcome, Room, RoomId, RoomStatus,
    RoundIndex, RoundKey, Side,
};
pub use wallet::{BetRequest, Wallet};
