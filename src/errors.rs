//! Error types for the tai/xiu round engine
//!
//! Each concern owns a focused enum; `EngineError` is the root that everything
//! converts into at the service boundary.

use crate::types::{AccountId, Amount, RoomId, RoundIndex, RoundKey};
use thiserror::Error;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Ledger / persistence errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Bet placement rejections
    #[error("Bet rejected: {0}")]
    Bet(#[from] BetError),

    /// Player money operations (bonus, promo, withdrawal)
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    /// Round settlement errors
    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    /// Dice resolution errors
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Room supervision errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Ledger errors. Business rejections (funds, settled rounds) are distinct from
/// storage failures so callers can decide whether a retry makes sense.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Insufficient funds for account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Amount,
        requested: Amount,
    },

    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Room {0} not found")]
    RoomNotFound(RoomId),

    #[error("Room {0} is not approved")]
    RoomNotApproved(RoomId),

    #[error("Room {0} is not running")]
    RoomNotRunning(RoomId),

    #[error("Round {0} is already settled")]
    RoundAlreadySettled(RoundKey),

    /// The jackpot moved between planning and committing a distribution
    #[error("Jackpot changed: expected {expected}, found {actual}")]
    JackpotConflict { expected: Amount, actual: Amount },

    /// Live bets for the round differ from the set the plan was built from
    #[error("Bet set for round {0} changed during settlement")]
    BetSetChanged(RoundKey),

    #[error("Start bonus already claimed by account {0}")]
    BonusAlreadyClaimed(AccountId),

    #[error("Promo code {0} not found")]
    PromoNotFound(String),

    #[error("Promo code {0} already used")]
    PromoAlreadyUsed(String),

    #[error("Promo code {0} already exists")]
    PromoExists(String),

    #[error("Daily withdrawal limit {limit} exceeded: already withdrawn {withdrawn}, requested {requested}")]
    DailyLimitExceeded {
        limit: Amount,
        withdrawn: Amount,
        requested: Amount,
    },

    #[error("Arithmetic overflow on {0}")]
    Overflow(&'static str),
}

impl LedgerError {
    /// Whether the operation may succeed if simply attempted again
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }

    /// Optimistic check failures; recompute and retry immediately
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LedgerError::JackpotConflict { .. } | LedgerError::BetSetChanged(_)
        )
    }
}

impl From<rocksdb::Error> for LedgerError {
    fn from(err: rocksdb::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Corrupted(err.to_string())
    }
}

/// Synchronous bet rejection reasons, surfaced directly to the bettor
#[derive(Debug, Error)]
pub enum BetError {
    #[error("Bet of {amount} is below the minimum of {min}")]
    InvalidBetAmount { min: Amount, amount: Amount },

    #[error("Insufficient funds: balance {balance}, stake {requested}")]
    InsufficientFunds { balance: Amount, requested: Amount },

    #[error("Room {0} is not running")]
    RoomNotRunning(RoomId),

    #[error("Betting for round {round} in room {room} is closed")]
    RoundLocked { room: RoomId, round: RoundIndex },

    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for BetError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                balance, requested, ..
            } => BetError::InsufficientFunds { balance, requested },
            LedgerError::RoomNotRunning(room) | LedgerError::RoomNotApproved(room) => {
                BetError::RoomNotRunning(room)
            }
            LedgerError::RoundAlreadySettled(key) => BetError::RoundLocked {
                room: key.room,
                round: key.round,
            },
            other => BetError::Ledger(other),
        }
    }
}

/// Player money operation errors other than bets
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(Amount),

    #[error("Start bonus wagering incomplete: {progress}/{required} rounds")]
    WageringIncomplete { required: u32, progress: u32 },

    #[error("Promo {code} wagering incomplete: {progress}/{required} rounds")]
    PromoWageringActive {
        code: String,
        required: u32,
        progress: u32,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Settlement errors
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Ledger failure that outlived the retry budget; nothing was applied
    #[error("Settlement of {key} failed after {attempts} attempts: {reason}")]
    SettlementFailure {
        key: RoundKey,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Dice resolution errors
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Dice total {0} is outside 3..=18")]
    TotalOutOfRange(u8),

    #[error("Die face {0} is outside 1..=6")]
    FaceOutOfRange(u8),
}

/// Room scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Room {0} is not approved")]
    RoomNotApproved(RoomId),

    #[error("Room {0} not found")]
    RoomNotFound(RoomId),
}

/// Announcement delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Announcement channel closed")]
    Closed,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_error_maps_to_bet_rejection() {
        let err = LedgerError::InsufficientFunds {
            account: AccountId(7),
            balance: 500,
            requested: 1000,
        };
        match BetError::from(err) {
            BetError::InsufficientFunds { balance, requested } => {
                assert_eq!(balance, 500);
                assert_eq!(requested, 1000);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }

        let settled = LedgerError::RoundAlreadySettled(RoundKey::new(RoomId(-100), 42));
        assert!(matches!(
            BetError::from(settled),
            BetError::RoundLocked { round: 42, .. }
        ));
    }

    #[test]
    fn test_conflict_classification() {
        assert!(LedgerError::JackpotConflict { expected: 1, actual: 2 }.is_conflict());
        assert!(LedgerError::Storage("io".into()).is_transient());
        assert!(!LedgerError::AccountNotFound(AccountId(1)).is_transient());
    }

    #[test]
    fn test_root_error_display() {
        let err: EngineError = ConfigurationError::MissingRequired("storage.data_directory".into()).into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required field: storage.data_directory"
        );
    }
}
