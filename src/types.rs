//! Core domain types shared by every engine component

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Money in whole minor units. Balances are unsigned so they can never go negative.
pub type Amount = u64;

/// Time-derived round number: `floor(unix_millis / round_millis)`
pub type RoundIndex = u64;

/// Opaque player identity supplied by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque chat/channel identity of a betting room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two mutually exclusive outcomes a bet can be placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Big: dice total 11..=18
    Tai,
    /// Small: dice total 3..=10
    Xiu,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Tai => "tai",
            Side::Xiu => "xiu",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Tai => Side::Xiu,
            Side::Xiu => Side::Tai,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tai" | "t" => Ok(Side::Tai),
            "xiu" | "x" => Ok(Side::Xiu),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// Operator override constraining the outcome side of upcoming rounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForcingMode {
    #[default]
    Random,
    /// Next round only, then back to random
    ForceTai,
    ForceXiu,
    /// Every round until turned off
    StickyTai,
    StickyXiu,
}

impl ForcingMode {
    /// Side the resolver must produce, if any
    pub fn target(&self) -> Option<Side> {
        match self {
            ForcingMode::Random => None,
            ForcingMode::ForceTai | ForcingMode::StickyTai => Some(Side::Tai),
            ForcingMode::ForceXiu | ForcingMode::StickyXiu => Some(Side::Xiu),
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, ForcingMode::ForceTai | ForcingMode::ForceXiu)
    }

    /// Mode left in place once this one has been used for a resolution
    pub fn after_consumption(&self) -> ForcingMode {
        if self.is_one_shot() {
            ForcingMode::Random
        } else {
            *self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ForcingMode::Random => "random",
            ForcingMode::ForceTai => "force-tai",
            ForcingMode::ForceXiu => "force-xiu",
            ForcingMode::StickyTai => "sticky-tai",
            ForcingMode::StickyXiu => "sticky-xiu",
        }
    }
}

impl fmt::Display for ForcingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForcingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" | "off" => Ok(ForcingMode::Random),
            "force-tai" => Ok(ForcingMode::ForceTai),
            "force-xiu" => Ok(ForcingMode::ForceXiu),
            "sticky-tai" => Ok(ForcingMode::StickyTai),
            "sticky-xiu" => Ok(ForcingMode::StickyXiu),
            other => Err(format!("unknown forcing mode '{}'", other)),
        }
    }
}

/// Approval state of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Unapproved,
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub title: String,
    pub status: RoomStatus,
    pub mode: ForcingMode,
    /// Most recent round settled in this room. Informational only; per-round
    /// settled markers live in the ledger.
    pub last_settled_round: Option<RoundIndex>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: RoomId, title: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            status: RoomStatus::Unapproved,
            mode: ForcingMode::Random,
            last_settled_round: None,
            created_at,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status != RoomStatus::Unapproved
    }

    pub fn is_running(&self) -> bool {
        self.status == RoomStatus::Running
    }
}

/// Identity of one round in one room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundKey {
    pub room: RoomId,
    pub round: RoundIndex,
}

impl RoundKey {
    pub fn new(room: RoomId, round: RoundIndex) -> Self {
        Self { room, round }
    }
}

impl fmt::Display for RoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.room, self.round)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub balance: Amount,
    /// Operator top-ups
    pub total_deposited: Amount,
    /// Start bonus and promo grants
    pub total_bonus: Amount,
    pub total_withdrawn: Amount,
    pub total_wagered: Amount,
    pub current_streak: u32,
    pub best_streak: u32,
    pub bonus_claimed: bool,
    /// Distinct rounds wagered since the start bonus was claimed
    pub bonus_progress: u32,
    pub last_wagered_round: Option<RoundKey>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, username: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            username: username.into(),
            balance: 0,
            total_deposited: 0,
            total_bonus: 0,
            total_withdrawn: 0,
            total_wagered: 0,
            current_streak: 0,
            best_streak: 0,
            bonus_claimed: false,
            bonus_progress: 0,
            last_wagered_round: None,
            created_at,
        }
    }
}

/// A stake on one side of one round. Immutable once placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub id: Uuid,
    pub room: RoomId,
    pub round: RoundIndex,
    pub account: AccountId,
    pub side: Side,
    pub amount: Amount,
    pub placed_at: DateTime<Utc>,
}

impl Bet {
    pub fn new(
        key: RoundKey,
        account: AccountId,
        side: Side,
        amount: Amount,
        placed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: key.room,
            round: key.round,
            account,
            side,
            amount,
            placed_at,
        }
    }

    pub fn key(&self) -> RoundKey {
        RoundKey::new(self.room, self.round)
    }
}

/// Resolved dice outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub dice: [u8; 3],
    pub total: u8,
    pub side: Side,
    /// Triple one or triple six: distributes the jackpot
    pub triple: bool,
}

/// Compact record of a settled round kept for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub round: RoundIndex,
    pub dice: [u8; 3],
    pub total: u8,
    pub side: Side,
    pub triple: bool,
    pub settled_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_outcome(round: RoundIndex, outcome: &Outcome, settled_at: DateTime<Utc>) -> Self {
        Self {
            round,
            dice: outcome.dice,
            total: outcome.total,
            side: outcome.side,
            triple: outcome.triple,
            settled_at,
        }
    }
}

/// Single-use credit voucher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    pub amount: Amount,
    /// Distinct rounds the redeemer must wager in before withdrawing
    pub wager_rounds: u32,
    pub created_by: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub used_by: Option<AccountId>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoRedemption {
    pub code: String,
    pub account: AccountId,
    pub amount: Amount,
    pub wager_required: u32,
    pub wager_progress: u32,
    pub last_round: Option<RoundKey>,
    pub redeemed_at: DateTime<Utc>,
}

impl PromoRedemption {
    pub fn is_complete(&self) -> bool {
        self.wager_progress >= self.wager_required
    }
}

/// Per-account per-day withdrawal total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalDay {
    pub account: AccountId,
    pub date: NaiveDate,
    pub total: Amount,
}

/// Ordering for operator leaderboards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leaderboard {
    ByBalance,
    ByDeposits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forcing_mode_consumption() {
        assert_eq!(ForcingMode::ForceTai.after_consumption(), ForcingMode::Random);
        assert_eq!(ForcingMode::ForceXiu.after_consumption(), ForcingMode::Random);
        assert_eq!(ForcingMode::StickyXiu.after_consumption(), ForcingMode::StickyXiu);
        assert_eq!(ForcingMode::Random.target(), None);
        assert_eq!(ForcingMode::StickyTai.target(), Some(Side::Tai));
    }

    #[test]
    fn test_mode_and_side_parsing() {
        assert_eq!("sticky-xiu".parse::<ForcingMode>(), Ok(ForcingMode::StickyXiu));
        assert_eq!("OFF".parse::<ForcingMode>(), Ok(ForcingMode::Random));
        assert!("sideways".parse::<ForcingMode>().is_err());
        assert_eq!("Tai".parse::<Side>(), Ok(Side::Tai));
        assert_eq!(Side::Tai.opposite(), Side::Xiu);
    }

    #[test]
    fn test_serde_shapes() {
        let json = serde_json::to_string(&ForcingMode::ForceXiu).unwrap();
        assert_eq!(json, "\"force-xiu\"");
        let id: AccountId = serde_json::from_str("42").unwrap();
        assert_eq!(id, AccountId(42));
    }
}
