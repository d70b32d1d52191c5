//! Byte key layout for the ledger keyspace
//!
//! Numeric components are big-endian so prefix scans come back in id/round
//! order. Signed ids are sign-flipped first so negative chat ids sort too.

use crate::types::{AccountId, RoomId, RoundIndex, RoundKey};
use chrono::{Datelike, NaiveDate};
use uuid::Uuid;

pub const ACCOUNT_PREFIX: &[u8] = b"acct:";
pub const ROOM_PREFIX: &[u8] = b"room:";
pub const BET_PREFIX: &[u8] = b"bet:";
pub const HISTORY_PREFIX: &[u8] = b"hist:";
pub const PROMO_PREFIX: &[u8] = b"promo:";
pub const REDEMPTION_PREFIX: &[u8] = b"redeem:";
pub const WITHDRAWAL_PREFIX: &[u8] = b"wd:";
pub const SETTLED_PREFIX: &[u8] = b"done:";
pub const JACKPOT_KEY: &[u8] = b"meta:jackpot";
pub const HOUSE_KEY: &[u8] = b"meta:house";

fn ordered(id: i64) -> [u8; 8] {
    ((id as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn unordered(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some((u64::from_be_bytes(raw) ^ (1u64 << 63)) as i64)
}

fn with_prefix(prefix: &[u8], capacity: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + capacity);
    key.extend_from_slice(prefix);
    key
}

pub fn account_key(id: AccountId) -> Vec<u8> {
    let mut key = with_prefix(ACCOUNT_PREFIX, 8);
    key.extend_from_slice(&ordered(id.0));
    key
}

pub fn room_key(id: RoomId) -> Vec<u8> {
    let mut key = with_prefix(ROOM_PREFIX, 8);
    key.extend_from_slice(&ordered(id.0));
    key
}

/// Prefix of every live bet in one round: `bet: | room | round`
pub fn bet_round_prefix(round: RoundKey) -> Vec<u8> {
    let mut key = with_prefix(BET_PREFIX, 32);
    key.extend_from_slice(&ordered(round.room.0));
    key.extend_from_slice(&round.round.to_be_bytes());
    key
}

pub fn bet_key(round: RoundKey, id: Uuid) -> Vec<u8> {
    let mut key = bet_round_prefix(round);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Recover the round a bet key belongs to
pub fn round_of_bet_key(key: &[u8]) -> Option<RoundKey> {
    let rest = key.strip_prefix(BET_PREFIX)?;
    if rest.len() < 16 {
        return None;
    }
    let room = unordered(&rest[..8])?;
    let round: [u8; 8] = rest[8..16].try_into().ok()?;
    Some(RoundKey::new(RoomId(room), RoundIndex::from_be_bytes(round)))
}

/// Marker written in the same batch that settles or refunds `round`
pub fn settled_key(round: RoundKey) -> Vec<u8> {
    let mut key = with_prefix(SETTLED_PREFIX, 16);
    key.extend_from_slice(&ordered(round.room.0));
    key.extend_from_slice(&round.round.to_be_bytes());
    key
}

pub fn history_room_prefix(room: RoomId) -> Vec<u8> {
    let mut key = with_prefix(HISTORY_PREFIX, 16);
    key.extend_from_slice(&ordered(room.0));
    key
}

pub fn history_key(room: RoomId, round: RoundIndex) -> Vec<u8> {
    let mut key = history_room_prefix(room);
    key.extend_from_slice(&round.to_be_bytes());
    key
}

pub fn promo_key(code: &str) -> Vec<u8> {
    let mut key = with_prefix(PROMO_PREFIX, code.len());
    key.extend_from_slice(code.as_bytes());
    key
}

pub fn redemption_account_prefix(account: AccountId) -> Vec<u8> {
    let mut key = with_prefix(REDEMPTION_PREFIX, 8);
    key.extend_from_slice(&ordered(account.0));
    key
}

pub fn redemption_key(account: AccountId, code: &str) -> Vec<u8> {
    let mut key = redemption_account_prefix(account);
    key.extend_from_slice(code.as_bytes());
    key
}

pub fn withdrawal_key(account: AccountId, on: NaiveDate) -> Vec<u8> {
    let mut key = with_prefix(WITHDRAWAL_PREFIX, 12);
    key.extend_from_slice(&ordered(account.0));
    key.extend_from_slice(&on.num_days_from_ce().to_be_bytes());
    key
}
