//! Outcome Resolver
//!
//! Rolls three dice and derives the side. When a forcing mode demands a side the
//! dice are re-rolled organically until they land on it, so the faces still
//! look random. The attempt budget is finite: on exhaustion the last roll is
//! used as-is and the mismatch is reported, never papered over.

use crate::errors::ResolverError;
use crate::types::{ForcingMode, Outcome, Side};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

pub fn roll_dice<R: Rng + ?Sized>(rng: &mut R) -> [u8; 3] {
    [rng.gen_range(1..=6), rng.gen_range(1..=6), rng.gen_range(1..=6)]
}

/// Tai for 11..=18, xiu for 3..=10. Anything else cannot come from three dice.
pub fn side_for_total(total: u8) -> Result<Side, ResolverError> {
    match total {
        3..=10 => Ok(Side::Xiu),
        11..=18 => Ok(Side::Tai),
        other => Err(ResolverError::TotalOutOfRange(other)),
    }
}

/// Triple one or triple six
pub fn is_special_triple(dice: [u8; 3]) -> bool {
    dice[0] == dice[1] && dice[1] == dice[2] && (dice[0] == 1 || dice[0] == 6)
}

impl Outcome {
    pub fn from_dice(dice: [u8; 3]) -> Result<Self, ResolverError> {
        if let Some(bad) = dice.iter().find(|d| !(1..=6).contains(*d)) {
            return Err(ResolverError::FaceOutOfRange(*bad));
        }
        let total: u8 = dice.iter().sum();
        Ok(Self {
            dice,
            total,
            side: side_for_total(total)?,
            triple: is_special_triple(dice),
        })
    }
}

/// Result of a side-constrained roll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedRoll {
    pub outcome: Outcome,
    /// Rolls made, including the accepted one
    pub attempts: u32,
    /// True when the budget ran out and `outcome` is not on the target side
    pub exhausted: bool,
}

/// Roll until the side matches `target`, at most `max_attempts` rolls
pub fn roll_matching<R: Rng + ?Sized>(
    rng: &mut R,
    target: Side,
    max_attempts: u32,
) -> Result<ForcedRoll, ResolverError> {
    let budget = max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome = Outcome::from_dice(roll_dice(rng))?;
        if outcome.side == target {
            return Ok(ForcedRoll {
                outcome,
                attempts,
                exhausted: false,
            });
        }
        if attempts >= budget {
            return Ok(ForcedRoll {
                outcome,
                attempts,
                exhausted: true,
            });
        }
    }
}

/// A resolved round outcome plus how it was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    pub mode: ForcingMode,
    pub attempts: u32,
    pub exhausted: bool,
}

/// Dice source shared by every room
pub struct OutcomeResolver {
    rng: Mutex<StdRng>,
    max_attempts: u32,
}

impl OutcomeResolver {
    pub fn new(seed: Option<u64>, max_attempts: u32) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            max_attempts,
        }
    }

    pub fn resolve(&self, mode: ForcingMode) -> Result<Resolution, ResolverError> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        match mode.target() {
            None => Ok(Resolution {
                outcome: Outcome::from_dice(roll_dice(&mut *rng))?,
                mode,
                attempts: 1,
                exhausted: false,
            }),
            Some(target) => {
                let forced = roll_matching(&mut *rng, target, self.max_attempts)?;
                if forced.exhausted {
                    tracing::warn!(
                        mode = %mode,
                        attempts = forced.attempts,
                        side = %forced.outcome.side,
                        "Forced roll budget exhausted; using last roll"
                    );
                }
                Ok(Resolution {
                    outcome: forced.outcome,
                    mode,
                    attempts: forced.attempts,
                    exhausted: forced.exhausted,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_side_rule_covers_all_totals() {
        assert_eq!(side_for_total(3).unwrap(), Side::Xiu);
        assert_eq!(side_for_total(10).unwrap(), Side::Xiu);
        assert_eq!(side_for_total(11).unwrap(), Side::Tai);
        assert_eq!(side_for_total(18).unwrap(), Side::Tai);
        assert!(matches!(side_for_total(2), Err(ResolverError::TotalOutOfRange(2))));
        assert!(side_for_total(19).is_err());
    }

    #[test]
    fn test_triples() {
        let sixes = Outcome::from_dice([6, 6, 6]).unwrap();
        assert_eq!((sixes.total, sixes.side, sixes.triple), (18, Side::Tai, true));
        let ones = Outcome::from_dice([1, 1, 1]).unwrap();
        assert_eq!((ones.total, ones.side, ones.triple), (3, Side::Xiu, true));
        assert!(!Outcome::from_dice([3, 3, 3]).unwrap().triple);
        assert!(Outcome::from_dice([0, 3, 3]).is_err());
    }

    #[test]
    fn test_random_rolls_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..1_000 {
            let outcome = Outcome::from_dice(roll_dice(&mut rng)).unwrap();
            assert!((3..=18).contains(&outcome.total));
        }
    }

    #[test]
    fn test_forced_roll_hits_target() {
        let mut rng = StdRng::seed_from_u64(1);
        for target in [Side::Tai, Side::Xiu] {
            for _ in 0..100 {
                let roll = roll_matching(&mut rng, target, 200).unwrap();
                assert!(!roll.exhausted);
                assert_eq!(roll.outcome.side, target);
            }
        }
    }

    #[test]
    fn test_forced_roll_exhaustion_returns_last_roll() {
        // A constant generator always yields the same dice
        let mut rng = StepRng::new(0, 0);
        let first = Outcome::from_dice(roll_dice(&mut StepRng::new(0, 0))).unwrap();
        let target = first.side.opposite();

        let roll = roll_matching(&mut rng, target, 5).unwrap();
        assert!(roll.exhausted);
        assert_eq!(roll.attempts, 5);
        assert_eq!(roll.outcome, first);

        let single = roll_matching(&mut StepRng::new(0, 0), target, 0).unwrap();
        assert_eq!(single.attempts, 1, "budget is at least one roll");
    }

    #[test]
    fn test_resolver_modes() {
        let resolver = OutcomeResolver::new(Some(42), 200);
        for _ in 0..50 {
            assert_eq!(resolver.resolve(ForcingMode::ForceXiu).unwrap().outcome.side, Side::Xiu);
            assert_eq!(resolver.resolve(ForcingMode::StickyTai).unwrap().outcome.side, Side::Tai);
        }
        let free = resolver.resolve(ForcingMode::Random).unwrap();
        assert_eq!(free.attempts, 1);
    }
}
