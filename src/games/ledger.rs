use crate::errors::GameError;
use crate::games::types::{Address, Guess};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Append-only record of guesses, scoped by round id.
///
/// Entries keep arrival order; that order is what settlement uses to break ties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessLedger {
    entries: BTreeMap<u64, Vec<Guess>>,
    /// Rounds currently accepting entries
    open: BTreeSet<u64>,
}

impl GuessLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_round(&mut self, round_id: u64) {
        self.entries.entry(round_id).or_default();
        self.open.insert(round_id);
    }

    pub fn close_round(&mut self, round_id: u64) {
        self.open.remove(&round_id);
    }

    pub fn is_open(&self, round_id: u64) -> bool {
        self.open.contains(&round_id)
    }

    /// Append a guess and return its 0-based index within the round
    pub fn record(
        &mut self,
        round_id: u64,
        player: Address,
        number: u32,
        stake: u128,
        timestamp: u64,
    ) -> Result<usize, GameError> {
        if !self.is_open(round_id) {
            return Err(GameError::RoundClosed(round_id));
        }

        let guesses = self.entries.entry(round_id).or_default();
        guesses.push(Guess {
            player,
            number,
            timestamp,
            stake,
        });
        Ok(guesses.len() - 1)
    }

    /// Guesses for the round in submission order (empty for unknown rounds)
    pub fn guesses_of(&self, round_id: u64) -> &[Guess] {
        self.entries
            .get(&round_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self, round_id: u64) -> usize {
        self.guesses_of(round_id).len()
    }

    pub fn total_stake(&self, round_id: u64) -> u128 {
        self.guesses_of(round_id).iter().map(|g| g.stake).sum()
    }

    /// Rebuild a round's entries from persisted records
    pub(crate) fn restore(&mut self, round_id: u64, guesses: Vec<Guess>, open: bool) {
        self.entries.insert(round_id, guesses);
        if open {
            self.open.insert(round_id);
        } else {
            self.open.remove(&round_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_preserves_order() {
        let mut ledger = GuessLedger::new();
        ledger.open_round(1);

        let alice = Address::repeat_byte(1);
        let bob = Address::repeat_byte(2);
        assert_eq!(ledger.record(1, alice, 200, 10, 100).unwrap(), 0);
        assert_eq!(ledger.record(1, bob, 2, 10, 100).unwrap(), 1);

        let guesses = ledger.guesses_of(1);
        assert_eq!(guesses.len(), 2);
        assert_eq!(guesses[0].player, alice);
        assert_eq!(guesses[1].player, bob);
        assert_eq!(ledger.total_stake(1), 20);

        // re-reading does not consume anything
        assert_eq!(ledger.guesses_of(1), guesses);
    }

    #[test]
    fn test_closed_round_rejects_entries() {
        let mut ledger = GuessLedger::new();
        assert_eq!(
            ledger.record(3, Address::ZERO, 1, 1, 0),
            Err(GameError::RoundClosed(3))
        );

        ledger.open_round(3);
        ledger.record(3, Address::ZERO, 1, 1, 0).unwrap();
        ledger.close_round(3);
        assert_eq!(
            ledger.record(3, Address::ZERO, 1, 1, 0),
            Err(GameError::RoundClosed(3))
        );
        assert_eq!(ledger.len(3), 1);
    }

    #[test]
    fn test_rounds_are_isolated() {
        let mut ledger = GuessLedger::new();
        ledger.open_round(1);
        ledger.open_round(2);
        ledger.record(1, Address::ZERO, 5, 1, 0).unwrap();

        assert_eq!(ledger.len(1), 1);
        assert!(ledger.guesses_of(2).is_empty());
        assert!(ledger.guesses_of(99).is_empty());
    }
}
