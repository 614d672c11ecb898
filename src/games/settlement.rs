//! Settlement Module
//!
//! Winner selection and payout split for a closed round. Settlement is
//! single-shot: the `settled` flag on the round guards every write here.

use crate::errors::GameError;
use crate::games::types::{Address, Guess, Round, WinnerRecord, BPS_DENOMINATOR, WINNER_SHARE_BPS};
use serde::{Deserialize, Serialize};

/// Result of settling one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub round_id: u64,
    pub winner: Option<Address>,
    /// Ledger index of the winning guess
    pub winning_index: Option<usize>,
    pub prize: u128,
    /// Part of the pot retained by the operator
    pub operator_cut: u128,
    /// Single-participant round: the stake went straight back
    pub refund_only: bool,
}

/// Append-only list of settled rounds, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerHistory {
    records: Vec<WinnerRecord>,
}

impl WinnerHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn get_at(&self, index: usize) -> Option<&WinnerRecord> {
        self.records.get(index)
    }

    pub fn latest(&self) -> Option<&WinnerRecord> {
        self.records.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WinnerRecord> {
        self.records.iter()
    }

    fn append(&mut self, record: WinnerRecord) {
        self.records.push(record);
    }

    pub(crate) fn restore(records: Vec<WinnerRecord>) -> Self {
        Self { records }
    }
}

/// Winner share of `pot`, truncating: `pot * 9000 / 10000` without overflow
pub fn winner_share(pot: u128) -> u128 {
    (pot / BPS_DENOMINATOR) * WINNER_SHARE_BPS
        + (pot % BPS_DENOMINATOR) * WINNER_SHARE_BPS / BPS_DENOMINATOR
}

/// Stateless winner-selection and payout rules
pub struct SettlementEngine;

impl SettlementEngine {
    /// Index of the closest guess. Ties go to the earliest timestamp, then
    /// the earliest ledger position.
    pub fn select_winner(target: u32, guesses: &[Guess]) -> Option<usize> {
        guesses
            .iter()
            .enumerate()
            .min_by_key(|(index, guess)| (guess.delta(target), guess.timestamp, *index))
            .map(|(index, _)| index)
    }

    /// Compute the outcome for a round without touching it
    pub fn compute(round: &Round, guesses: &[Guess]) -> SettlementOutcome {
        let mut outcome = SettlementOutcome {
            round_id: round.id,
            winner: None,
            winning_index: None,
            prize: 0,
            operator_cut: 0,
            refund_only: false,
        };

        match guesses {
            [] => {}
            [only] => {
                outcome.winner = Some(only.player);
                outcome.winning_index = Some(0);
                outcome.prize = only.stake;
                outcome.operator_cut = round.pot.saturating_sub(only.stake);
                outcome.refund_only = true;
            }
            _ => {
                let index = Self::select_winner(round.target, guesses);
                outcome.winner = index.map(|i| guesses[i].player);
                outcome.winning_index = index;
                outcome.prize = winner_share(round.pot);
                outcome.operator_cut = round.pot - outcome.prize;
            }
        }

        outcome
    }

    /// Settle `round` once: write its terminal fields and append history.
    pub fn finalize(
        round: &mut Round,
        guesses: &[Guess],
        history: &mut WinnerHistory,
    ) -> Result<SettlementOutcome, GameError> {
        if round.settled {
            return Err(GameError::AlreadySettled(round.id));
        }

        let outcome = Self::compute(round, guesses);

        round.active = false;
        round.settled = true;
        round.winner = outcome.winner;
        round.operator_cut = outcome.operator_cut;

        history.append(WinnerRecord {
            round_id: round.id,
            winner: outcome.winner,
            target: round.target,
            prize: outcome.prize,
            refund_only: outcome.refund_only,
        });

        tracing::info!(
            round_id = round.id,
            target = round.target,
            guesses = guesses.len(),
            pot = %round.pot,
            prize = %outcome.prize,
            operator_cut = %outcome.operator_cut,
            refund_only = outcome.refund_only,
            "Round settled"
        );

        Ok(outcome)
    }
}
