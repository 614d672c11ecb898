//! Round lifecycle state machine.
//!
//! `Idle -> AwaitingRandomness -> Active -> Closed -> Settled`, then back to
//! requesting the next round. The `Active -> Closed` step is never driven by
//! a timer: every operation computes the effective phase from `now` first.
//! Each operation validates everything before it records anything; a
//! rejected call can at most materialize the lazy close of an expired round.

use crate::errors::GameError;
use crate::games::admin::{AdminControl, GameSettings};
use crate::games::ledger::GuessLedger;
use crate::games::oracle::{Fulfillment, OracleError, RandomnessOracleAdapter, RandomnessRequest, VrfParams};
use crate::games::settlement::{SettlementEngine, SettlementOutcome, WinnerHistory};
use crate::games::types::{in_range, Address, Guess, RandomSeed, Round, RoundPhase, WinnerRecord};
use std::collections::BTreeMap;

/// Zero commitment recorded for rounds started without the oracle
const MANUAL_COMMIT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Owns the round pointer, the pot and every transition between phases
#[derive(Debug, Clone)]
pub struct RoundManager {
    admin: AdminControl,
    oracle: RandomnessOracleAdapter,
    ledger: GuessLedger,
    rounds: BTreeMap<u64, Round>,
    current_round_id: u64,
    history: WinnerHistory,
}

impl RoundManager {
    pub fn new(settings: GameSettings) -> Self {
        Self {
            admin: AdminControl::new(settings),
            oracle: RandomnessOracleAdapter::new(),
            ledger: GuessLedger::new(),
            rounds: BTreeMap::new(),
            current_round_id: 0,
            history: WinnerHistory::new(),
        }
    }

    /// Reassemble a manager from persisted parts
    pub(crate) fn from_parts(
        admin: AdminControl,
        oracle: RandomnessOracleAdapter,
        ledger: GuessLedger,
        rounds: BTreeMap<u64, Round>,
        current_round_id: u64,
        history: WinnerHistory,
    ) -> Self {
        Self {
            admin,
            oracle,
            ledger,
            rounds,
            current_round_id,
            history,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn current_round_id(&self) -> u64 {
        self.current_round_id
    }

    /// Snapshot of the current round with the lazy close applied
    pub fn current_round(&self, now: u64) -> Option<Round> {
        self.rounds
            .get(&self.current_round_id)
            .map(|round| round.effective_at(now))
    }

    pub fn round(&self, round_id: u64, now: u64) -> Option<Round> {
        self.rounds.get(&round_id).map(|round| round.effective_at(now))
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.rounds
            .get(&self.current_round_id)
            .is_some_and(|round| round.is_open_at(now))
    }

    pub fn phase(&self, now: u64) -> RoundPhase {
        if self.oracle.pending_request().is_some() {
            return RoundPhase::AwaitingRandomness;
        }
        match self.rounds.get(&self.current_round_id) {
            None => RoundPhase::Idle,
            Some(round) => round.phase_at(now),
        }
    }

    pub fn get_guesses(&self, round_id: u64) -> &[Guess] {
        self.ledger.guesses_of(round_id)
    }

    pub fn entry_fee_wei(&self) -> u128 {
        self.admin.settings().entry_fee_wei
    }

    pub fn round_duration(&self) -> u64 {
        self.admin.settings().round_duration
    }

    pub fn owner(&self) -> Address {
        self.admin.settings().owner
    }

    pub fn paused(&self) -> bool {
        self.admin.settings().paused
    }

    pub fn vrf_params(&self) -> &VrfParams {
        &self.admin.settings().vrf
    }

    pub fn settings(&self) -> &GameSettings {
        self.admin.settings()
    }

    pub fn operator_balance(&self) -> u128 {
        self.admin.operator_balance()
    }

    pub fn prior_winners_count(&self) -> usize {
        self.history.count()
    }

    pub fn get_winner_at(&self, index: usize) -> Option<&WinnerRecord> {
        self.history.get_at(index)
    }

    pub fn pending_request(&self) -> Option<&RandomnessRequest> {
        self.oracle.pending_request()
    }

    pub fn admin(&self) -> &AdminControl {
        &self.admin
    }

    pub fn oracle(&self) -> &RandomnessOracleAdapter {
        &self.oracle
    }

    pub fn ledger(&self) -> &GuessLedger {
        &self.ledger
    }

    pub fn history(&self) -> &WinnerHistory {
        &self.history
    }

    pub fn rounds(&self) -> impl Iterator<Item = &Round> {
        self.rounds.values()
    }

    // ------------------------------------------------------------------
    // Round lifecycle
    // ------------------------------------------------------------------

    /// Ask the oracle for the next round's randomness. Returns immediately;
    /// activation happens when the fulfillment arrives.
    pub fn request_next_round(&mut self, caller: &Address, now: u64) -> Result<RandomnessRequest, GameError> {
        if !self.admin.settings().open_round_requests {
            self.admin.ensure_owner(caller)?;
        }
        if let Some(pending) = self.oracle.pending_request() {
            return Err(GameError::RandomnessAlreadyPending {
                request_id: pending.request_id,
            });
        }
        self.ensure_no_round_in_progress(now)?;

        let next_id = self.current_round_id + 1;
        let params = self.admin.settings().vrf.clone();
        let request = self
            .oracle
            .request_randomness(next_id, &params, now)
            .map_err(|e| match e {
                OracleError::AlreadyRequested { request_id, .. } => {
                    GameError::RandomnessAlreadyPending { request_id }
                }
                OracleError::UnknownRequest(id) => GameError::UnknownRequest(id),
                other => GameError::InvalidConfiguration(other.to_string()),
            })?;

        tracing::info!(
            request_id = request.request_id,
            round_id = next_id,
            rng_commit = %request.rng_commit,
            "Randomness requested for next round"
        );
        Ok(request)
    }

    /// Oracle callback. Activates the round on the first delivery for a live
    /// handle; repeats and superseded handles are no-ops.
    pub fn on_fulfilled(&mut self, request_id: u64, seed: &RandomSeed, now: u64) -> Result<Fulfillment, GameError> {
        let live = self
            .oracle
            .pending_request()
            .is_some_and(|pending| pending.request_id == request_id);
        let end_time = if live { Some(self.round_end(now)?) } else { None };

        let fulfillment = self
            .oracle
            .on_fulfilled(request_id, seed)
            .map_err(|_| GameError::UnknownRequest(request_id))?;

        match fulfillment {
            Fulfillment::Resolved { round_id, target } => {
                let rng_commit = self
                    .oracle
                    .request(request_id)
                    .map(|entry| entry.request.rng_commit.clone())
                    .unwrap_or_default();
                let end_time = match end_time {
                    Some(end_time) => end_time,
                    None => self.round_end(now)?,
                };
                self.activate(round_id, target, Some(request_id), rng_commit, now, end_time);
            }
            Fulfillment::Duplicate | Fulfillment::Stale => {
                tracing::debug!(request_id, ?fulfillment, "Ignoring repeated or stale fulfillment");
            }
        }

        Ok(fulfillment)
    }

    /// Operational fallback: start the next round with a supplied target,
    /// retiring any request the oracle never answered.
    pub fn admin_start_next_round_manual(
        &mut self,
        caller: &Address,
        target: u32,
        now: u64,
    ) -> Result<Round, GameError> {
        self.admin.ensure_owner(caller)?;
        if !in_range(target) {
            return Err(GameError::InvalidTarget(target));
        }
        self.ensure_no_round_in_progress(now)?;
        let end_time = self.round_end(now)?;

        if let Some(superseded) = self.oracle.supersede_pending() {
            tracing::warn!(request_id = superseded, "Pending randomness request superseded by manual start");
        }

        let next_id = self.current_round_id + 1;
        let round = self.activate(next_id, target, None, MANUAL_COMMIT.to_string(), now, end_time);
        Ok(round)
    }

    pub fn submit_guess(
        &mut self,
        player: &Address,
        number: u32,
        stake: u128,
        now: u64,
    ) -> Result<usize, GameError> {
        self.refresh_expiry(now);

        if self.admin.settings().paused {
            return Err(GameError::Paused);
        }
        let round = self
            .rounds
            .get(&self.current_round_id)
            .ok_or(GameError::RoundNotActive)?;
        if round.settled {
            return Err(GameError::RoundNotActive);
        }
        if round.has_ended_at(now) {
            return Err(GameError::RoundExpired {
                round_id: round.id,
                end_time: round.end_time,
            });
        }
        if !round.active {
            return Err(GameError::RoundNotActive);
        }
        if !in_range(number) {
            return Err(GameError::InvalidGuess(number));
        }
        let fee = self.admin.settings().entry_fee_wei;
        if stake != fee {
            return Err(GameError::InsufficientStake {
                expected: fee,
                provided: stake,
            });
        }

        let round_id = round.id;
        // keep timestamps non-decreasing within the round even if the clock steps back
        let timestamp = self
            .ledger
            .guesses_of(round_id)
            .last()
            .map_or(now, |last| last.timestamp.max(now));
        let index = self.ledger.record(round_id, *player, number, stake, timestamp)?;

        if let Some(round) = self.rounds.get_mut(&round_id) {
            round.pot += stake;
            round.guesses_count += 1;
        }

        tracing::debug!(round_id, index, player = %player, number, "Guess recorded");
        Ok(index)
    }

    /// Close and settle the current round once its end time has passed
    pub fn end_and_settle(&mut self, caller: &Address, now: u64) -> Result<SettlementOutcome, GameError> {
        self.admin.ensure_owner(caller)?;
        self.refresh_expiry(now);

        let round_id = self.current_round_id;
        let round = self.rounds.get(&round_id).ok_or(GameError::RoundNotActive)?;
        if round.settled {
            return Err(GameError::AlreadySettled(round_id));
        }
        if !round.has_ended_at(now) {
            return Err(GameError::NotYetEnded {
                round_id,
                end_time: round.end_time,
            });
        }

        self.ledger.close_round(round_id);
        let round = self
            .rounds
            .get_mut(&round_id)
            .ok_or(GameError::RoundNotActive)?;
        let outcome = SettlementEngine::finalize(round, self.ledger.guesses_of(round_id), &mut self.history)?;
        self.admin.accrue(outcome.operator_cut);

        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    pub fn set_paused(&mut self, caller: &Address, paused: bool) -> Result<(), GameError> {
        self.admin.set_paused(caller, paused)
    }

    pub fn set_entry_fee_wei(&mut self, caller: &Address, amount: u128) -> Result<(), GameError> {
        self.admin.set_entry_fee_wei(caller, amount)
    }

    pub fn set_round_duration(&mut self, caller: &Address, seconds: u64) -> Result<(), GameError> {
        self.admin.set_round_duration(caller, seconds)
    }

    pub fn set_vrf_params(&mut self, caller: &Address, params: VrfParams) -> Result<(), GameError> {
        self.admin.set_vrf_params(caller, params)
    }

    pub fn set_open_round_requests(&mut self, caller: &Address, open: bool) -> Result<(), GameError> {
        self.admin.set_open_round_requests(caller, open)
    }

    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<(), GameError> {
        self.admin.transfer_ownership(caller, new_owner)
    }

    pub fn withdraw_operator_balance(&mut self, caller: &Address) -> Result<u128, GameError> {
        self.admin.withdraw_operator_balance(caller)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_no_round_in_progress(&self, now: u64) -> Result<(), GameError> {
        match self.rounds.get(&self.current_round_id) {
            Some(round) if round.phase_at(now) != RoundPhase::Settled => {
                Err(GameError::RoundInProgress(round.id))
            }
            _ => Ok(()),
        }
    }

    /// End time for a round activated at `now`
    fn round_end(&self, now: u64) -> Result<u64, GameError> {
        let duration = self.admin.settings().round_duration;
        now.checked_add(duration).ok_or_else(|| {
            GameError::InvalidConfiguration(format!(
                "round duration {} overflows start time {}",
                duration, now
            ))
        })
    }

    /// Materialize the time-based close on the stored round
    fn refresh_expiry(&mut self, now: u64) {
        let round_id = self.current_round_id;
        if let Some(round) = self.rounds.get_mut(&round_id) {
            if round.active && round.has_ended_at(now) {
                round.active = false;
                self.ledger.close_round(round_id);
                tracing::debug!(round_id, end_time = round.end_time, "Round closed for entries");
            }
        }
    }

    fn activate(
        &mut self,
        round_id: u64,
        target: u32,
        request_id: Option<u64>,
        rng_commit: String,
        now: u64,
        end_time: u64,
    ) -> Round {
        let round = Round {
            id: round_id,
            start_time: now,
            end_time,
            active: true,
            settled: false,
            target,
            pot: 0,
            guesses_count: 0,
            winner: None,
            rng_commit,
            request_id,
            manual: request_id.is_none(),
            operator_cut: 0,
        };

        self.ledger.open_round(round_id);
        self.rounds.insert(round_id, round.clone());
        self.current_round_id = round_id;

        tracing::info!(
            round_id,
            end_time = round.end_time,
            manual = round.manual,
            "Round activated"
        );
        round
    }
}
