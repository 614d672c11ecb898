use crate::errors::GameError;
use crate::games::oracle::VrfParams;
use crate::games::types::{Address, MAX_ROUND_DURATION};
use serde::{Deserialize, Serialize};

/// Singleton configuration block consumed by the round manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    pub owner: Address,
    pub entry_fee_wei: u128,
    /// Seconds a round stays open after activation
    pub round_duration: u64,
    pub paused: bool,
    pub vrf: VrfParams,
    /// Let any caller request randomness for the next round
    pub open_round_requests: bool,
}

/// Capability check run at the top of every owner-only operation
pub fn ensure_owner(settings: &GameSettings, caller: &Address) -> Result<(), GameError> {
    if settings.owner != *caller {
        return Err(GameError::Unauthorized { caller: *caller });
    }
    Ok(())
}

/// Owner-gated parameter changes and the operator balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminControl {
    settings: GameSettings,
    operator_balance: u128,
}

impl AdminControl {
    pub fn new(settings: GameSettings) -> Self {
        Self {
            settings,
            operator_balance: 0,
        }
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    pub fn operator_balance(&self) -> u128 {
        self.operator_balance
    }

    pub fn ensure_owner(&self, caller: &Address) -> Result<(), GameError> {
        ensure_owner(&self.settings, caller)
    }

    /// Blocks new entries only; settlement, requests and reads carry on
    pub fn set_paused(&mut self, caller: &Address, paused: bool) -> Result<(), GameError> {
        self.ensure_owner(caller)?;
        self.settings.paused = paused;
        tracing::info!(paused, "Entry pause updated");
        Ok(())
    }

    /// Applies to stakes of later submissions; recorded guesses keep theirs.
    /// A zero fee would let entries through without growing the pot.
    pub fn set_entry_fee_wei(&mut self, caller: &Address, amount: u128) -> Result<(), GameError> {
        self.ensure_owner(caller)?;
        if amount == 0 {
            return Err(GameError::InvalidConfiguration(
                "entry fee must be > 0".to_string(),
            ));
        }
        self.settings.entry_fee_wei = amount;
        tracing::info!(entry_fee_wei = %amount, "Entry fee updated");
        Ok(())
    }

    /// Applies from the next activation; the running round keeps its end time
    pub fn set_round_duration(&mut self, caller: &Address, seconds: u64) -> Result<(), GameError> {
        self.ensure_owner(caller)?;
        if seconds == 0 || seconds > MAX_ROUND_DURATION {
            return Err(GameError::InvalidConfiguration(format!(
                "round duration must be within 1..={} seconds",
                MAX_ROUND_DURATION
            )));
        }
        self.settings.round_duration = seconds;
        tracing::info!(round_duration = seconds, "Round duration updated");
        Ok(())
    }

    pub fn set_vrf_params(&mut self, caller: &Address, params: VrfParams) -> Result<(), GameError> {
        self.ensure_owner(caller)?;
        tracing::info!(
            coordinator = %params.coordinator,
            subscription_id = params.subscription_id,
            callback_gas_limit = params.callback_gas_limit,
            request_confirmations = params.request_confirmations,
            "Randomness provider parameters updated"
        );
        self.settings.vrf = params;
        Ok(())
    }

    pub fn set_open_round_requests(&mut self, caller: &Address, open: bool) -> Result<(), GameError> {
        self.ensure_owner(caller)?;
        self.settings.open_round_requests = open;
        Ok(())
    }

    pub fn transfer_ownership(&mut self, caller: &Address, new_owner: Address) -> Result<(), GameError> {
        self.ensure_owner(caller)?;
        tracing::info!(from = %self.settings.owner, to = %new_owner, "Ownership transferred");
        self.settings.owner = new_owner;
        Ok(())
    }

    /// Owner-only sweep of the accrued settlement remainders
    pub fn withdraw_operator_balance(&mut self, caller: &Address) -> Result<u128, GameError> {
        self.ensure_owner(caller)?;
        let amount = std::mem::take(&mut self.operator_balance);
        tracing::info!(amount = %amount, "Operator balance withdrawn");
        Ok(amount)
    }

    pub(crate) fn accrue(&mut self, amount: u128) {
        self.operator_balance += amount;
    }

    pub(crate) fn restore(settings: GameSettings, operator_balance: u128) -> Self {
        Self {
            settings,
            operator_balance,
        }
    }
}
