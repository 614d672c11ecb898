//! Randomness acquisition for round targets.
//!
//! The adapter keeps the request table: one pending request at a time, each
//! handle resolved at most once. Seeds are turned into targets with
//! `seed mod RANGE_SIZE + GUESS_MIN`.

use crate::games::types::{RandomSeed, GUESS_MIN, RANGE_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Opaque provider parameters, passed through with every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfParams {
    pub coordinator: String,
    pub key_hash: String,
    pub subscription_id: u64,
    pub callback_gas_limit: u32,
    pub request_confirmations: u16,
}

impl Default for VrfParams {
    fn default() -> Self {
        Self {
            coordinator: "local".to_string(),
            key_hash: format!("0x{}", "00".repeat(32)),
            subscription_id: 0,
            callback_gas_limit: 250_000,
            request_confirmations: 3,
        }
    }
}

/// A randomness request as handed to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    pub request_id: u64,
    /// Round the fulfillment will activate
    pub round_id: u64,
    /// Hex sha256 over request id and round id
    pub rng_commit: String,
    pub params: VrfParams,
    pub requested_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Fulfilled { target: u32 },
    /// Replaced by a manual start before the oracle answered
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEntry {
    pub request: RandomnessRequest,
    pub status: RequestStatus,
}

/// What a delivered fulfillment means for the round pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fulfillment {
    /// First answer for a live request: activate `round_id` with `target`
    Resolved { round_id: u64, target: u32 },
    /// Handle was already resolved; nothing to do
    Duplicate,
    /// Handle was superseded by a manual start; nothing to do
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("request {request_id} for round {round_id} already pending")]
    AlreadyRequested { round_id: u64, request_id: u64 },

    #[error("unknown request handle {0}")]
    UnknownRequest(u64),

    #[error("randomness provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid randomness proof: {0}")]
    InvalidProof(String),

    #[error("fulfillment channel closed")]
    ChannelClosed,
}

/// Map a raw oracle word onto the target range
pub fn derive_target(seed: &RandomSeed) -> u32 {
    seed.reduce(RANGE_SIZE) + GUESS_MIN
}

pub fn request_commitment(request_id: u64, round_id: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_id.to_be_bytes());
    hasher.update(round_id.to_be_bytes());
    hex::encode(hasher.finalize())
}

/// Request table for the external randomness provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RandomnessOracleAdapter {
    next_request_id: u64,
    pending: Option<u64>,
    requests: BTreeMap<u64, RequestEntry>,
}

impl RandomnessOracleAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request for `round_id`. Only one request may be outstanding.
    pub fn request_randomness(
        &mut self,
        round_id: u64,
        params: &VrfParams,
        now: u64,
    ) -> Result<RandomnessRequest, OracleError> {
        if let Some(pending) = self.pending_request() {
            return Err(OracleError::AlreadyRequested {
                round_id: pending.round_id,
                request_id: pending.request_id,
            });
        }

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let request = RandomnessRequest {
            request_id,
            round_id,
            rng_commit: request_commitment(request_id, round_id),
            params: params.clone(),
            requested_at: now,
        };

        self.requests.insert(
            request_id,
            RequestEntry {
                request: request.clone(),
                status: RequestStatus::Pending,
            },
        );
        self.pending = Some(request_id);
        Ok(request)
    }

    /// Resolve a handle with the provider's seed. Repeat deliveries are no-ops.
    pub fn on_fulfilled(&mut self, request_id: u64, seed: &RandomSeed) -> Result<Fulfillment, OracleError> {
        let entry = self
            .requests
            .get_mut(&request_id)
            .ok_or(OracleError::UnknownRequest(request_id))?;

        match entry.status {
            RequestStatus::Pending => {
                let target = derive_target(seed);
                entry.status = RequestStatus::Fulfilled { target };
                if self.pending == Some(request_id) {
                    self.pending = None;
                }
                Ok(Fulfillment::Resolved {
                    round_id: entry.request.round_id,
                    target,
                })
            }
            RequestStatus::Fulfilled { .. } => Ok(Fulfillment::Duplicate),
            RequestStatus::Superseded => Ok(Fulfillment::Stale),
        }
    }

    /// Retire the outstanding request, if any, in favour of a manual start
    pub fn supersede_pending(&mut self) -> Option<u64> {
        let request_id = self.pending.take()?;
        if let Some(entry) = self.requests.get_mut(&request_id) {
            entry.status = RequestStatus::Superseded;
        }
        Some(request_id)
    }

    pub fn pending_request(&self) -> Option<&RandomnessRequest> {
        self.pending
            .and_then(|id| self.requests.get(&id))
            .map(|entry| &entry.request)
    }

    pub fn request(&self, request_id: u64) -> Option<&RequestEntry> {
        self.requests.get(&request_id)
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Highest handle issued so far
    pub fn last_request_id(&self) -> u64 {
        self.next_request_id
    }

    pub fn pending_id(&self) -> Option<u64> {
        self.pending
    }

    pub fn entries(&self) -> impl Iterator<Item = &RequestEntry> {
        self.requests.values()
    }

    pub(crate) fn restore(last_request_id: u64, pending: Option<u64>, entries: Vec<RequestEntry>) -> Self {
        let requests: BTreeMap<u64, RequestEntry> = entries
            .into_iter()
            .map(|entry| (entry.request.request_id, entry))
            .collect();
        let next_request_id = requests.keys().next_back().copied().unwrap_or(0).max(last_request_id);
        Self {
            next_request_id,
            pending: pending.filter(|id| requests.contains_key(id)),
            requests,
        }
    }
}
