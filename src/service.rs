//! Async host around the round engine.
//!
//! `GameService` is the single writer: every operation takes the manager
//! lock, applies one engine call to a working copy, persists what that call
//! changed and only then swaps the copy in and publishes a [`RoundEvent`].
//! A failed commit therefore leaves memory and storage as they were. Oracle answers come in through
//! [`FulfillmentWorker`], which feeds them through the same path.

use crate::{
    clock::Clock,
    errors::{ConfigurationError, GameError, GuessRoundsError, GuessRoundsResult},
    game_store::{self, ChangeSet},
    games::{
        oracle::{Fulfillment, OracleError, RandomnessRequest, RequestStatus},
        Address, FulfillmentMessage, GameSettings, Guess, LocalVrfProvider, PendingActivations,
        RandomSeed, RandomnessProvider, Round, RoundManager, RoundPhase, SettlementOutcome,
        VrfParams, WinnerRecord,
    },
    metrics::EngineMetrics,
    storage::KvStore,
};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Notifications published after each committed state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoundEvent {
    RandomnessRequested {
        request_id: u64,
        round_id: u64,
        rng_commit: String,
    },
    RoundActivated {
        round: Round,
    },
    GuessSubmitted {
        round_id: u64,
        index: usize,
        player: Address,
        number: u32,
    },
    RoundSettled {
        outcome: SettlementOutcome,
    },
    FulfillmentIgnored {
        request_id: u64,
    },
    PauseChanged {
        paused: bool,
    },
    SettingsChanged,
    OperatorWithdrawal {
        amount: u128,
    },
}

/// Point-in-time view for status displays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub now: u64,
    pub phase: RoundPhase,
    pub current_round_id: u64,
    pub current_round: Option<Round>,
    pub seconds_remaining: u64,
    pub pending_request: Option<RandomnessRequest>,
    pub settings: GameSettings,
    pub operator_balance: u128,
    pub prior_winners_count: usize,
}

#[derive(Clone)]
pub struct GameService {
    manager: Arc<Mutex<RoundManager>>,
    store: Arc<dyn KvStore>,
    provider: Arc<dyn RandomnessProvider>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    events: broadcast::Sender<RoundEvent>,
    activations: PendingActivations,
}

impl GameService {
    /// Load the engine from `store`, or initialise it with `initial` when the
    /// store is empty. `initial` is ignored once state exists.
    pub fn open(
        initial: GameSettings,
        store: Arc<dyn KvStore>,
        provider: Arc<dyn RandomnessProvider>,
        clock: Arc<dyn Clock>,
    ) -> GuessRoundsResult<Self> {
        let manager = match game_store::load_manager(store.as_ref())? {
            Some(manager) => manager,
            None => {
                tracing::info!(owner = %initial.owner, "Initialising new round engine");
                let manager = RoundManager::new(initial);
                game_store::snapshot(&manager)?.commit(store.as_ref())?;
                manager
            }
        };

        let metrics = EngineMetrics::new().map_err(|e| {
            ConfigurationError::ValidationFailed(format!("metrics registry: {}", e))
        })?;
        let now = clock.now();
        if let Some(round) = manager.current_round(now) {
            metrics.set_round(round.id, round.pot);
        }
        metrics.set_operator_balance(manager.operator_balance());

        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Ok(Self {
            manager: Arc::new(Mutex::new(manager)),
            store,
            provider,
            clock,
            metrics,
            events,
            activations: PendingActivations::new(),
        })
    }

    /// Resize the event channel; existing subscribers are dropped
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Open a randomness request and hand it to the provider. Does not wait
    /// for the answer; see [`GameService::wait_for_activation`].
    pub async fn request_next_round(&self, caller: Address) -> GuessRoundsResult<RandomnessRequest> {
        let request = {
            let mut manager = self.manager.lock().await;
            let now = self.clock.now();
            self.transact(
                &mut manager,
                |m| m.request_next_round(&caller, now),
                |m, request| ChangeSet::new().oracle(m.oracle(), Some(request.request_id)),
            )?
        };

        self.metrics.randomness_requests.inc();
        self.emit(RoundEvent::RandomnessRequested {
            request_id: request.request_id,
            round_id: request.round_id,
            rng_commit: request.rng_commit.clone(),
        });

        if let Err(e) = self.provider.request(request.clone()).await {
            // The request stays pending; a manual start can still move the game on.
            tracing::warn!(request_id = request.request_id, error = %e, "Randomness provider rejected request");
            return Err(e.into());
        }
        Ok(request)
    }

    /// Apply an oracle answer. Repeated and superseded handles are accepted
    /// and ignored.
    pub async fn on_fulfilled(&self, request_id: u64, seed: RandomSeed) -> GuessRoundsResult<Fulfillment> {
        let mut manager = self.manager.lock().await;
        let now = self.clock.now();
        let fulfillment = self.transact(
            &mut manager,
            |m| m.on_fulfilled(request_id, &seed, now),
            |m, fulfillment| match fulfillment {
                Fulfillment::Resolved { round_id, .. } => {
                    let round = m.round(*round_id, now).ok_or(GameError::RoundNotActive)?;
                    let changes = ChangeSet::new()
                        .oracle(m.oracle(), Some(request_id))?
                        .round(&round)?
                        .current_round(*round_id);
                    Ok(changes)
                }
                Fulfillment::Duplicate | Fulfillment::Stale => Ok(ChangeSet::new()),
            },
        )?;

        match fulfillment {
            Fulfillment::Resolved { round_id, .. } => {
                let round = manager.round(round_id, now).ok_or(GameError::RoundNotActive)?;
                drop(manager);

                self.metrics.rounds_started.inc();
                self.metrics.set_round(round.id, round.pot);
                let woken = self.activations.complete(request_id, &round);
                tracing::info!(request_id, round_id, target = round.target, woken, "Round activated by oracle");
                self.emit(RoundEvent::RoundActivated { round });
            }
            Fulfillment::Duplicate | Fulfillment::Stale => {
                drop(manager);
                self.metrics.fulfillments_ignored.inc();
                self.emit(RoundEvent::FulfillmentIgnored { request_id });
            }
        }
        Ok(fulfillment)
    }

    pub async fn admin_start_next_round_manual(&self, caller: Address, target: u32) -> GuessRoundsResult<Round> {
        let mut manager = self.manager.lock().await;
        let now = self.clock.now();
        let superseded = manager.pending_request().map(|r| r.request_id);
        let round = self.transact(
            &mut manager,
            |m| m.admin_start_next_round_manual(&caller, target, now),
            |m, round| {
                let changes = ChangeSet::new()
                    .oracle(m.oracle(), superseded)?
                    .round(round)?
                    .current_round(round.id);
                Ok(changes)
            },
        )?;
        drop(manager);

        if let Some(request_id) = superseded {
            self.activations.cancel(request_id);
        }
        self.metrics.rounds_started.inc();
        self.metrics.set_round(round.id, round.pot);
        self.emit(RoundEvent::RoundActivated { round: round.clone() });
        Ok(round)
    }

    /// Record a guess; `stake` must equal the current entry fee
    pub async fn submit_guess(&self, player: Address, number: u32, stake: u128) -> GuessRoundsResult<usize> {
        let mut manager = self.manager.lock().await;
        let now = self.clock.now();
        let index = self.transact(
            &mut manager,
            |m| m.submit_guess(&player, number, stake, now),
            |m, index| {
                let round_id = m.current_round_id();
                let round = m.round(round_id, now).ok_or(GameError::RoundNotActive)?;
                let guess = m.get_guesses(round_id).get(*index).ok_or(GameError::RoundNotActive)?;
                ChangeSet::new().round(&round)?.guess(round_id, *index, guess)
            },
        )?;

        let round_id = manager.current_round_id();
        let pot = manager.round(round_id, now).map_or(0, |round| round.pot);
        drop(manager);

        self.metrics.guesses_accepted.inc();
        self.metrics.set_round(round_id, pot);
        self.emit(RoundEvent::GuessSubmitted {
            round_id,
            index,
            player,
            number,
        });
        Ok(index)
    }

    pub async fn end_and_settle(&self, caller: Address) -> GuessRoundsResult<SettlementOutcome> {
        let mut manager = self.manager.lock().await;
        let now = self.clock.now();
        let outcome = self.transact(
            &mut manager,
            |m| m.end_and_settle(&caller, now),
            |m, outcome| {
                let round = m.round(outcome.round_id, now).ok_or(GameError::RoundNotActive)?;
                let index = m.prior_winners_count().saturating_sub(1);
                let record = m.get_winner_at(index).ok_or(GameError::RoundNotActive)?;
                ChangeSet::new()
                    .round(&round)?
                    .winner(index, record)?
                    .admin(m.admin())
            },
        )?;
        let balance = manager.operator_balance();
        drop(manager);

        self.metrics.rounds_settled.inc();
        self.metrics.set_operator_balance(balance);
        self.emit(RoundEvent::RoundSettled {
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    pub async fn set_paused(&self, caller: Address, paused: bool) -> GuessRoundsResult<()> {
        self.update_settings(|m| m.set_paused(&caller, paused)).await?;
        self.emit(RoundEvent::PauseChanged { paused });
        Ok(())
    }

    pub async fn set_entry_fee_wei(&self, caller: Address, amount: u128) -> GuessRoundsResult<()> {
        self.update_settings(|m| m.set_entry_fee_wei(&caller, amount)).await?;
        self.emit(RoundEvent::SettingsChanged);
        Ok(())
    }

    pub async fn set_round_duration(&self, caller: Address, seconds: u64) -> GuessRoundsResult<()> {
        self.update_settings(|m| m.set_round_duration(&caller, seconds)).await?;
        self.emit(RoundEvent::SettingsChanged);
        Ok(())
    }

    pub async fn set_vrf_params(&self, caller: Address, params: VrfParams) -> GuessRoundsResult<()> {
        self.update_settings(|m| m.set_vrf_params(&caller, params)).await?;
        self.emit(RoundEvent::SettingsChanged);
        Ok(())
    }

    pub async fn set_open_round_requests(&self, caller: Address, open: bool) -> GuessRoundsResult<()> {
        self.update_settings(|m| m.set_open_round_requests(&caller, open)).await?;
        self.emit(RoundEvent::SettingsChanged);
        Ok(())
    }

    pub async fn transfer_ownership(&self, caller: Address, new_owner: Address) -> GuessRoundsResult<()> {
        self.update_settings(|m| m.transfer_ownership(&caller, new_owner)).await?;
        self.emit(RoundEvent::SettingsChanged);
        Ok(())
    }

    pub async fn withdraw_operator_balance(&self, caller: Address) -> GuessRoundsResult<u128> {
        let amount = self
            .update_settings(|m| m.withdraw_operator_balance(&caller))
            .await?;
        self.metrics.set_operator_balance(0);
        self.emit(RoundEvent::OperatorWithdrawal { amount });
        Ok(amount)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn current_round_id(&self) -> u64 {
        self.manager.lock().await.current_round_id()
    }

    pub async fn current_round(&self) -> Option<Round> {
        self.manager.lock().await.current_round(self.clock.now())
    }

    pub async fn round(&self, round_id: u64) -> Option<Round> {
        self.manager.lock().await.round(round_id, self.clock.now())
    }

    pub async fn is_active(&self) -> bool {
        self.manager.lock().await.is_active(self.clock.now())
    }

    pub async fn phase(&self) -> RoundPhase {
        self.manager.lock().await.phase(self.clock.now())
    }

    pub async fn get_guesses(&self, round_id: u64) -> Vec<Guess> {
        self.manager.lock().await.get_guesses(round_id).to_vec()
    }

    pub async fn entry_fee_wei(&self) -> u128 {
        self.manager.lock().await.entry_fee_wei()
    }

    pub async fn round_duration(&self) -> u64 {
        self.manager.lock().await.round_duration()
    }

    pub async fn owner(&self) -> Address {
        self.manager.lock().await.owner()
    }

    pub async fn paused(&self) -> bool {
        self.manager.lock().await.paused()
    }

    pub async fn vrf_params(&self) -> VrfParams {
        self.manager.lock().await.vrf_params().clone()
    }

    pub async fn operator_balance(&self) -> u128 {
        self.manager.lock().await.operator_balance()
    }

    pub async fn prior_winners_count(&self) -> usize {
        self.manager.lock().await.prior_winners_count()
    }

    pub async fn get_winner_at(&self, index: usize) -> Option<WinnerRecord> {
        self.manager.lock().await.get_winner_at(index).cloned()
    }

    pub async fn winners(&self) -> Vec<WinnerRecord> {
        self.manager.lock().await.history().iter().cloned().collect()
    }

    pub async fn pending_request(&self) -> Option<RandomnessRequest> {
        self.manager.lock().await.pending_request().cloned()
    }

    pub async fn status(&self) -> EngineStatus {
        let manager = self.manager.lock().await;
        let now = self.clock.now();
        let current_round = manager.current_round(now);
        EngineStatus {
            now,
            phase: manager.phase(now),
            current_round_id: manager.current_round_id(),
            seconds_remaining: current_round
                .as_ref()
                .map_or(0, |round| round.seconds_remaining(now)),
            current_round,
            pending_request: manager.pending_request().cloned(),
            settings: manager.settings().clone(),
            operator_balance: manager.operator_balance(),
            prior_winners_count: manager.prior_winners_count(),
        }
    }

    /// Wait until `request_id` activates a round. Returns `None` on timeout or
    /// when the request is superseded by a manual start.
    pub async fn wait_for_activation(&self, request_id: u64, timeout: Duration) -> Option<Round> {
        let rx = {
            let manager = self.manager.lock().await;
            let entry = manager.oracle().request(request_id)?;
            match entry.status {
                RequestStatus::Fulfilled { .. } => {
                    return manager.round(entry.request.round_id, self.clock.now());
                }
                RequestStatus::Superseded => return None,
                // subscribe under the lock so the activation cannot slip past us
                RequestStatus::Pending => self.activations.subscribe(request_id),
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(round)) => Some(round),
            Ok(Err(_)) => None,
            Err(_) => {
                // our receiver is gone; drop its sender so the entry does not linger
                let pruned = self.activations.prune(request_id);
                tracing::debug!(request_id, pruned, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for activation");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn update_settings<T>(
        &self,
        apply: impl FnOnce(&mut RoundManager) -> Result<T, GameError>,
    ) -> GuessRoundsResult<T> {
        let mut manager = self.manager.lock().await;
        self.transact(&mut manager, apply, |m, _| ChangeSet::new().admin(m.admin()))
    }

    /// Run `op` on a copy of the engine and install the copy only once the
    /// writes from `persist` are committed.
    fn transact<T>(
        &self,
        manager: &mut RoundManager,
        op: impl FnOnce(&mut RoundManager) -> Result<T, GameError>,
        persist: impl FnOnce(&RoundManager, &T) -> GuessRoundsResult<ChangeSet>,
    ) -> GuessRoundsResult<T> {
        let mut next = manager.clone();
        let value = op(&mut next).map_err(|e| self.rejected(e))?;
        self.commit(persist(&next, &value)?)?;
        *manager = next;
        Ok(value)
    }

    fn rejected(&self, error: GameError) -> GuessRoundsError {
        self.metrics.record_rejection(error.kind());
        tracing::debug!(reason = error.kind(), error = %error, "Operation rejected");
        error.into()
    }

    fn commit(&self, changes: ChangeSet) -> GuessRoundsResult<()> {
        changes.commit(self.store.as_ref()).map_err(|e| {
            tracing::error!(error = %e, "Failed to persist engine state");
            e
        })
    }

    fn emit(&self, event: RoundEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Background task applying oracle answers from the inbound channel.
///
/// Answers carrying a proof are checked against the stored request before
/// they reach the engine; a failed check drops the message. With a trusted
/// key set, proofs from any other key are refused too.
pub struct FulfillmentWorker {
    service: GameService,
    trusted_key: Option<String>,
    running: Arc<AtomicBool>,
    shutdown: Notify,
}

impl FulfillmentWorker {
    pub fn spawn(
        service: GameService,
        rx: mpsc::Receiver<FulfillmentMessage>,
        trusted_key: Option<String>,
    ) -> Arc<Self> {
        let worker = Arc::new(Self {
            service,
            trusted_key,
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Notify::new(),
        });
        worker.clone().spawn_task(rx);
        worker
    }

    /// Stop the task even while it is parked on an empty channel
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_task(self: Arc<Self>, mut rx: mpsc::Receiver<FulfillmentMessage>) {
        tokio::spawn(async move {
            while self.is_running() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.notified() => break,
                    message = rx.recv() => {
                        let Some(message) = message else {
                            tracing::info!("Fulfillment channel closed; worker exiting");
                            break;
                        };
                        if let Err(e) = self.handle(message).await {
                            tracing::warn!("Fulfillment rejected: {}", e);
                        }
                    }
                }
            }
            self.running.store(false, Ordering::SeqCst);
            tracing::debug!("Fulfillment worker stopped");
        });
    }

    async fn handle(&self, message: FulfillmentMessage) -> GuessRoundsResult<Fulfillment> {
        if message.proof.is_none() && self.trusted_key.is_some() {
            return Err(OracleError::InvalidProof(format!(
                "request {} answered without a proof",
                message.request_id
            ))
            .into());
        }
        if let Some(proof) = &message.proof {
            if let Some(trusted) = &self.trusted_key {
                if !proof.public_key.eq_ignore_ascii_case(trusted) {
                    return Err(OracleError::InvalidProof(format!(
                        "request {} answered by untrusted key {}",
                        message.request_id, proof.public_key
                    ))
                    .into());
                }
            }
            let expected = {
                let manager = self.service.manager.lock().await;
                manager
                    .oracle()
                    .request(message.request_id)
                    .map(|entry| LocalVrfProvider::input_message(&entry.request))
                    .ok_or(GameError::UnknownRequest(message.request_id))?
            };
            if !LocalVrfProvider::verify_seed_proof(&message.seed, proof, &expected)? {
                return Err(OracleError::InvalidProof(format!(
                    "seed for request {} does not match its proof",
                    message.request_id
                ))
                .into());
            }
        }
        self.service.on_fulfilled(message.request_id, message.seed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::StorageError;
    use crate::games::DeferredProvider;
    use crate::storage::{BatchOp, MemoryStorage};

    /// Memory store whose batch writes can be made to fail on demand
    struct FailingStore {
        inner: MemoryStorage,
        fail_writes: AtomicBool,
    }

    impl FailingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.fail_writes.store(failing, Ordering::SeqCst);
        }
    }

    impl KvStore for FailingStore {
        fn get(&self, key: &[u8]) -> GuessRoundsResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> GuessRoundsResult<()> {
            self.inner.put(key, value)
        }

        fn delete(&self, key: &[u8]) -> GuessRoundsResult<()> {
            self.inner.delete(key)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> GuessRoundsResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }

        fn batch_write(&self, ops: Vec<BatchOp>) -> GuessRoundsResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::WriteFailed("disk full".to_string()).into());
            }
            self.inner.batch_write(ops)
        }
    }

    const FEE: u128 = 10_000_000_000_000;
    const T0: u64 = 1_700_000_000;

    fn owner() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn settings() -> GameSettings {
        GameSettings {
            owner: owner(),
            entry_fee_wei: FEE,
            round_duration: 3600,
            paused: false,
            vrf: VrfParams::default(),
            open_round_requests: false,
        }
    }

    fn service() -> (GameService, Arc<ManualClock>, Arc<DeferredProvider>) {
        let clock = Arc::new(ManualClock::new(T0));
        let provider = Arc::new(DeferredProvider::new());
        let service = GameService::open(
            settings(),
            Arc::new(MemoryStorage::new()),
            provider.clone(),
            clock.clone(),
        )
        .unwrap();
        (service, clock, provider)
    }

    #[tokio::test]
    async fn test_request_is_forwarded_to_provider() {
        let (service, _clock, provider) = service();
        let request = service.request_next_round(owner()).await.unwrap();

        let seen = provider.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], request);
        assert_eq!(service.phase().await, RoundPhase::AwaitingRandomness);
    }

    #[tokio::test]
    async fn test_events_follow_round() {
        let (service, clock, _provider) = service();
        let mut events = service.subscribe();

        let request = service.request_next_round(owner()).await.unwrap();
        service
            .on_fulfilled(request.request_id, RandomSeed::from(100u64))
            .await
            .unwrap();
        service
            .submit_guess(Address::repeat_byte(1), 101, FEE)
            .await
            .unwrap();
        clock.advance(3600);
        service.end_and_settle(owner()).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            RoundEvent::RandomnessRequested { round_id: 1, .. }
        ));
        match events.recv().await.unwrap() {
            RoundEvent::RoundActivated { round } => assert_eq!(round.target, 101),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            RoundEvent::GuessSubmitted { index: 0, number: 101, .. }
        ));
        match events.recv().await.unwrap() {
            RoundEvent::RoundSettled { outcome } => {
                assert!(outcome.refund_only);
                assert_eq!(outcome.prize, FEE);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejections_are_counted() {
        let (service, _clock, _provider) = service();
        let err = service
            .submit_guess(Address::repeat_byte(1), 5, FEE)
            .await
            .unwrap_err();
        assert_eq!(err.as_game_error(), Some(&GameError::RoundNotActive));
        assert!(service
            .metrics()
            .render()
            .contains("reason=\"round_not_active\""));
    }

    #[tokio::test]
    async fn test_wait_for_activation() {
        let (service, _clock, _provider) = service();
        let request = service.request_next_round(owner()).await.unwrap();

        let waiter = {
            let service = service.clone();
            let request_id = request.request_id;
            tokio::spawn(async move { service.wait_for_activation(request_id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        service
            .on_fulfilled(request.request_id, RandomSeed::from(9u64))
            .await
            .unwrap();
        let round = waiter.await.unwrap().expect("round should activate");
        assert_eq!(round.target, 10);

        // already-fulfilled handles answer immediately
        let again = service
            .wait_for_activation(request.request_id, Duration::from_millis(1))
            .await;
        assert_eq!(again.map(|r| r.id), Some(1));
    }

    #[tokio::test]
    async fn test_wait_for_superseded_request() {
        let (service, _clock, _provider) = service();
        let request = service.request_next_round(owner()).await.unwrap();
        service.admin_start_next_round_manual(owner(), 500).await.unwrap();

        assert!(service
            .wait_for_activation(request.request_id, Duration::from_millis(10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_worker_applies_local_vrf_answers() {
        let (tx, rx) = mpsc::channel(8);
        let clock = Arc::new(ManualClock::new(T0));
        let provider = Arc::new(LocalVrfProvider::new_random(tx, Duration::ZERO));
        let trusted = provider.public_key_hex();
        let service = GameService::open(
            settings(),
            Arc::new(MemoryStorage::new()),
            provider,
            clock,
        )
        .unwrap();
        let worker = FulfillmentWorker::spawn(service.clone(), rx, Some(trusted));

        let request = service.request_next_round(owner()).await.unwrap();
        let round = service
            .wait_for_activation(request.request_id, Duration::from_secs(5))
            .await
            .expect("local provider should answer");
        assert!((1..=1000).contains(&round.target));
        assert_eq!(round.rng_commit, request.rng_commit);
        assert!(worker.is_running());
        worker.stop();
    }

    #[tokio::test]
    async fn test_worker_drops_forged_proof() {
        let (tx, rx) = mpsc::channel(8);
        let (service, _clock, _provider) = service();
        let (signer_tx, _signer_rx) = mpsc::channel(1);
        let signer = LocalVrfProvider::new_random(signer_tx.clone(), Duration::ZERO);
        let _worker = FulfillmentWorker::spawn(service.clone(), rx, Some(signer.public_key_hex()));
        let request = service.request_next_round(owner()).await.unwrap();

        // a valid proof for this request, paired with a different seed
        let (_seed, proof) = signer.generate(&request);
        tx.send(FulfillmentMessage {
            request_id: request.request_id,
            seed: RandomSeed::from(1u64),
            proof: Some(proof),
        })
        .await
        .unwrap();

        // a self-consistent answer from a key nobody trusts
        let impostor = LocalVrfProvider::new_random(signer_tx, Duration::ZERO);
        let (seed, proof) = impostor.generate(&request);
        tx.send(FulfillmentMessage {
            request_id: request.request_id,
            seed,
            proof: Some(proof),
        })
        .await
        .unwrap();

        assert!(service
            .wait_for_activation(request.request_id, Duration::from_millis(50))
            .await
            .is_none());
        assert_eq!(service.phase().await, RoundPhase::AwaitingRandomness);
    }

    #[tokio::test]
    async fn test_withdraw_resets_balance() {
        let (service, clock, _provider) = service();
        service.admin_start_next_round_manual(owner(), 100).await.unwrap();
        service.submit_guess(Address::repeat_byte(1), 90, FEE).await.unwrap();
        service.submit_guess(Address::repeat_byte(2), 95, FEE).await.unwrap();
        clock.advance(3600);
        let outcome = service.end_and_settle(owner()).await.unwrap();

        let expected = 2 * FEE - outcome.prize;
        assert_eq!(service.operator_balance().await, expected);
        assert_eq!(service.withdraw_operator_balance(owner()).await.unwrap(), expected);
        assert_eq!(service.operator_balance().await, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_engine_untouched() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(FailingStore::new());
        let service = GameService::open(
            settings(),
            store.clone(),
            Arc::new(DeferredProvider::new()),
            clock.clone(),
        )
        .unwrap();
        service.admin_start_next_round_manual(owner(), 100).await.unwrap();
        let player = Address::repeat_byte(1);

        store.set_failing(true);
        let err = service.submit_guess(player, 50, FEE).await.unwrap_err();
        assert!(matches!(err, GuessRoundsError::Storage(StorageError::WriteFailed(_))));
        assert!(service.get_guesses(1).await.is_empty());
        assert_eq!(service.current_round().await.unwrap().pot, 0);

        assert!(service.set_entry_fee_wei(owner(), 1).await.is_err());
        assert_eq!(service.entry_fee_wei().await, FEE);

        // the retry is the only entry and the reloaded state agrees with memory
        store.set_failing(false);
        assert_eq!(service.submit_guess(player, 50, FEE).await.unwrap(), 0);
        service.submit_guess(Address::repeat_byte(2), 60, FEE).await.unwrap();

        let reloaded = GameService::open(settings(), store.clone(), Arc::new(DeferredProvider::new()), clock)
            .unwrap();
        let round = reloaded.current_round().await.unwrap();
        assert_eq!(round.pot, 2 * FEE);
        assert_eq!(round.guesses_count, 2);
        assert_eq!(reloaded.get_guesses(1).await.len(), 2);
        assert_eq!(service.current_round().await, Some(round));
    }

    #[tokio::test]
    async fn test_failed_settle_can_be_retried() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(FailingStore::new());
        let service = GameService::open(
            settings(),
            store.clone(),
            Arc::new(DeferredProvider::new()),
            clock.clone(),
        )
        .unwrap();
        service.admin_start_next_round_manual(owner(), 100).await.unwrap();
        service.submit_guess(Address::repeat_byte(1), 90, FEE).await.unwrap();
        service.submit_guess(Address::repeat_byte(2), 95, FEE).await.unwrap();
        clock.advance(3600);

        store.set_failing(true);
        assert!(service.end_and_settle(owner()).await.is_err());
        assert_eq!(service.phase().await, RoundPhase::Closed);
        assert_eq!(service.prior_winners_count().await, 0);
        assert_eq!(service.operator_balance().await, 0);

        store.set_failing(false);
        let outcome = service.end_and_settle(owner()).await.unwrap();
        assert_eq!(outcome.winner, Some(Address::repeat_byte(2)));
        assert_eq!(service.prior_winners_count().await, 1);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_is_forgotten() {
        let (service, _clock, _provider) = service();
        let request = service.request_next_round(owner()).await.unwrap();

        assert!(service
            .wait_for_activation(request.request_id, Duration::from_millis(5))
            .await
            .is_none());
        assert!(!service.activations.is_pending(request.request_id));
    }

    #[tokio::test]
    async fn test_stop_wakes_idle_worker() {
        let (service, _clock, _provider) = service();
        let (tx, rx) = mpsc::channel::<FulfillmentMessage>(1);
        let worker = FulfillmentWorker::spawn(service, rx, None);

        worker.stop();
        // the task drops its receiver on exit even though nothing was sent
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("worker should exit without another message");
        assert!(!worker.is_running());
    }
}
