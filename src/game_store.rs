//! Persistent round records stored as JSON under prefixed keys.
//!
//! Key layout:
//! - `config:settings`           settings block + operator balance
//! - `meta:current_round`        current round id (be u64)
//! - `oracle:state`              last request id + pending handle
//! - `request:` | id(be)         one randomness request and its status
//! - `round:` | id(be)           one round
//! - `guess:` | round(be) | idx(be)   one guess, so a prefix scan yields arrival order
//! - `winner:` | idx(be)         one winner record

use crate::{
    errors::{GuessRoundsError, GuessRoundsResult, StorageError},
    games::{
        oracle::RequestEntry,
        AdminControl, GameSettings, Guess, GuessLedger, RandomnessOracleAdapter, Round, RoundManager,
        WinnerHistory, WinnerRecord,
    },
    storage::{BatchOp, KvStore},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

const SETTINGS_KEY: &[u8] = b"config:settings";
const CURRENT_ROUND_KEY: &[u8] = b"meta:current_round";
const ORACLE_KEY: &[u8] = b"oracle:state";
const REQUEST_PREFIX: &[u8] = b"request:";
const ROUND_PREFIX: &[u8] = b"round:";
const GUESS_PREFIX: &[u8] = b"guess:";
const WINNER_PREFIX: &[u8] = b"winner:";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredSettings {
    settings: GameSettings,
    operator_balance: u128,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoredOracle {
    last_request_id: u64,
    pending: Option<u64>,
}

fn request_key(request_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(REQUEST_PREFIX.len() + 8);
    key.extend_from_slice(REQUEST_PREFIX);
    key.extend_from_slice(&request_id.to_be_bytes());
    key
}

fn round_key(round_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROUND_PREFIX.len() + 8);
    key.extend_from_slice(ROUND_PREFIX);
    key.extend_from_slice(&round_id.to_be_bytes());
    key
}

fn guess_key(round_id: u64, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(GUESS_PREFIX.len() + 16);
    key.extend_from_slice(GUESS_PREFIX);
    key.extend_from_slice(&round_id.to_be_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn winner_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(WINNER_PREFIX.len() + 8);
    key.extend_from_slice(WINNER_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn read_be_u64(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn encode<T: Serialize>(what: &str, value: &T) -> GuessRoundsResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        GuessRoundsError::Storage(StorageError::WriteFailed(format!(
            "Failed to encode {}: {}",
            what, e
        )))
    })
}

fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> GuessRoundsResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        GuessRoundsError::Storage(StorageError::CorruptedData(format!(
            "Failed to decode {}: {}",
            what, e
        )))
    })
}

/// Writes produced by one engine operation, committed as a single batch
#[derive(Debug, Default)]
pub struct ChangeSet {
    ops: Vec<BatchOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn admin(mut self, admin: &AdminControl) -> GuessRoundsResult<Self> {
        let stored = StoredSettings {
            settings: admin.settings().clone(),
            operator_balance: admin.operator_balance(),
        };
        self.ops
            .push(BatchOp::Put(SETTINGS_KEY.to_vec(), encode("settings", &stored)?));
        Ok(self)
    }

    /// Request counters plus the one entry the operation touched, if any
    pub fn oracle(mut self, oracle: &RandomnessOracleAdapter, touched: Option<u64>) -> GuessRoundsResult<Self> {
        let stored = StoredOracle {
            last_request_id: oracle.last_request_id(),
            pending: oracle.pending_id(),
        };
        self.ops
            .push(BatchOp::Put(ORACLE_KEY.to_vec(), encode("oracle state", &stored)?));
        if let Some(entry) = touched.and_then(|id| oracle.request(id)) {
            self = self.request(entry)?;
        }
        Ok(self)
    }

    pub fn request(mut self, entry: &RequestEntry) -> GuessRoundsResult<Self> {
        let request_id = entry.request.request_id;
        let bytes = encode(&format!("request {}", request_id), entry)?;
        self.ops.push(BatchOp::Put(request_key(request_id), bytes));
        Ok(self)
    }

    pub fn round(mut self, round: &Round) -> GuessRoundsResult<Self> {
        let bytes = encode(&format!("round {}", round.id), round)?;
        self.ops.push(BatchOp::Put(round_key(round.id), bytes));
        Ok(self)
    }

    pub fn current_round(mut self, round_id: u64) -> Self {
        self.ops.push(BatchOp::Put(
            CURRENT_ROUND_KEY.to_vec(),
            round_id.to_be_bytes().to_vec(),
        ));
        self
    }

    pub fn guess(mut self, round_id: u64, index: usize, guess: &Guess) -> GuessRoundsResult<Self> {
        let bytes = encode(&format!("guess {}/{}", round_id, index), guess)?;
        self.ops
            .push(BatchOp::Put(guess_key(round_id, index as u64), bytes));
        Ok(self)
    }

    pub fn winner(mut self, index: usize, record: &WinnerRecord) -> GuessRoundsResult<Self> {
        let bytes = encode(&format!("winner record {}", index), record)?;
        self.ops.push(BatchOp::Put(winner_key(index as u64), bytes));
        Ok(self)
    }

    pub fn commit(self, store: &dyn KvStore) -> GuessRoundsResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let count = self.ops.len();
        store.batch_write(self.ops)?;
        tracing::trace!(ops = count, "Committed change set");
        Ok(())
    }
}

/// Full snapshot of a manager; used on first initialisation
pub fn snapshot(manager: &RoundManager) -> GuessRoundsResult<ChangeSet> {
    let mut changes = ChangeSet::new()
        .admin(manager.admin())?
        .oracle(manager.oracle(), None)?
        .current_round(manager.current_round_id());

    for entry in manager.oracle().entries() {
        changes = changes.request(entry)?;
    }
    for round in manager.rounds() {
        changes = changes.round(round)?;
        for (index, guess) in manager.get_guesses(round.id).iter().enumerate() {
            changes = changes.guess(round.id, index, guess)?;
        }
    }
    for (index, record) in manager.history().iter().enumerate() {
        changes = changes.winner(index, record)?;
    }
    Ok(changes)
}

pub fn is_initialized(store: &dyn KvStore) -> GuessRoundsResult<bool> {
    Ok(store.get(SETTINGS_KEY)?.is_some())
}

/// Rebuild the engine from storage; `None` when nothing was ever stored
pub fn load_manager(store: &dyn KvStore) -> GuessRoundsResult<Option<RoundManager>> {
    let Some(bytes) = store.get(SETTINGS_KEY)? else {
        return Ok(None);
    };
    let stored: StoredSettings = decode("settings", &bytes)?;
    let admin = AdminControl::restore(stored.settings, stored.operator_balance);

    let stored_oracle: StoredOracle = match store.get(ORACLE_KEY)? {
        Some(bytes) => decode("oracle state", &bytes)?,
        None => StoredOracle::default(),
    };
    let mut requests = Vec::new();
    for (_key, value) in store.scan_prefix(REQUEST_PREFIX)? {
        requests.push(decode::<RequestEntry>("request", &value)?);
    }
    let oracle = RandomnessOracleAdapter::restore(stored_oracle.last_request_id, stored_oracle.pending, requests);

    let current_round_id = match store.get(CURRENT_ROUND_KEY)? {
        Some(bytes) => read_be_u64(&bytes).ok_or_else(|| {
            StorageError::CorruptedData("current round pointer is not 8 bytes".to_string())
        })?,
        None => 0,
    };

    let mut rounds = BTreeMap::new();
    for (_key, value) in store.scan_prefix(ROUND_PREFIX)? {
        let round: Round = decode("round", &value)?;
        rounds.insert(round.id, round);
    }

    let mut guesses: BTreeMap<u64, Vec<Guess>> = BTreeMap::new();
    for (key, value) in store.scan_prefix(GUESS_PREFIX)? {
        let suffix = &key[GUESS_PREFIX.len()..];
        if suffix.len() != 16 {
            tracing::warn!(key = %hex::encode(&key), "Skipping malformed guess key");
            continue;
        }
        let round_id = read_be_u64(&suffix[..8]).unwrap_or_default();
        let guess: Guess = decode("guess", &value)?;
        guesses.entry(round_id).or_default().push(guess);
    }

    let mut ledger = GuessLedger::new();
    for round in rounds.values() {
        let entries = guesses.remove(&round.id).unwrap_or_default();
        ledger.restore(round.id, entries, round.active && !round.settled);
    }
    if !guesses.is_empty() {
        tracing::warn!(orphaned_rounds = guesses.len(), "Guesses stored for unknown rounds");
    }

    let mut records: Vec<WinnerRecord> = Vec::new();
    for (_key, value) in store.scan_prefix(WINNER_PREFIX)? {
        records.push(decode("winner record", &value)?);
    }

    tracing::info!(
        current_round_id,
        rounds = rounds.len(),
        winners = records.len(),
        "Loaded round state from storage"
    );

    Ok(Some(RoundManager::from_parts(
        admin,
        oracle,
        ledger,
        rounds,
        current_round_id,
        WinnerHistory::restore(records),
    )))
}

/// Remove every record this module writes
pub fn wipe(store: &dyn KvStore) -> GuessRoundsResult<()> {
    let mut ops = vec![
        BatchOp::Delete(SETTINGS_KEY.to_vec()),
        BatchOp::Delete(CURRENT_ROUND_KEY.to_vec()),
        BatchOp::Delete(ORACLE_KEY.to_vec()),
    ];
    for prefix in [REQUEST_PREFIX, ROUND_PREFIX, GUESS_PREFIX, WINNER_PREFIX] {
        for (key, _) in store.scan_prefix(prefix)? {
            ops.push(BatchOp::Delete(key));
        }
    }
    store.batch_write(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::{Address, RandomSeed, VrfParams};
    use crate::storage::MemoryStorage;

    const FEE: u128 = 1_000;
    const T0: u64 = 1_700_000_000;

    fn owner() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn manager() -> RoundManager {
        RoundManager::new(GameSettings {
            owner: owner(),
            entry_fee_wei: FEE,
            round_duration: 60,
            paused: false,
            vrf: VrfParams::default(),
            open_round_requests: false,
        })
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let store = MemoryStorage::new();
        assert!(load_manager(&store).unwrap().is_none());
        assert!(!is_initialized(&store).unwrap());
    }

    #[test]
    fn test_snapshot_and_reload() {
        let store = MemoryStorage::new();
        let mut m = manager();

        let request = m.request_next_round(&owner(), T0).unwrap();
        m.on_fulfilled(request.request_id, &RandomSeed::from(41u64), T0)
            .unwrap();
        m.submit_guess(&Address::repeat_byte(1), 40, FEE, T0 + 1).unwrap();
        m.submit_guess(&Address::repeat_byte(2), 50, FEE, T0 + 2).unwrap();
        m.end_and_settle(&owner(), T0 + 60).unwrap();

        let request = m.request_next_round(&owner(), T0 + 61).unwrap();
        m.on_fulfilled(request.request_id, &RandomSeed::from(7u64), T0 + 61)
            .unwrap();
        m.submit_guess(&Address::repeat_byte(3), 9, FEE, T0 + 62).unwrap();

        snapshot(&m).unwrap().commit(&store).unwrap();
        let loaded = load_manager(&store).unwrap().expect("state was stored");

        assert_eq!(loaded.current_round_id(), 2);
        assert_eq!(loaded.round(1, T0 + 62), m.round(1, T0 + 62));
        assert_eq!(loaded.current_round(T0 + 62), m.current_round(T0 + 62));
        assert_eq!(loaded.get_guesses(1), m.get_guesses(1));
        assert_eq!(loaded.get_guesses(2).len(), 1);
        assert_eq!(loaded.prior_winners_count(), 1);
        assert_eq!(loaded.get_winner_at(0), m.get_winner_at(0));
        assert_eq!(loaded.operator_balance(), m.operator_balance());
        assert_eq!(loaded.oracle(), m.oracle());

        // the reloaded round still takes entries
        let mut loaded = loaded;
        assert_eq!(
            loaded
                .submit_guess(&Address::repeat_byte(4), 10, FEE, T0 + 63)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_request_writes_touch_one_entry() {
        let store = MemoryStorage::new();
        let mut m = manager();
        snapshot(&m).unwrap().commit(&store).unwrap();

        let mut now = T0;
        for seed in 1..=5u64 {
            let request = m.request_next_round(&owner(), now).unwrap();
            m.on_fulfilled(request.request_id, &RandomSeed::from(seed), now)
                .unwrap();
            let changes = ChangeSet::new()
                .oracle(m.oracle(), Some(request.request_id))
                .unwrap();
            // counters plus the touched request, however many came before
            assert_eq!(changes.len(), 2);
            changes.commit(&store).unwrap();

            now += 60;
            m.end_and_settle(&owner(), now).unwrap();
        }
        ChangeSet::new()
            .current_round(m.current_round_id())
            .commit(&store)
            .unwrap();

        let loaded = load_manager(&store).unwrap().expect("state was stored");
        assert_eq!(loaded.oracle(), m.oracle());
        assert_eq!(loaded.oracle().request_count(), 5);
        assert_eq!(loaded.oracle().last_request_id(), 5);
    }

    #[test]
    fn test_guess_keys_sort_by_index() {
        assert!(guess_key(1, 255) < guess_key(1, 256));
        assert!(guess_key(1, u64::MAX) < guess_key(2, 0));
        assert!(round_key(9) < round_key(10));
    }

    #[test]
    fn test_corrupted_settings_reported() {
        let store = MemoryStorage::new();
        store.put(SETTINGS_KEY, b"not json").unwrap();
        let err = load_manager(&store).err().expect("should fail");
        assert!(matches!(
            err,
            GuessRoundsError::Storage(StorageError::CorruptedData(_))
        ));
    }

    #[test]
    fn test_wipe_clears_records() {
        let store = MemoryStorage::new();
        let mut m = manager();
        m.admin_start_next_round_manual(&owner(), 5, T0).unwrap();
        m.submit_guess(&Address::repeat_byte(1), 5, FEE, T0).unwrap();
        snapshot(&m).unwrap().commit(&store).unwrap();
        assert!(!store.is_empty());

        wipe(&store).unwrap();
        assert!(store.is_empty());
    }
}
