//! GuessRounds - pari-mutuel number guessing rounds
//!
//! Each round draws a hidden target in 1..=1000 from a verifiable randomness
//! provider, collects fixed-fee guesses until its end time, and pays the pot
//! (less the operator share) to the closest guess.
//!
//! The pure state machine lives in [`games`]; [`service::GameService`] hosts
//! it with persistence, events and the oracle callback worker.

pub mod clock;
pub mod config;
pub mod errors;
pub mod factory;
pub mod game_store;
pub mod games;
pub mod metrics;
pub mod service;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuessRoundsConfig;
pub use errors::{GameError, GuessRoundsError, GuessRoundsResult};
pub use factory::{EngineFactory, EngineHandle};
pub use games::{Address, RandomSeed, Round, RoundManager, RoundPhase};
pub use service::{EngineStatus, FulfillmentWorker, GameService, RoundEvent};
pub use storage::{KvStore, MemoryStorage, RocksStorage};
