pub mod types;
pub mod oracle;
pub mod vrf_engine;
pub mod ledger;
pub mod settlement;
pub mod admin;
pub mod manager;
pub mod pending_pool;

pub use types::*;
pub use admin::{AdminControl, GameSettings};
pub use ledger::GuessLedger;
pub use manager::RoundManager;
pub use oracle::{RandomnessOracleAdapter, VrfParams};
pub use pending_pool::PendingActivations;
pub use settlement::{SettlementEngine, SettlementOutcome, WinnerHistory};
pub use vrf_engine::{DeferredProvider, FulfillmentMessage, LocalVrfProvider, RandomnessProvider};
