//! Wiring of storage, randomness provider and service from configuration
//!
//! Keeps the assembly in one place so the CLI and tests build engines the same way.

use crate::{
    clock::Clock,
    config::{GuessRoundsConfig, OracleProvider, StorageBackend},
    errors::{ConfigurationError, GuessRoundsResult},
    games::{DeferredProvider, LocalVrfProvider, RandomnessProvider},
    service::{FulfillmentWorker, GameService},
    storage::{KvStore, MemoryStorage, RocksStorage},
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A running engine and the pieces the host may need to reach
pub struct EngineHandle {
    pub service: GameService,
    /// Present when the local VRF provider answers requests
    pub worker: Option<Arc<FulfillmentWorker>>,
    pub vrf_public_key: Option<String>,
    /// Present in deferred mode; seeds then arrive through `fulfill`
    pub deferred: Option<Arc<DeferredProvider>>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        if let Some(worker) = &self.worker {
            worker.stop();
        }
    }
}

pub struct EngineFactory;

impl EngineFactory {
    /// Build storage, provider and service. Must run inside a tokio runtime
    /// when the local VRF provider is selected.
    pub async fn create(config: &GuessRoundsConfig, clock: Arc<dyn Clock>) -> GuessRoundsResult<EngineHandle> {
        config
            .validate()
            .map_err(|e| ConfigurationError::ValidationFailed(e.to_string()))?;

        let store = Self::create_storage(config)?;
        let settings = config
            .game_settings()
            .map_err(|e| ConfigurationError::ValidationFailed(e.to_string()))?;

        match config.oracle.provider {
            OracleProvider::Deferred => {
                let provider = Arc::new(DeferredProvider::new());
                let service = GameService::open(settings, store, provider.clone(), clock)?
                    .with_event_capacity(config.monitoring.event_channel_capacity);
                tracing::info!("Engine ready with deferred randomness provider");
                Ok(EngineHandle {
                    service,
                    worker: None,
                    vrf_public_key: None,
                    deferred: Some(provider),
                })
            }
            OracleProvider::LocalVrf => {
                let (tx, rx) = mpsc::channel(config.oracle.fulfillment_channel_capacity);
                let provider = match &config.oracle.vrf_secret_hex {
                    Some(secret) => LocalVrfProvider::from_secret_hex(secret, tx, config.fulfillment_delay())?,
                    None => LocalVrfProvider::new_random(tx, config.fulfillment_delay()),
                };
                let public_key = provider.public_key_hex();
                let provider: Arc<dyn RandomnessProvider> = Arc::new(provider);

                let service = GameService::open(settings, store, provider, clock)?
                    .with_event_capacity(config.monitoring.event_channel_capacity);
                let worker = FulfillmentWorker::spawn(service.clone(), rx, Some(public_key.clone()));
                tracing::info!(public_key = %public_key, "Engine ready with local VRF provider");
                Ok(EngineHandle {
                    service,
                    worker: Some(worker),
                    vrf_public_key: Some(public_key),
                    deferred: None,
                })
            }
        }
    }

    pub fn create_storage(config: &GuessRoundsConfig) -> GuessRoundsResult<Arc<dyn KvStore>> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
            StorageBackend::Rocksdb => {
                let path = &config.storage.data_directory;
                if config.storage.clear_on_start {
                    tracing::warn!(path = %path, "Clearing storage directory on start");
                    match std::fs::remove_dir_all(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                std::fs::create_dir_all(path)?;
                Ok(Arc::new(RocksStorage::with_config(path, &config.storage)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::games::{Address, RoundPhase};
    use std::time::Duration;

    fn config(provider: OracleProvider) -> GuessRoundsConfig {
        let mut config = GuessRoundsConfig::testing();
        config.game.owner = Address::repeat_byte(0xaa).to_string();
        config.oracle.provider = provider;
        config
    }

    #[tokio::test]
    async fn test_deferred_engine() {
        let handle = EngineFactory::create(&config(OracleProvider::Deferred), Arc::new(ManualClock::new(1_000)))
            .await
            .unwrap();
        assert!(handle.worker.is_none());

        handle
            .service
            .request_next_round(Address::repeat_byte(0xaa))
            .await
            .unwrap();
        assert_eq!(handle.deferred.as_ref().map(|p| p.requests().len()), Some(1));
        assert_eq!(handle.service.phase().await, RoundPhase::AwaitingRandomness);
    }

    #[tokio::test]
    async fn test_local_vrf_engine_activates() {
        let mut cfg = config(OracleProvider::LocalVrf);
        cfg.oracle.vrf_secret_hex = Some("22".repeat(32));
        let handle = EngineFactory::create(&cfg, Arc::new(ManualClock::new(1_000)))
            .await
            .unwrap();

        let request = handle
            .service
            .request_next_round(Address::repeat_byte(0xaa))
            .await
            .unwrap();
        let round = handle
            .service
            .wait_for_activation(request.request_id, Duration::from_secs(5))
            .await
            .expect("round should activate");
        assert_eq!(round.id, 1);
        assert_eq!(round.start_time, 1_000);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = config(OracleProvider::Deferred);
        cfg.game.round_duration_seconds = 0;
        assert!(EngineFactory::create(&cfg, Arc::new(ManualClock::new(0))).await.is_err());
    }
}
