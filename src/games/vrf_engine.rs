use crate::games::oracle::{OracleError, RandomnessRequest};
use crate::games::types::RandomSeed;
use async_trait::async_trait;
use schnorrkel::context::SigningContext;
use schnorrkel::{ExpansionMode, Keypair, MiniSecretKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const VRF_SIGNING_CONTEXT: &[u8] = b"guessrounds";

/// Seed delivered by a provider for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentMessage {
    pub request_id: u64,
    pub seed: RandomSeed,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<SeedProof>,
}

/// Everything needed to check a seed against the provider key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedProof {
    /// Hex-encoded schnorrkel signature (64 bytes)
    pub vrf_proof: String,
    /// Hex-encoded public key (32 bytes)
    pub public_key: String,
    pub input_message: String,
}

/// External source of per-round randomness.
///
/// `request` must return without waiting for the answer; the seed comes back
/// later on the fulfillment channel.
#[async_trait]
pub trait RandomnessProvider: Send + Sync {
    async fn request(&self, request: RandomnessRequest) -> Result<(), OracleError>;
}

/// Provider that only records requests; seeds are delivered out of band
/// (operator command, test harness).
#[derive(Default)]
pub struct DeferredProvider {
    requests: Mutex<Vec<RandomnessRequest>>,
}

impl DeferredProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<RandomnessRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RandomnessProvider for DeferredProvider {
    async fn request(&self, request: RandomnessRequest) -> Result<(), OracleError> {
        self.requests
            .lock()
            .map_err(|e| OracleError::ProviderUnavailable(e.to_string()))?
            .push(request);
        Ok(())
    }
}

/// In-process VRF oracle: signs each request with schnorrkel and answers
/// asynchronously after a configurable delay.
pub struct LocalVrfProvider {
    keypair: Arc<Keypair>,
    fulfillments: mpsc::Sender<FulfillmentMessage>,
    delay: Duration,
}

impl LocalVrfProvider {
    pub fn new(keypair: Keypair, fulfillments: mpsc::Sender<FulfillmentMessage>, delay: Duration) -> Self {
        Self {
            keypair: Arc::new(keypair),
            fulfillments,
            delay,
        }
    }

    /// Provider with a random keypair
    pub fn new_random(fulfillments: mpsc::Sender<FulfillmentMessage>, delay: Duration) -> Self {
        use rand_core::OsRng;
        let keypair = Keypair::generate_with(OsRng);
        Self::new(keypair, fulfillments, delay)
    }

    /// Provider whose key is derived from a 32-byte hex secret
    pub fn from_secret_hex(
        secret_hex: &str,
        fulfillments: mpsc::Sender<FulfillmentMessage>,
        delay: Duration,
    ) -> Result<Self, OracleError> {
        let bytes = hex::decode(secret_hex.trim_start_matches("0x"))
            .map_err(|e| OracleError::ProviderUnavailable(format!("Invalid VRF secret hex: {}", e)))?;
        let mini = MiniSecretKey::from_bytes(&bytes)
            .map_err(|e| OracleError::ProviderUnavailable(format!("Invalid VRF secret: {:?}", e)))?;
        Ok(Self::new(
            mini.expand_to_keypair(ExpansionMode::Ed25519),
            fulfillments,
            delay,
        ))
    }

    /// Input signed for a request; binds the seed to request and round
    pub fn input_message(request: &RandomnessRequest) -> String {
        format!(
            "guessrounds:{}:{}:{}",
            request.request_id, request.round_id, request.rng_commit
        )
    }

    /// Produce the seed and proof for a request
    pub fn generate(&self, request: &RandomnessRequest) -> (RandomSeed, SeedProof) {
        let input_message = Self::input_message(request);
        let (output, signature) = self.vrf_sign(input_message.as_bytes());

        let proof = SeedProof {
            vrf_proof: hex::encode(signature),
            public_key: self.public_key_hex(),
            input_message,
        };
        (RandomSeed(output), proof)
    }

    /// VRF output is sha256 of the signature; the signature is the proof
    fn vrf_sign(&self, message: &[u8]) -> ([u8; 32], [u8; 64]) {
        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let signature = self.keypair.sign(ctx.bytes(message)).to_bytes();

        let mut hasher = Sha256::new();
        hasher.update(signature);
        (hasher.finalize().into(), signature)
    }

    /// Check that `seed` is what the key behind `proof` produced for `expected_input`
    pub fn verify_seed_proof(
        seed: &RandomSeed,
        proof: &SeedProof,
        expected_input: &str,
    ) -> Result<bool, OracleError> {
        if proof.input_message != expected_input {
            return Ok(false);
        }

        let signature_bytes = hex::decode(&proof.vrf_proof)
            .map_err(|e| OracleError::InvalidProof(format!("Invalid VRF proof hex: {}", e)))?;
        let public_key_bytes = hex::decode(&proof.public_key)
            .map_err(|e| OracleError::InvalidProof(format!("Invalid public key hex: {}", e)))?;

        let public_key = PublicKey::from_bytes(&public_key_bytes)
            .map_err(|e| OracleError::InvalidProof(format!("Invalid public key: {:?}", e)))?;
        let signature = Signature::from_bytes(&signature_bytes)
            .map_err(|e| OracleError::InvalidProof(format!("Invalid signature: {:?}", e)))?;

        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        if public_key
            .verify(ctx.bytes(expected_input.as_bytes()), &signature)
            .is_err()
        {
            return Ok(false);
        }

        let mut hasher = Sha256::new();
        hasher.update(&signature_bytes);
        let computed: [u8; 32] = hasher.finalize().into();
        Ok(computed == seed.0)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }
}

#[async_trait]
impl RandomnessProvider for LocalVrfProvider {
    async fn request(&self, request: RandomnessRequest) -> Result<(), OracleError> {
        if self.fulfillments.is_closed() {
            return Err(OracleError::ChannelClosed);
        }

        let (seed, proof) = self.generate(&request);
        let sender = self.fulfillments.clone();
        let delay = self.delay;
        let request_id = request.request_id;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let message = FulfillmentMessage {
                request_id,
                seed,
                proof: Some(proof),
            };
            if sender.send(message).await.is_err() {
                tracing::warn!(request_id, "Fulfillment channel closed before delivery");
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::oracle::{request_commitment, VrfParams};

    fn request(request_id: u64, round_id: u64) -> RandomnessRequest {
        RandomnessRequest {
            request_id,
            round_id,
            rng_commit: request_commitment(request_id, round_id),
            params: VrfParams::default(),
            requested_at: 0,
        }
    }

    #[test]
    fn test_seed_generation_and_verification() {
        let (tx, _rx) = mpsc::channel(4);
        let provider = LocalVrfProvider::new_random(tx, Duration::ZERO);
        let req = request(1, 1);

        let (seed, proof) = provider.generate(&req);
        let expected = LocalVrfProvider::input_message(&req);
        assert!(LocalVrfProvider::verify_seed_proof(&seed, &proof, &expected).unwrap());
    }

    #[test]
    fn test_tampered_seed_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let provider = LocalVrfProvider::new_random(tx, Duration::ZERO);
        let req = request(3, 2);

        let (_seed, proof) = provider.generate(&req);
        let expected = LocalVrfProvider::input_message(&req);
        let forged = RandomSeed([0xff; 32]);
        assert!(!LocalVrfProvider::verify_seed_proof(&forged, &proof, &expected).unwrap());

        let (seed, proof) = provider.generate(&req);
        let other_input = LocalVrfProvider::input_message(&request(4, 2));
        assert!(!LocalVrfProvider::verify_seed_proof(&seed, &proof, &other_input).unwrap());
    }

    #[test]
    fn test_deterministic_key_from_secret() {
        let (tx, _rx) = mpsc::channel(4);
        let secret = "11".repeat(32);
        let a = LocalVrfProvider::from_secret_hex(&secret, tx.clone(), Duration::ZERO).unwrap();
        let b = LocalVrfProvider::from_secret_hex(&secret, tx, Duration::ZERO).unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[tokio::test]
    async fn test_fulfillment_delivered_on_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let provider = LocalVrfProvider::new_random(tx, Duration::from_millis(5));
        let req = request(7, 1);

        provider.request(req.clone()).await.unwrap();
        let message = rx.recv().await.expect("fulfillment should arrive");
        assert_eq!(message.request_id, 7);

        let proof = message.proof.expect("local provider attaches a proof");
        assert!(LocalVrfProvider::verify_seed_proof(
            &message.seed,
            &proof,
            &LocalVrfProvider::input_message(&req)
        )
        .unwrap());
    }

    #[tokio::test]
    async fn test_deferred_provider_records_requests() {
        let provider = DeferredProvider::new();
        provider.request(request(1, 1)).await.unwrap();
        assert_eq!(provider.requests().len(), 1);
    }
}
