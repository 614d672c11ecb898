//! Engine counters exported in Prometheus text format

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub rounds_started: IntCounter,
    pub rounds_settled: IntCounter,
    pub randomness_requests: IntCounter,
    pub fulfillments_ignored: IntCounter,
    pub guesses_accepted: IntCounter,
    pub rejections: IntCounterVec,
    pub current_round: IntGauge,
    pub current_pot_gwei: IntGauge,
    pub operator_balance_gwei: IntGauge,
}

/// Gauges are i64; wei amounts are reported in gwei and clamped
fn to_gwei(wei: u128) -> i64 {
    i64::try_from(wei / 1_000_000_000).unwrap_or(i64::MAX)
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("guessrounds".to_string()), None)?;

        let rounds_started = IntCounter::new("rounds_started_total", "Rounds activated")?;
        let rounds_settled = IntCounter::new("rounds_settled_total", "Rounds settled")?;
        let randomness_requests =
            IntCounter::new("randomness_requests_total", "Randomness requests issued")?;
        let fulfillments_ignored = IntCounter::new(
            "fulfillments_ignored_total",
            "Duplicate or superseded fulfillments dropped",
        )?;
        let guesses_accepted = IntCounter::new("guesses_accepted_total", "Guesses recorded")?;
        let rejections = IntCounterVec::new(
            Opts::new("rejections_total", "Rejected operations by reason"),
            &["reason"],
        )?;
        let current_round = IntGauge::new("current_round_id", "Id of the current round")?;
        let current_pot_gwei = IntGauge::new("current_pot_gwei", "Pot of the current round")?;
        let operator_balance_gwei =
            IntGauge::new("operator_balance_gwei", "Withdrawable operator balance")?;

        registry.register(Box::new(rounds_started.clone()))?;
        registry.register(Box::new(rounds_settled.clone()))?;
        registry.register(Box::new(randomness_requests.clone()))?;
        registry.register(Box::new(fulfillments_ignored.clone()))?;
        registry.register(Box::new(guesses_accepted.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(current_round.clone()))?;
        registry.register(Box::new(current_pot_gwei.clone()))?;
        registry.register(Box::new(operator_balance_gwei.clone()))?;

        Ok(Self {
            registry,
            rounds_started,
            rounds_settled,
            randomness_requests,
            fulfillments_ignored,
            guesses_accepted,
            rejections,
            current_round,
            current_pot_gwei,
            operator_balance_gwei,
        })
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections.with_label_values(&[reason]).inc();
    }

    pub fn set_round(&self, round_id: u64, pot_wei: u128) {
        self.current_round.set(i64::try_from(round_id).unwrap_or(i64::MAX));
        self.current_pot_gwei.set(to_gwei(pot_wei));
    }

    pub fn set_operator_balance(&self, wei: u128) {
        self.operator_balance_gwei.set(to_gwei(wei));
    }

    /// Render every registered metric in the text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.rounds_started.inc();
        metrics.guesses_accepted.inc_by(3);
        metrics.record_rejection("paused");
        metrics.set_round(4, 30_000_000_000_000);

        let text = metrics.render();
        assert!(text.contains("guessrounds_rounds_started_total 1"));
        assert!(text.contains("guessrounds_guesses_accepted_total 3"));
        assert!(text.contains("reason=\"paused\""));
        assert!(text.contains("guessrounds_current_round_id 4"));
        assert!(text.contains("guessrounds_current_pot_gwei 30000"));
    }

    #[test]
    fn test_gwei_clamps() {
        assert_eq!(to_gwei(u128::MAX), i64::MAX);
        assert_eq!(to_gwei(999_999_999), 0);
    }
}
