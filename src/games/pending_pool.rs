use crate::games::types::Round;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Callers waiting for a randomness request to turn into an active round
#[derive(Clone)]
pub struct PendingActivations {
    /// Map of request_id -> waiting senders
    pending: Arc<DashMap<u64, Vec<oneshot::Sender<Round>>>>,
}

impl PendingActivations {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Register interest in the round activated by `request_id`
    pub fn subscribe(&self, request_id: u64) -> oneshot::Receiver<Round> {
        let (tx, rx) = oneshot::channel();
        self.pending.entry(request_id).or_default().push(tx);
        rx
    }

    /// Hand the activated round to every waiter; returns how many were woken
    pub fn complete(&self, request_id: u64, round: &Round) -> usize {
        let Some((_, senders)) = self.pending.remove(&request_id) else {
            return 0;
        };
        // receivers may have given up; those sends just fail
        senders
            .into_iter()
            .map(|sender| sender.send(round.clone()).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }

    /// Drop waiters for a request that will never activate (e.g. superseded)
    pub fn cancel(&self, request_id: u64) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Forget waiters whose receivers were dropped (e.g. timed out); returns
    /// how many were removed
    pub fn prune(&self, request_id: u64) -> usize {
        let mut removed = 0;
        if let Some(mut senders) = self.pending.get_mut(&request_id) {
            let before = senders.len();
            senders.retain(|sender| !sender.is_closed());
            removed = before - senders.len();
        }
        self.pending.remove_if(&request_id, |_, senders| senders.is_empty());
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }
}

impl Default for PendingActivations {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(id: u64) -> Round {
        Round {
            id,
            start_time: 0,
            end_time: 60,
            active: true,
            settled: false,
            target: 42,
            pot: 0,
            guesses_count: 0,
            winner: None,
            rng_commit: String::new(),
            request_id: Some(1),
            manual: false,
            operator_cut: 0,
        }
    }

    #[tokio::test]
    async fn test_waiters_receive_round() {
        let pool = PendingActivations::new();
        let first = pool.subscribe(1);
        let second = pool.subscribe(1);
        assert_eq!(pool.pending_count(), 1);
        assert!(pool.is_pending(1));

        assert_eq!(pool.complete(1, &round(1)), 2);
        assert_eq!(first.await.unwrap().id, 1);
        assert_eq!(second.await.unwrap().target, 42);
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_prune_keeps_live_waiters() {
        let pool = PendingActivations::new();
        let gone = pool.subscribe(3);
        let live = pool.subscribe(3);
        drop(gone);

        assert_eq!(pool.prune(3), 1);
        assert!(pool.is_pending(3));

        drop(live);
        assert_eq!(pool.prune(3), 1);
        assert!(!pool.is_pending(3));
        assert_eq!(pool.prune(3), 0);
    }

    #[test]
    fn test_cancel_drops_waiters() {
        let pool = PendingActivations::new();
        let _rx = pool.subscribe(5);

        assert!(pool.cancel(5));
        assert!(!pool.is_pending(5));
        assert_eq!(pool.complete(5, &round(1)), 0);
    }
}
