use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::engine::MetricsEngine;

const CIRCUIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

impl MetricsEngine {
    /// Start the circuit-recovery (1 min) and stale-key (1 h) sweeps.
    /// They stop when the returned sender is dropped or signalled.
    pub fn spawn_sweeps(self: &Arc<Self>) -> watch::Sender<bool> {
        let (stop, _) = watch::channel(false);

        let engine = self.clone();
        let mut stop_rx = stop.subscribe();
        tokio::spawn(async move {
            let mut circuit = tokio::time::interval(CIRCUIT_SWEEP_INTERVAL);
            circuit.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut stale = tokio::time::interval(STALE_SWEEP_INTERVAL);
            stale.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first ticks; there is nothing to sweep
            // at startup.
            circuit.tick().await;
            stale.tick().await;

            loop {
                tokio::select! {
                    _ = circuit.tick() => engine.recover_expired_circuits(),
                    _ = stale.tick() => engine.cleanup_stale_keys(),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayx_common::ApiType;

    #[tokio::test]
    async fn zero_recovery_closes_circuits_on_sweep() {
        let engine =
            MetricsEngine::with_recovery(ApiType::Messages, 10, 0.5, time::Duration::ZERO);
        let url = "https://u1";
        let key = "sk-test-0123456789";
        for _ in 0..5 {
            let id = engine.reserve_attempt(url, key, "m");
            engine.finalize_failure(url, key, id);
        }
        assert!(engine.key_snapshot(url, key).unwrap().circuit_broken_at.is_some());

        engine.recover_expired_circuits();
        let snap = engine.key_snapshot(url, key).unwrap();
        assert!(snap.circuit_broken_at.is_none());
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.window_len, 0);
    }
}
