//! Liveness Supervisor - Background expiry of silent peers
//!
//! Two-stage timeout per peer:
//! - idle longer than `expire_timeout`: flagged
//! - flagged and idle longer than `expire_timeout + cleanup_grace`: removed
//!
//! Any inbound activity clears the flag. Sweeps only touch the registry;
//! closing the expired peer's transport happens asynchronously in its
//! connection task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use peerlink_core::LivenessConfig;

use crate::registry::Registry;

/// Peers affected by one sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    pub flagged: Vec<String>,
    pub expired: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.flagged.is_empty() && self.expired.is_empty()
    }
}

/// Periodically expires peers whose transports went silent
pub struct LivenessSupervisor {
    registry: Arc<Registry>,
    expire_timeout: Duration,
    cleanup_grace: Duration,
    sweep_interval: Duration,
}

impl LivenessSupervisor {
    pub fn new(registry: Arc<Registry>, config: &LivenessConfig) -> Self {
        Self {
            registry,
            expire_timeout: config.expire_timeout(),
            cleanup_grace: config.cleanup_grace(),
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Run one sweep now
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Run one sweep as of `now`
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let idle_limit = self.expire_timeout + self.cleanup_grace;
        let scan = self
            .registry
            .scan_idle(now, self.expire_timeout, self.cleanup_grace);

        for id in &scan.flagged {
            debug!("Peer {} idle for over {:?}, flagged", id, self.expire_timeout);
        }

        let expired = scan
            .due
            .into_iter()
            .filter_map(|id| self.registry.expire(&id, now, idle_limit))
            .map(|peer| {
                info!("Peer {} expired (no activity for {:?})", peer.id, idle_limit);
                peer.id
            })
            .collect();

        SweepReport {
            flagged: scan.flagged,
            expired,
        }
    }

    /// Sweep every `sweep_interval` until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.sweep_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Liveness supervisor started (expire {:?}, grace {:?}, every {:?})",
            self.expire_timeout, self.cleanup_grace, self.sweep_interval
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.sweep();
                    if !report.expired.is_empty() {
                        debug!(
                            "Sweep expired {} peers, {} remain",
                            report.expired.len(),
                            self.registry.len()
                        );
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        info!("Liveness supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::peer::DisconnectReason;
    use crate::testing::{registry_with, MockTransport, RecordingObserver};

    fn config() -> LivenessConfig {
        LivenessConfig {
            expire_timeout_ms: 60_000,
            cleanup_grace_ms: 3_000,
            sweep_interval_ms: 5_000,
        }
    }

    fn open_peer(registry: &Registry, id: &str) -> Arc<MockTransport> {
        let transport = MockTransport::shared();
        registry
            .register(Some(id.into()), transport.clone(), HashMap::new())
            .unwrap();
        registry.activate(id).unwrap();
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_stage_expiry() {
        let registry = Arc::new(registry_with(10));
        let transport = open_peer(&registry, "alice");
        let supervisor = LivenessSupervisor::new(registry.clone(), &config());

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = supervisor.sweep();
        assert_eq!(report.flagged, vec!["alice"]);
        assert!(report.expired.is_empty());
        assert!(registry.lookup("alice").unwrap().flagged_at.is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        let report = supervisor.sweep();
        assert_eq!(report.expired, vec!["alice"]);
        assert!(registry.list().is_empty());
        assert!(transport.close_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_idle_peer_removed_in_one_sweep() {
        let registry = Arc::new(registry_with(10));
        open_peer(&registry, "alice");
        let supervisor = LivenessSupervisor::new(registry.clone(), &config());

        tokio::time::advance(Duration::from_secs(64)).await;
        let report = supervisor.sweep();
        assert_eq!(report.flagged, vec!["alice"]);
        assert_eq!(report.expired, vec!["alice"]);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeating_peer_stays() {
        let registry = Arc::new(registry_with(10));
        open_peer(&registry, "alice");
        let supervisor = LivenessSupervisor::new(registry.clone(), &config());

        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert!(registry.touch("alice"));
            assert!(supervisor.sweep().is_empty());
        }
        assert!(registry.contains("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_clears_flag() {
        let registry = Arc::new(registry_with(10));
        open_peer(&registry, "alice");
        let supervisor = LivenessSupervisor::new(registry.clone(), &config());

        tokio::time::advance(Duration::from_secs(62)).await;
        assert_eq!(supervisor.sweep().flagged, vec!["alice"]);

        registry.touch("alice");
        assert!(registry.lookup("alice").unwrap().flagged_at.is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(supervisor.sweep().is_empty());
        assert!(registry.contains("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reports_reason() {
        let observers = Arc::new(crate::observer::Observers::new());
        let recorder = Arc::new(RecordingObserver::new("obs"));
        observers.subscribe(recorder.clone());
        let registry = Arc::new(Registry::new(
            10,
            peerlink_core::IdGenerator::default(),
            observers,
        ));
        open_peer(&registry, "alice");
        open_peer(&registry, "bob");
        registry.remove("bob", DisconnectReason::Closed);

        let supervisor = LivenessSupervisor::new(registry.clone(), &config());
        tokio::time::advance(Duration::from_secs(70)).await;
        supervisor.sweep();

        assert_eq!(
            recorder.events(),
            vec![
                "obs connect alice",
                "obs connect bob",
                "obs disconnect bob transport closed",
                "obs disconnect alice heartbeat timeout",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_expires_and_stops() {
        let registry = Arc::new(registry_with(10));
        open_peer(&registry, "alice");
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = LivenessSupervisor::new(registry.clone(), &config());
        let handle = tokio::spawn(supervisor.run(stop_rx));

        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(registry.is_empty());

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor should stop")
            .unwrap();
    }
}
