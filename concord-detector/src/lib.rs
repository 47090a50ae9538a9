// SPDX-License-Identifier: MIT

pub mod phi;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use concord_core::PeerId;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::phi::PhiAccrual;

pub const DEFAULT_PHI_THRESHOLD: f64 = 8.0;
pub const DEFAULT_MAX_SAMPLES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Alive,
    Suspected,
    Dead,
}

pub type StatusCallback = Box<dyn Fn(PeerId) + Send + Sync>;

struct PeerState {
    accrual: PhiAccrual,
    status: PeerStatus,
}

/// Per-peer monitoring snapshot, as reported by `stats`.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub peer: PeerId,
    pub status: PeerStatus,
    pub phi: f64,
    pub mean_interval: f64,
    pub std_deviation: f64,
}

/// Phi-accrual failure detector over the cluster's peers.
///
/// Heartbeats feed per-peer accrual windows; a sweep task walks the peers
/// every heartbeat interval and escalates Alive -> Suspected -> Dead as
/// phi crosses the threshold and twice the threshold. A heartbeat arriving
/// while Suspected or Dead resets the peer to Alive.
pub struct FailureDetector {
    threshold: f64,
    sweep_interval: Duration,
    peers: RwLock<HashMap<PeerId, PeerState>>,
    on_suspected: Mutex<Option<StatusCallback>>,
    on_dead: Mutex<Option<StatusCallback>>,
    on_recovered: Mutex<Option<StatusCallback>>,
}

impl FailureDetector {
    pub fn new(threshold: f64, sweep_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            threshold,
            sweep_interval,
            peers: RwLock::new(HashMap::new()),
            on_suspected: Mutex::new(None),
            on_dead: Mutex::new(None),
            on_recovered: Mutex::new(None),
        })
    }

    pub async fn set_on_suspected(&self, cb: StatusCallback) {
        *self.on_suspected.lock().await = Some(cb);
    }

    pub async fn set_on_dead(&self, cb: StatusCallback) {
        *self.on_dead.lock().await = Some(cb);
    }

    pub async fn set_on_recovered(&self, cb: StatusCallback) {
        *self.on_recovered.lock().await = Some(cb);
    }

    pub async fn register_peer(&self, peer: PeerId) {
        let mut peers = self.peers.write().await;
        peers.entry(peer).or_insert_with(|| {
            info!("[Detector] Monitoring peer {}", peer);
            PeerState {
                accrual: PhiAccrual::new(DEFAULT_MAX_SAMPLES),
                status: PeerStatus::Unknown,
            }
        });
    }

    pub async fn unregister_peer(&self, peer: PeerId) {
        if self.peers.write().await.remove(&peer).is_some() {
            info!("[Detector] Stopped monitoring peer {}", peer);
        }
    }

    /// Record a heartbeat from `peer`. Unregistered peers are registered
    /// on first contact.
    pub async fn record_heartbeat(&self, peer: PeerId) {
        let recovered = {
            let mut peers = self.peers.write().await;
            let state = peers.entry(peer).or_insert_with(|| PeerState {
                accrual: PhiAccrual::new(DEFAULT_MAX_SAMPLES),
                status: PeerStatus::Unknown,
            });
            state.accrual.heartbeat();
            let was = state.status;
            state.status = PeerStatus::Alive;
            debug!("[Detector] Heartbeat from {} (phi={:.2})", peer, state.accrual.phi());
            matches!(was, PeerStatus::Suspected | PeerStatus::Dead)
        };
        if recovered {
            info!("[Detector] Peer {} recovered", peer);
            if let Some(cb) = self.on_recovered.lock().await.as_ref() {
                cb(peer);
            }
        }
    }

    /// One monitoring pass. The sweep loop calls this every interval;
    /// tests call it directly.
    pub async fn sweep(&self) {
        let mut suspected = Vec::new();
        let mut dead = Vec::new();
        {
            let mut peers = self.peers.write().await;
            for (peer, state) in peers.iter_mut() {
                let phi = state.accrual.phi();
                match state.status {
                    PeerStatus::Alive if phi >= self.threshold => {
                        state.status = PeerStatus::Suspected;
                        warn!("[Detector] Peer {} suspected (phi={:.2})", peer, phi);
                        suspected.push(*peer);
                    }
                    PeerStatus::Suspected if phi > self.threshold * 2.0 => {
                        state.status = PeerStatus::Dead;
                        error!("[Detector] Peer {} marked DEAD (phi={:.2})", peer, phi);
                        dead.push(*peer);
                    }
                    _ => {}
                }
            }
        }
        if !suspected.is_empty() {
            if let Some(cb) = self.on_suspected.lock().await.as_ref() {
                for peer in &suspected {
                    cb(*peer);
                }
            }
        }
        if !dead.is_empty() {
            if let Some(cb) = self.on_dead.lock().await.as_ref() {
                for peer in &dead {
                    cb(*peer);
                }
            }
        }
    }

    /// Spawn the monitoring loop; it stops when `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            info!("[Detector] Started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.sweep_interval) => self.sweep().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("[Detector] Stopped");
                            return;
                        }
                    }
                }
            }
        });
    }

    pub async fn status(&self, peer: PeerId) -> PeerStatus {
        self.peers
            .read()
            .await
            .get(&peer)
            .map(|s| s.status)
            .unwrap_or(PeerStatus::Unknown)
    }

    pub async fn peers_with_status(&self, status: PeerStatus) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(p, _)| *p)
            .collect()
    }

    pub async fn alive_peers(&self) -> Vec<PeerId> {
        self.peers_with_status(PeerStatus::Alive).await
    }

    pub async fn suspected_peers(&self) -> Vec<PeerId> {
        self.peers_with_status(PeerStatus::Suspected).await
    }

    pub async fn dead_peers(&self) -> Vec<PeerId> {
        self.peers_with_status(PeerStatus::Dead).await
    }

    pub async fn stats(&self) -> Vec<PeerStats> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(peer, s)| PeerStats {
                peer: *peer,
                status: s.status,
                phi: s.accrual.phi(),
                mean_interval: s.accrual.mean_interval(),
                std_deviation: s.accrual.std_deviation(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn feed(detector: &FailureDetector, peer: PeerId, beats: usize) {
        for _ in 0..beats {
            detector.record_heartbeat(peer).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn unknown_until_first_heartbeat() {
        let detector = FailureDetector::new(8.0, Duration::from_millis(50));
        detector.register_peer(7).await;
        assert_eq!(detector.status(7).await, PeerStatus::Unknown);
        detector.record_heartbeat(7).await;
        assert_eq!(detector.status(7).await, PeerStatus::Alive);
    }

    #[tokio::test]
    async fn silence_escalates_to_suspected_then_dead() {
        let detector = FailureDetector::new(8.0, Duration::from_millis(50));
        feed(&detector, 1, 20).await;
        assert_eq!(detector.status(1).await, PeerStatus::Alive);

        tokio::time::sleep(Duration::from_millis(400)).await;
        detector.sweep().await;
        assert_eq!(detector.status(1).await, PeerStatus::Suspected);
        detector.sweep().await;
        assert_eq!(detector.status(1).await, PeerStatus::Dead);
    }

    #[tokio::test]
    async fn heartbeat_recovers_a_dead_peer() {
        let recoveries = Arc::new(AtomicUsize::new(0));
        let detector = FailureDetector::new(8.0, Duration::from_millis(50));
        let seen = recoveries.clone();
        detector
            .set_on_recovered(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        feed(&detector, 2, 20).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        detector.sweep().await;
        detector.sweep().await;
        assert_eq!(detector.status(2).await, PeerStatus::Dead);

        detector.record_heartbeat(2).await;
        assert_eq!(detector.status(2).await, PeerStatus::Alive);
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_cover_every_registered_peer() {
        let detector = FailureDetector::new(8.0, Duration::from_millis(50));
        detector.register_peer(1).await;
        detector.register_peer(2).await;
        detector.record_heartbeat(1).await;
        let stats = detector.stats().await;
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.phi == 0.0));
    }
}
