use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Result;
use crate::peer::{PeerSession, PeerState};
use crate::protocol::ParticipantId;
use crate::signaling::Outbox;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    Periodic,
    Foreground,
}

/// Outcome of one restart attempt during a sweep.
pub struct Restarted {
    pub participant: ParticipantId,
    pub before: PeerState,
    pub result: Result<()>,
}

/// Liveness sweep over every peer session.
///
/// Peers whose transport reports disconnected or failed get an ICE restart.
/// There is no backoff beyond the fixed interval.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A restart outstanding for this long is considered stalled and reissued.
    pub fn retry_after(&self) -> Duration {
        self.interval / 2
    }

    pub async fn sweep(
        &self,
        reason: SweepReason,
        peers: &mut HashMap<ParticipantId, PeerSession>,
        outbox: &mut Outbox,
    ) -> Vec<Restarted> {
        self.sweep_at(Instant::now(), reason, peers, outbox).await
    }

    pub async fn sweep_at(
        &self,
        now: Instant,
        reason: SweepReason,
        peers: &mut HashMap<ParticipantId, PeerSession>,
        outbox: &mut Outbox,
    ) -> Vec<Restarted> {
        let mut due: Vec<ParticipantId> = peers
            .values()
            .filter(|p| p.needs_restart(now, self.retry_after()))
            .map(|p| p.participant().clone())
            .collect();
        due.sort();
        debug!(?reason, peers = peers.len(), restarts = due.len(), "health sweep");

        let mut out = Vec::with_capacity(due.len());
        for participant in due {
            let Some(peer) = peers.get_mut(&participant) else {
                continue;
            };
            let before = peer.state();
            let result = peer.restart_ice(outbox).await;
            out.push(Restarted {
                participant,
                before,
                result,
            });
        }
        out
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_INTERVAL)
    }
}
