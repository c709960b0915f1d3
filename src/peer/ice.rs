use std::collections::VecDeque;
use tracing::{debug, warn};

use super::connection::PeerConnection;
use super::types::IceCandidate;

/// Remote candidates that arrived before the remote description was set.
/// Kept in arrival order.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.queue.drain(..)
    }
}

/// Applies every queued candidate in arrival order. A candidate the backend
/// rejects is logged and skipped; returns how many were applied.
pub async fn apply_pending_candidates(
    conn: &dyn PeerConnection,
    pending: &mut PendingCandidates,
) -> usize {
    if pending.is_empty() {
        return 0;
    }
    debug!(count = pending.len(), "applying queued ICE candidates");

    let mut applied = 0;
    for candidate in pending.drain() {
        match conn.add_ice_candidate(&candidate).await {
            Ok(()) => applied += 1,
            Err(e) => warn!(candidate = %candidate.candidate, "failed to apply queued candidate: {e}"),
        }
    }
    applied
}

/// Candidate type (`host`, `srflx`, `relay`, ...) from the candidate line.
pub fn candidate_type(candidate: &IceCandidate) -> Option<&str> {
    let mut parts = candidate.candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return parts.next();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keeps_arrival_order() {
        let mut pending = PendingCandidates::default();
        for i in 0..3 {
            pending.push(IceCandidate::new(format!("candidate:{i}")));
        }
        let order: Vec<_> = pending.drain().map(|c| c.candidate).collect();
        assert_eq!(order, ["candidate:0", "candidate:1", "candidate:2"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn candidate_type_is_read_from_the_line() {
        let relay = IceCandidate::new("candidate:3 1 udp 41885439 203.0.113.7 3478 typ relay raddr 0.0.0.0 rport 0");
        assert_eq!(candidate_type(&relay), Some("relay"));
        assert_eq!(candidate_type(&IceCandidate::new("garbage")), None);
    }
}
