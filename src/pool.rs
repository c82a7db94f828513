//! # Peer Pool
//!
//! Bounded set of admitted peers with per-direction counts. Admission is
//! score-gated and capacity-gated; results are explicit so callers can react
//! (drop the connection, schedule trimming, ignore a duplicate).
//!
//! Two hooks surface membership changes: a peer-count callback (metrics and
//! the trimmer feed off it) and an `on_delete_peer` hook evaluated on
//! removal.

use std::collections::HashMap;

use crate::config::SCORE_LOW_LIMIT;
use crate::identity::PeerId;
use crate::peer::Direction;

/// Outcome of an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionResult {
    Success,
    /// Score at or below the admission threshold.
    LowScore,
    /// Pool is full.
    NoSpace,
    /// Peer already admitted.
    Duplicate,
    /// Peer is disconnected or disconnecting.
    DeadPeer,
}

type CountCallback = Box<dyn Fn(usize, usize) + Send>;
type DeleteCallback = Box<dyn Fn(PeerId) + Send>;

pub struct PeerPool {
    max_peers: usize,
    min_score: i32,
    members: HashMap<PeerId, Direction>,
    incoming: usize,
    outgoing: usize,
    on_count_changed: Option<CountCallback>,
    on_delete_peer: Option<DeleteCallback>,
}

impl PeerPool {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            min_score: SCORE_LOW_LIMIT,
            members: HashMap::new(),
            incoming: 0,
            outgoing: 0,
            on_count_changed: None,
            on_delete_peer: None,
        }
    }

    /// Override the admission score threshold (exclusive lower bound).
    pub fn with_min_score(mut self, min_score: i32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Called with (incoming, outgoing) after every membership change.
    pub fn on_count_changed(&mut self, callback: CountCallback) {
        self.on_count_changed = Some(callback);
    }

    /// Called with the removed peer id on every removal.
    pub fn on_delete_peer(&mut self, callback: DeleteCallback) {
        self.on_delete_peer = Some(callback);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn incoming(&self) -> usize {
        self.incoming
    }

    pub fn outgoing(&self) -> usize {
        self.outgoing
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains_key(peer)
    }

    pub fn direction(&self, peer: &PeerId) -> Option<Direction> {
        self.members.get(peer).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Direction)> {
        self.members.iter()
    }

    /// Excess members above a target, for the trimmer.
    pub fn excess(&self, target: usize) -> usize {
        self.members.len().saturating_sub(target)
    }

    /// Try to admit a peer. `score` is the peer's current score; `alive`
    /// reflects its connection state.
    pub fn try_insert(
        &mut self,
        peer: PeerId,
        direction: Direction,
        score: i32,
        alive: bool,
    ) -> AdmissionResult {
        if !alive {
            return AdmissionResult::DeadPeer;
        }
        if self.members.contains_key(&peer) {
            return AdmissionResult::Duplicate;
        }
        if score <= self.min_score {
            return AdmissionResult::LowScore;
        }
        if self.members.len() >= self.max_peers {
            return AdmissionResult::NoSpace;
        }

        self.members.insert(peer, direction);
        match direction {
            Direction::Incoming => self.incoming += 1,
            Direction::Outgoing => self.outgoing += 1,
        }
        self.notify_count();
        AdmissionResult::Success
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let Some(direction) = self.members.remove(peer) else {
            return false;
        };
        match direction {
            Direction::Incoming => self.incoming -= 1,
            Direction::Outgoing => self.outgoing -= 1,
        }
        if let Some(on_delete) = &self.on_delete_peer {
            on_delete(*peer);
        }
        self.notify_count();
        true
    }

    fn notify_count(&self) {
        if let Some(callback) = &self.on_count_changed {
            callback(self.incoming, self.outgoing);
        }
    }
}
