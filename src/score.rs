//! # Peer Scoring and Request Quotas
//!
//! Two small mechanisms that feed peer lifecycle decisions:
//!
//! - [`PeerScore`]: additive integer score clamped to
//!   `[SCORE_LOW_LIMIT, SCORE_HIGH_LIMIT]`. Req/Resp outcomes and gossip
//!   validation apply [`PeerAction`]s; crossing the low limit schedules a
//!   disconnect with reason `PeerScoreLow`.
//! - [`TokenBucket`]: request quota. Each peer owns one (capacity
//!   `MAX_REQUEST_QUOTA`, full replenish over 5 s) and the network owns a
//!   global one at twice that capacity. Serving one request costs one token.
//!
//! Both are plain values mutated only by their owning actor; no locks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{SCORE_HIGH_LIMIT, SCORE_LOW_LIMIT};

// ============================================================================
// Peer Actions
// ============================================================================

/// Score deltas applied for observed peer behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerAction {
    /// Peer served a meaningful, valid response.
    GoodValues,
    /// Clean status exchange.
    GoodStatus,
    /// Benign failure: timeout, EOF before response, broken stream.
    PoorRequest,
    /// Peer never answered a request.
    NoResponse,
    /// Status response was stale relative to what the peer advertised.
    StaleStatus,
    /// Protocol violation: bad framing, bad ssz, chunk overflow.
    InvalidRequest,
    /// Response on a fork we consider unviable.
    UnviableFork,
    /// Drop to the floor immediately.
    Fatal,
}

impl PeerAction {
    pub fn delta(self) -> i32 {
        match self {
            PeerAction::GoodValues => 5,
            PeerAction::GoodStatus => 2,
            PeerAction::PoorRequest => -2,
            PeerAction::NoResponse => -5,
            PeerAction::StaleStatus => -3,
            PeerAction::InvalidRequest => -25,
            PeerAction::UnviableFork => -10,
            PeerAction::Fatal => SCORE_LOW_LIMIT,
        }
    }
}

// ============================================================================
// Peer Score
// ============================================================================

/// Outcome of a score update, so the caller knows when to act.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreTransition {
    /// Still above the low limit.
    Ok,
    /// This update crossed (or landed on) the low limit; schedule disconnect.
    CrossedLowLimit,
    /// Already at or below the limit before this update.
    AlreadyLow,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerScore {
    value: i32,
}

impl PeerScore {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn is_low(&self) -> bool {
        self.value <= SCORE_LOW_LIMIT
    }

    /// Apply an action, clamping into the valid range.
    pub fn apply(&mut self, action: PeerAction) -> ScoreTransition {
        let was_low = self.is_low();
        if action == PeerAction::Fatal {
            self.value = SCORE_LOW_LIMIT;
        } else {
            self.value = (self.value + action.delta()).clamp(SCORE_LOW_LIMIT, SCORE_HIGH_LIMIT);
        }
        match (was_low, self.is_low()) {
            (false, true) => ScoreTransition::CrossedLowLimit,
            (true, _) => ScoreTransition::AlreadyLow,
            _ => ScoreTransition::Ok,
        }
    }

    /// Score resets to zero when a disconnected peer is re-encountered.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

// ============================================================================
// Token Bucket
// ============================================================================

/// Continuous-refill token bucket. The full capacity replenishes over
/// `replenish_time`; consumption is in whole-token units.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    replenish_time: Duration,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, replenish_time: Duration) -> Self {
        Self {
            capacity,
            tokens: capacity,
            replenish_time,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = self.capacity / self.replenish_time.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        self.last_update = now;
    }

    /// Non-blocking consume of one token.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until one token is available. Zero when `try_consume` would
    /// succeed right now.
    pub fn wait_time(&mut self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    fn wait_time_at(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - self.tokens;
        let rate = self.capacity / self.replenish_time.as_secs_f64();
        Duration::from_secs_f64(deficit / rate)
    }

    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

// ============================================================================
// Throttle Counters
// ============================================================================

/// Counts how often inbound requests had to wait on a quota, tagged by the
/// short protocol id. Exposed for metrics scraping.
#[derive(Debug, Default)]
pub struct ThrottleCounters {
    counts: HashMap<&'static str, u64>,
}

impl ThrottleCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, protocol: &'static str) {
        *self.counts.entry(protocol).or_insert(0) += 1;
    }

    pub fn get(&self, protocol: &str) -> u64 {
        self.counts.get(protocol).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut v: Vec<_> = self.counts.iter().map(|(k, c)| (*k, *c)).collect();
        v.sort();
        v
    }
}
