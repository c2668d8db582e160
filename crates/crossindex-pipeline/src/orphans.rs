//! Bounded retry queue for destination legs seen before their origination.
//!
//! Entries are keyed by message ID. Each entry is retried on an exponential
//! schedule until its origination shows up, or until it runs out of attempts
//! or age, at which point the caller escalates it.
//!
//! The queue itself is in memory; the normalizer mirrors every entry into the
//! message store as a [`PendingOrphan`] and [`adopt`](OrphanQueue::adopt)s
//! them back on start.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crossindex_core::policy::{RetryConfig, RetryPolicy};
use crossindex_core::{PendingOrphan, RawEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct OrphanPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Retries before an entry is escalated.
    pub max_attempts: u32,
    /// Time since first sighting before an entry is escalated.
    pub max_age: Duration,
    /// Distinct message IDs held at once.
    pub capacity: usize,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: 12,
            max_age: Duration::from_secs(30 * 60),
            capacity: 10_000,
        }
    }
}

impl OrphanPolicy {
    fn backoff(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            multiplier: self.multiplier,
        })
    }
}

/// Destination legs waiting for one message's origination.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub message_id: String,
    /// Distinct destination legs, in arrival order.
    pub events: Vec<RawEvent>,
    /// Retries performed so far.
    pub attempts: u32,
    pub first_seen: Instant,
    /// Wall-clock `first_seen`, kept across restarts.
    pub first_seen_at: DateTime<Utc>,
    next_attempt: Instant,
}

impl Orphan {
    pub fn chain_id(&self) -> u64 {
        self.events.first().map(|e| e.chain_id).unwrap_or_default()
    }

    pub fn next_attempt(&self) -> Instant {
        self.next_attempt
    }

    /// The durable form of this entry.
    pub fn to_pending(&self) -> PendingOrphan {
        PendingOrphan {
            message_id: self.message_id.clone(),
            events: self.events.clone(),
            attempts: self.attempts,
            first_seen: self.first_seen_at,
        }
    }
}

/// Result of putting a retried orphan back.
#[derive(Debug)]
pub enum Reschedule {
    Queued,
    /// Out of attempts or age; the entry has left the queue.
    Exhausted(Orphan, &'static str),
}

#[derive(Debug)]
pub struct OrphanQueue {
    policy: OrphanPolicy,
    backoff: RetryPolicy,
    entries: HashMap<String, Orphan>,
}

impl Default for OrphanQueue {
    fn default() -> Self {
        Self::new(OrphanPolicy::default())
    }
}

impl OrphanQueue {
    pub fn new(policy: OrphanPolicy) -> Self {
        let backoff = policy.backoff();
        Self {
            policy,
            backoff,
            entries: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &OrphanPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Queue a destination leg.
    ///
    /// A leg already held for the same message (same chain, tx, log index)
    /// is not duplicated and does not reset the schedule. When a new message
    /// ID arrives at capacity, the oldest entry is evicted and returned for
    /// escalation.
    pub fn push(&mut self, message_id: String, event: RawEvent, now: Instant) -> Option<Orphan> {
        if let Some(existing) = self.entries.get_mut(&message_id) {
            if !existing.events.iter().any(|e| e.log_key() == event.log_key()) {
                existing.events.push(event);
            }
            return None;
        }

        let evicted = self.make_room();
        self.entries.insert(
            message_id.clone(),
            Orphan {
                message_id,
                events: vec![event],
                attempts: 0,
                first_seen: now,
                first_seen_at: Utc::now(),
                next_attempt: now + self.backoff.delay_for(1),
            },
        );
        evicted
    }

    /// Re-queue an entry persisted by an earlier run, due immediately.
    ///
    /// Its age carries over: `first_seen` is placed as far before `now` as
    /// `pending.first_seen` is before `wall_now`. Evicts like [`push`](Self::push).
    pub fn adopt(
        &mut self,
        pending: PendingOrphan,
        now: Instant,
        wall_now: DateTime<Utc>,
    ) -> Option<Orphan> {
        if self.entries.contains_key(&pending.message_id) {
            return None;
        }
        let age = (wall_now - pending.first_seen).to_std().unwrap_or_default();
        let evicted = self.make_room();
        self.entries.insert(
            pending.message_id.clone(),
            Orphan {
                message_id: pending.message_id,
                events: pending.events,
                attempts: pending.attempts,
                first_seen: now.checked_sub(age).unwrap_or(now),
                first_seen_at: pending.first_seen,
                next_attempt: now,
            },
        );
        evicted
    }

    pub fn get(&self, message_id: &str) -> Option<&Orphan> {
        self.entries.get(message_id)
    }

    /// Take the entry for `message_id`, if any.
    pub fn remove(&mut self, message_id: &str) -> Option<Orphan> {
        self.entries.remove(message_id)
    }

    /// Put back an entry taken out of the queue, schedule untouched.
    pub fn restore(&mut self, orphan: Orphan) {
        self.entries.insert(orphan.message_id.clone(), orphan);
    }

    /// Remove and return every entry whose retry time has come, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<Orphan> {
        let mut due: Vec<String> = self
            .entries
            .values()
            .filter(|o| o.next_attempt <= now)
            .map(|o| o.message_id.clone())
            .collect();
        due.sort_by_key(|id| self.entries[id].first_seen);
        due.iter().filter_map(|id| self.entries.remove(id)).collect()
    }

    /// Put back an entry whose retry found no origination yet.
    pub fn reschedule(&mut self, mut orphan: Orphan, now: Instant) -> Reschedule {
        orphan.attempts += 1;
        if orphan.attempts >= self.policy.max_attempts {
            return Reschedule::Exhausted(orphan, "retry attempts exhausted");
        }
        if now.duration_since(orphan.first_seen) >= self.policy.max_age {
            return Reschedule::Exhausted(orphan, "retry window expired");
        }
        orphan.next_attempt = now + self.backoff.delay_for(orphan.attempts + 1);
        self.entries.insert(orphan.message_id.clone(), orphan);
        Reschedule::Queued
    }

    /// Earliest pending retry time.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|o| o.next_attempt).min()
    }

    /// Empty the queue, oldest first.
    pub fn drain(&mut self) -> Vec<Orphan> {
        let mut all: Vec<Orphan> = self.entries.drain().map(|(_, o)| o).collect();
        all.sort_by_key(|o| o.first_seen);
        all
    }

    fn make_room(&mut self) -> Option<Orphan> {
        if self.entries.len() < self.policy.capacity.max(1) {
            return None;
        }
        self.oldest_id().and_then(|id| self.entries.remove(&id))
    }

    fn oldest_id(&self) -> Option<String> {
        self.entries
            .values()
            .min_by_key(|o| o.first_seen)
            .map(|o| o.message_id.clone())
    }
}
