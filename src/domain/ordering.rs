use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::entity::{Entry, QueueSlot};
use super::error::QueueError;

/// State buckets, in the order they are served. Declaration order is the
/// precedence, so reordering the variants changes the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Bucket {
    Pinned,
    BeingHelped,
    PinnedBeingHelped,
    Waiting,
    HelpedToday,
}

impl Bucket {
    pub fn of(entry: &Entry) -> Self {
        match (entry.in_waiting_room, entry.being_helped) {
            (true, false) => Bucket::Pinned,
            (false, true) => Bucket::BeingHelped,
            (true, true) => Bucket::PinnedBeingHelped,
            (false, false) if entry.helped_today => Bucket::HelpedToday,
            (false, false) => Bucket::Waiting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityPolicy {
    pub urgency_weight: f64,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self { urgency_weight: 2.0 }
    }
}

impl PriorityPolicy {
    /// Lower scores are served earlier. Explicit urgency pushes an entry back,
    /// waiting pulls it forward.
    pub fn score(&self, entry: &Entry, now: DateTime<Utc>) -> f64 {
        let minutes_since_signup = (now - entry.sign_up_time).num_milliseconds() as f64 / 60_000.0;

        self.urgency_weight * entry.time_requested.unwrap_or(0.0) - minutes_since_signup
    }

    pub fn key<'a>(&self, slot: &'a QueueSlot, now: DateTime<Utc>) -> SortKey<'a> {
        SortKey {
            bucket: Bucket::of(&slot.entry),
            score: self.score(&slot.entry, now),
            sign_up_time: slot.entry.sign_up_time,
            slot_id: &slot.slot_id,
        }
    }
}

/// Total order key: bucket, then score, then sign-up time and slot id so
/// that no two slots ever compare equal.
#[derive(Debug, Clone, Copy)]
pub struct SortKey<'a> {
    pub bucket: Bucket,
    pub score: f64,
    pub sign_up_time: DateTime<Utc>,
    pub slot_id: &'a str,
}

impl Ord for SortKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bucket
            .cmp(&other.bucket)
            .then_with(|| self.score.total_cmp(&other.score))
            .then_with(|| self.sign_up_time.cmp(&other.sign_up_time))
            .then_with(|| self.slot_id.cmp(other.slot_id))
    }
}

impl PartialOrd for SortKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey<'_> {}

/// The ordered sequence of slots for one queue.
///
/// The slot list is re-sorted after every mutation that can change order, and
/// both lookup indexes are rebuilt alongside it, so readers never observe a
/// stale position.
#[derive(Debug, Clone, Default)]
pub struct OrderedQueue {
    policy: PriorityPolicy,
    slots: Vec<QueueSlot>,
    positions: HashMap<String, usize>,
    owners: HashMap<String, String>,
}

impl OrderedQueue {
    pub fn new(policy: PriorityPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[QueueSlot] {
        &self.slots
    }

    pub fn enqueue(&mut self, entry: Entry, now: DateTime<Utc>) -> Result<String, QueueError> {
        if self.owners.contains_key(&entry.owner_id) {
            return Err(QueueError::AlreadyQueued);
        }

        let slot = QueueSlot::new(entry);
        let slot_id = slot.slot_id.clone();

        self.slots.push(slot);
        self.resort(now);

        Ok(slot_id)
    }

    pub fn remove(&mut self, slot_id: &str) -> Option<Entry> {
        let index = *self.positions.get(slot_id)?;
        let slot = self.slots.remove(index);

        // Removal keeps the relative order of everything else.
        self.reindex();

        Some(slot.entry)
    }

    pub fn remove_matching<P>(&mut self, mut pred: P) -> Vec<QueueSlot>
    where
        P: FnMut(&Entry) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .slots
            .drain(..)
            .partition(|slot| pred(&slot.entry));

        self.slots = kept;
        self.reindex();

        removed
    }

    /// Replaces the entry behind `slot_id` and re-sorts. Returns the previous
    /// entry.
    pub fn update(
        &mut self,
        slot_id: &str,
        entry: Entry,
        now: DateTime<Utc>,
    ) -> Result<Entry, QueueError> {
        let index = *self
            .positions
            .get(slot_id)
            .ok_or(QueueError::EntryNotFound)?;

        if let Some(holder) = self.owners.get(&entry.owner_id) {
            if holder != slot_id {
                return Err(QueueError::AlreadyQueued);
            }
        }

        let slot = self.slots.get_mut(index).ok_or(QueueError::EntryNotFound)?;
        let previous = std::mem::replace(&mut slot.entry, entry);

        self.resort(now);

        Ok(previous)
    }

    pub fn set_heartbeat(&mut self, slot_id: &str, has_heartbeat: bool) -> bool {
        match self.slot_mut(slot_id) {
            Some(slot) => {
                slot.has_heartbeat = has_heartbeat;
                true
            }
            None => false,
        }
    }

    pub fn find_by_id(&self, slot_id: &str) -> Option<&Entry> {
        self.slot(slot_id).map(|slot| &slot.entry)
    }

    pub fn find_by_owner(&self, owner_id: &str) -> Option<&QueueSlot> {
        self.owners
            .get(owner_id)
            .and_then(|slot_id| self.slot(slot_id))
    }

    pub fn find_matching<P>(&self, mut pred: P) -> Option<&QueueSlot>
    where
        P: FnMut(&Entry) -> bool,
    {
        self.slots.iter().find(|slot| pred(&slot.entry))
    }

    pub fn exists_matching<P>(&self, mut pred: P) -> bool
    where
        P: FnMut(&Entry) -> bool,
    {
        self.slots.iter().any(|slot| pred(&slot.entry))
    }

    /// Current order as `slot_id -> position`, 0-based and contiguous.
    pub fn snapshot_index(&self) -> BTreeMap<String, usize> {
        self.slots
            .iter()
            .enumerate()
            .map(|(position, slot)| (slot.slot_id.clone(), position))
            .collect()
    }

    pub fn clear(&mut self) -> Vec<String> {
        let removed = self.slots.drain(..).map(|slot| slot.slot_id).collect();

        self.reindex();

        removed
    }

    /// Rebuilds from persisted slots. Later duplicates of an owner are dropped.
    pub fn restore(&mut self, slots: Vec<QueueSlot>, now: DateTime<Utc>) -> usize {
        self.slots.clear();
        self.owners.clear();

        let mut dropped = 0;
        for slot in slots {
            if self.owners.contains_key(&slot.entry.owner_id) {
                dropped += 1;
                continue;
            }
            self.owners
                .insert(slot.entry.owner_id.clone(), slot.slot_id.clone());
            self.slots.push(slot);
        }

        self.resort(now);

        dropped
    }

    pub fn resort(&mut self, now: DateTime<Utc>) {
        let policy = self.policy;

        self.slots
            .sort_by(|a, b| policy.key(a, now).cmp(&policy.key(b, now)));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.positions.clear();
        self.owners.clear();

        for (position, slot) in self.slots.iter().enumerate() {
            self.positions.insert(slot.slot_id.clone(), position);
            self.owners
                .insert(slot.entry.owner_id.clone(), slot.slot_id.clone());
        }
    }

    fn slot(&self, slot_id: &str) -> Option<&QueueSlot> {
        self.positions
            .get(slot_id)
            .and_then(|&index| self.slots.get(index))
    }

    fn slot_mut(&mut self, slot_id: &str) -> Option<&mut QueueSlot> {
        let index = *self.positions.get(slot_id)?;

        self.slots.get_mut(index)
    }
}
