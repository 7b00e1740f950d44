use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Announcement, QueueSlot};
use super::ordering::{OrderedQueue, PriorityPolicy};
use super::schedule::{CalendarFilter, CalendarWindow, Schedule, ScheduleOverride, ScheduleStatus};

/// Static description of a hosted queue, read from the queues file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub calendar: CalendarFilter,
    #[serde(default)]
    pub staff: Vec<String>,
}

/// Persisted form of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub slots: Vec<QueueSlot>,
    #[serde(default)]
    pub schedule_override: Option<ScheduleOverride>,
    #[serde(default)]
    pub announcements: Vec<Announcement>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    #[serde(flatten)]
    pub schedule: ScheduleStatus,
    pub announcements: Vec<Announcement>,
}

pub struct HelpQueue {
    id: String,
    name: String,
    staff: HashSet<String>,
    entries: OrderedQueue,
    schedule: Schedule,
    announcements: Vec<Announcement>,
    changed: bool,
}

impl HelpQueue {
    pub fn new(definition: QueueDefinition, policy: PriorityPolicy) -> Self {
        Self {
            id: definition.id,
            name: definition.name,
            staff: definition.staff.into_iter().collect(),
            entries: OrderedQueue::new(policy),
            schedule: Schedule::new(definition.calendar),
            announcements: Vec::new(),
            changed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_user_staff(&self, owner_id: &str) -> bool {
        self.staff.contains(owner_id)
    }

    pub fn entries(&self) -> &OrderedQueue {
        &self.entries
    }

    /// Mutable access marks the queue as needing a save.
    pub fn entries_mut(&mut self) -> &mut OrderedQueue {
        self.changed = true;
        &mut self.entries
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_open(now)
    }

    pub fn set_override(&mut self, schedule_override: ScheduleOverride) {
        self.schedule.set_override(schedule_override);
        self.changed = true;
    }

    pub fn clear_override(&mut self) {
        self.schedule.clear_override();
        self.changed = true;
    }

    /// Calendar windows are derived data and do not dirty the snapshot.
    pub fn set_windows(&mut self, windows: &[CalendarWindow]) {
        self.schedule.set_windows(windows);
    }

    pub fn add_announcement(&mut self, announcement: Announcement) {
        self.announcements.push(announcement);
        self.changed = true;
    }

    pub fn remove_announcement(&mut self, id: &str) -> bool {
        let before = self.announcements.len();
        self.announcements.retain(|a| a.id != id);

        let removed = self.announcements.len() != before;
        if removed {
            self.changed = true;
        }
        removed
    }

    pub fn status(&self, now: DateTime<Utc>) -> QueueStatus {
        QueueStatus {
            schedule: self.schedule.status(now),
            announcements: self
                .announcements
                .iter()
                .filter(|a| a.is_active(now))
                .cloned()
                .collect(),
        }
    }

    /// Returns a snapshot if anything changed since the last one was taken.
    pub fn take_snapshot(&mut self) -> Option<Snapshot> {
        if !self.changed {
            return None;
        }
        self.changed = false;

        Some(Snapshot {
            slots: self.entries.slots().to_vec(),
            schedule_override: self.schedule.schedule_override().cloned(),
            announcements: self.announcements.clone(),
        })
    }

    /// A failed save puts the queue back in line for the next tick.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn restore(&mut self, snapshot: Snapshot, now: DateTime<Utc>) -> usize {
        if let Some(o) = snapshot.schedule_override {
            self.schedule.set_override(o);
        }
        self.announcements = snapshot.announcements;

        self.entries.restore(snapshot.slots, now)
    }
}
