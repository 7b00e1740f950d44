use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entity::{Entry, Identity};

pub const ANONYMOUS_NAME: &str = "Anonymous";

/// What a peer sees of someone else's entry: enough to render the queue
/// fairly, nothing that identifies the person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnonymousEntry {
    pub display_name: &'static str,
    pub sign_up_time: DateTime<Utc>,
    pub time_requested: Option<f64>,
    pub helped_today: bool,
    pub being_helped: bool,
    pub in_waiting_room: bool,
    pub is_online: bool,
}

impl From<&Entry> for AnonymousEntry {
    fn from(entry: &Entry) -> Self {
        Self {
            display_name: ANONYMOUS_NAME,
            sign_up_time: entry.sign_up_time,
            time_requested: entry.time_requested,
            helped_today: entry.helped_today,
            being_helped: entry.being_helped,
            in_waiting_room: entry.in_waiting_room,
            is_online: entry.is_online,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntryView {
    Full(Entry),
    Anonymous(AnonymousEntry),
}

/// Owners and staff see the real entry; everyone else, including
/// unauthenticated viewers, sees the anonymous projection.
pub fn project(entry: &Entry, viewer: Option<&Identity>, viewer_is_staff: bool) -> EntryView {
    let is_owner = viewer.map_or(false, |v| v.owner_id == entry.owner_id);

    if is_owner || viewer_is_staff {
        EntryView::Full(entry.clone())
    } else {
        EntryView::Anonymous(AnonymousEntry::from(entry))
    }
}
