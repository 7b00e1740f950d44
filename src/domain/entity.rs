use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One participant's active help request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    // Identity
    pub owner_id: String,
    pub display_name: String,

    // Free text
    pub help_description: Option<String>,
    pub location: Option<String>,

    // Ordering inputs
    pub sign_up_time: DateTime<Utc>,
    pub time_requested: Option<f64>,
    pub helped_today: bool,

    // Staff controlled state
    pub being_helped: bool,
    pub in_waiting_room: bool,

    // Presence
    pub is_online: bool,
}

impl Entry {
    pub fn new(
        owner_id: String,
        display_name: String,
        help_description: String,
        location: String,
        time_requested: Option<f64>,
        helped_today: bool,
        sign_up_time: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id,
            display_name,
            help_description: Some(help_description),
            location: Some(location),
            sign_up_time,
            time_requested,
            helped_today,
            being_helped: false,
            in_waiting_room: false,
            is_online: true,
        }
    }
}

/// An entry inside a queue, addressed externally by its opaque `slot_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSlot {
    pub slot_id: String,
    pub has_heartbeat: bool,
    pub entry: Entry,
}

impl QueueSlot {
    pub fn new(entry: Entry) -> Self {
        Self {
            slot_id: random_id(),
            has_heartbeat: true,
            entry,
        }
    }
}

/// Staff authored message attached to a queue's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub message: String,
    pub until: Option<DateTime<Utc>>,
}

impl Announcement {
    pub fn new(message: String, until: Option<DateTime<Utc>>) -> Self {
        Self {
            id: random_id(),
            message,
            until,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until.map_or(true, |until| now < until)
    }
}

/// A verified caller, as returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner_id: String,
    pub display_name: String,
    pub is_staff: bool,
}

/// 16 random bytes, hex encoded. Unguessable handle for slots and requests.
pub fn random_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();

    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
