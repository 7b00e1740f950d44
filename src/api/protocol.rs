use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{ErrorBody, QueueError};
use crate::domain::queue::{HelpQueue, QueueStatus};
use crate::domain::schedule::ScheduleOverride;
use crate::domain::visibility::EntryView;

// Inbound

#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(flatten)]
    pub request: QueueRequest,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueRequest {
    ListQueues,
    ListEntries {
        queue_id: String,
    },
    ItemInfo {
        queue_id: String,
        slot_ids: Vec<String>,
    },
    RequestUpdate {
        queue_id: String,
    },
    CheckIfStaff {
        queue_id: String,
    },
    Join {
        queue_id: String,
        help_description: String,
        location: String,
        #[serde(default)]
        time_requested: Option<f64>,
    },
    Leave {
        queue_id: String,
        slot_id: String,
    },
    UpdateSelf {
        queue_id: String,
        slot_id: String,
        #[serde(default)]
        help_description: Option<String>,
        #[serde(default)]
        location: Option<String>,
    },
    Help {
        queue_id: String,
        slot_id: String,
        is_helped: bool,
    },
    Pin {
        queue_id: String,
        slot_id: String,
        in_waiting_room: bool,
    },
    Helped {
        queue_id: String,
        slot_id: String,
    },
    SendMessage {
        queue_id: String,
        to_owner_id: String,
        message: String,
    },
    BroadcastMessage {
        queue_id: String,
        message: String,
    },
    ClearQueue {
        queue_id: String,
    },
    OverrideSchedule {
        queue_id: String,
        schedule_override: ScheduleOverride,
    },
    ClearOverride {
        queue_id: String,
    },
    SyncCalendar {
        queue_id: String,
    },
    AddAnnouncement {
        queue_id: String,
        message: String,
        #[serde(default)]
        until: Option<DateTime<Utc>>,
    },
    RemoveAnnouncement {
        queue_id: String,
        announcement_id: String,
    },
    RequestHeartbeat {
        queue_id: String,
        minutes_to_respond: f64,
    },
    Heartbeat {
        request_ids: Vec<String>,
    },
}

/// Longest heartbeat window staff may ask for.
pub const MAX_HEARTBEAT_MINUTES: f64 = 24.0 * 60.0;

fn required(field: &str, value: &str) -> Result<(), QueueError> {
    if value.trim().is_empty() {
        return Err(QueueError::validation(format!("{} is required", field)));
    }
    Ok(())
}

impl QueueRequest {
    /// Shape checks that need no queue state. Run before anything else.
    pub fn validate(&self) -> Result<(), QueueError> {
        use QueueRequest::*;

        match self {
            ListQueues => Ok(()),
            ListEntries { queue_id }
            | RequestUpdate { queue_id }
            | CheckIfStaff { queue_id }
            | ClearQueue { queue_id }
            | ClearOverride { queue_id }
            | SyncCalendar { queue_id } => required("queue_id", queue_id),
            ItemInfo { queue_id, slot_ids } => {
                required("queue_id", queue_id)?;
                slot_ids.iter().try_for_each(|id| required("slot_id", id))
            }
            Join {
                queue_id,
                help_description,
                location,
                time_requested,
            } => {
                required("queue_id", queue_id)?;
                required("help_description", help_description)?;
                required("location", location)?;
                match time_requested {
                    Some(t) if !t.is_finite() || *t < 0.0 => Err(QueueError::validation(
                        "time_requested must be a non-negative number",
                    )),
                    _ => Ok(()),
                }
            }
            Leave { queue_id, slot_id }
            | Help {
                queue_id, slot_id, ..
            }
            | Pin {
                queue_id, slot_id, ..
            }
            | Helped { queue_id, slot_id }
            | UpdateSelf {
                queue_id, slot_id, ..
            } => {
                required("queue_id", queue_id)?;
                required("slot_id", slot_id)
            }
            SendMessage {
                queue_id,
                to_owner_id,
                message,
            } => {
                required("queue_id", queue_id)?;
                required("to_owner_id", to_owner_id)?;
                required("message", message)
            }
            BroadcastMessage { queue_id, message }
            | AddAnnouncement {
                queue_id, message, ..
            } => {
                required("queue_id", queue_id)?;
                required("message", message)
            }
            OverrideSchedule {
                queue_id,
                schedule_override,
            } => {
                required("queue_id", queue_id)?;
                if schedule_override.from >= schedule_override.to {
                    return Err(QueueError::validation("override must end after it starts"));
                }
                Ok(())
            }
            RemoveAnnouncement {
                queue_id,
                announcement_id,
            } => {
                required("queue_id", queue_id)?;
                required("announcement_id", announcement_id)
            }
            RequestHeartbeat {
                queue_id,
                minutes_to_respond,
            } => {
                required("queue_id", queue_id)?;
                if !minutes_to_respond.is_finite()
                    || *minutes_to_respond <= 0.0
                    || *minutes_to_respond > MAX_HEARTBEAT_MINUTES
                {
                    return Err(QueueError::validation(format!(
                        "minutes_to_respond must be between 0 and {}",
                        MAX_HEARTBEAT_MINUTES
                    )));
                }
                Ok(())
            }
            Heartbeat { request_ids } => {
                if request_ids.is_empty() {
                    return Err(QueueError::validation("request_ids is required"));
                }
                request_ids.iter().try_for_each(|id| required("request_id", id))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Connected { owner_id: String },
    Disconnected { owner_id: String },
}

// Outbound

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ServiceResponse<T, E> {
    Ok(T),
    Err(E),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedEntry {
    pub slot_id: String,
    pub has_heartbeat: bool,
    pub entry: EntryView,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueResponse {
    Ack,
    Queues {
        queues: BTreeMap<String, String>,
    },
    Entries {
        entries: Vec<ListedEntry>,
    },
    ItemInfo {
        items: BTreeMap<String, EntryView>,
    },
    Update(OrderUpdate),
    IsStaff {
        is_staff: bool,
    },
    Joined {
        slot_id: String,
    },
    AnnouncementAdded {
        announcement_id: String,
    },
    HeartbeatRequested {
        request_id: String,
        deadline: DateTime<Utc>,
        at_risk: usize,
    },
}

/// Membership or order changed. Observers drop `removable_slot_ids` and
/// re-position everything in `updated_index`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderUpdate {
    pub queue_id: String,
    pub updated_index: BTreeMap<String, usize>,
    pub removable_slot_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<QueueStatus>,
}

impl OrderUpdate {
    pub fn of(queue: &HelpQueue, removable_slot_ids: Vec<String>) -> Self {
        Self {
            queue_id: queue.id().to_string(),
            updated_index: queue.entries().snapshot_index(),
            removable_slot_ids,
            status: None,
        }
    }

    pub fn with_status(mut self, status: QueueStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Displayed fields changed for these slots; observers re-fetch them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentUpdate {
    pub queue_id: String,
    pub updated_slot_ids: Vec<String>,
}

/// Everything published on a queue topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueBroadcast {
    OrderUpdate(OrderUpdate),
    ContentUpdate(ContentUpdate),
    Message { queue_id: String, message: String },
}

/// Everything sent to a single person's channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    BeingHelped {
        queue_id: String,
        is_helped: bool,
    },
    HeartbeatRequested {
        queue_id: String,
        request_id: String,
        deadline: DateTime<Utc>,
    },
    Message {
        queue_id: String,
        message: String,
    },
}

#[async_trait::async_trait]
pub trait QueueServiceRPC: Clone + Send + Sync + 'static {
    async fn handle(&self, envelope: RequestEnvelope) -> ServiceResponse<QueueResponse, ErrorBody>;
}

#[async_trait::async_trait]
pub trait PresenceRouter: Clone + Send + Sync + 'static {
    async fn route(&self, event: PresenceEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RequestEnvelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn envelope_carries_credential_and_op() {
        let envelope = parse(
            r#"{"credential": "tok", "op": "join", "queue_id": "bbb",
                "help_description": "gdb", "location": "table 3", "time_requested": 5}"#,
        );

        assert_eq!(envelope.credential.as_deref(), Some("tok"));
        assert_eq!(
            envelope.request,
            QueueRequest::Join {
                queue_id: "bbb".to_string(),
                help_description: "gdb".to_string(),
                location: "table 3".to_string(),
                time_requested: Some(5.0),
            }
        );
        assert!(envelope.request.validate().is_ok());
    }

    #[test]
    fn anonymous_requests_parse() {
        let envelope = parse(r#"{"op": "list_queues"}"#);

        assert!(envelope.credential.is_none());
        assert_eq!(envelope.request, QueueRequest::ListQueues);
    }

    #[test]
    fn validation_rejects_malformed_input() {
        let bad = [
            r#"{"op": "join", "queue_id": "bbb", "help_description": " ", "location": "x"}"#,
            r#"{"op": "join", "queue_id": "bbb", "help_description": "x", "location": "x", "time_requested": -1}"#,
            r#"{"op": "leave", "queue_id": "", "slot_id": "abc"}"#,
            r#"{"op": "request_heartbeat", "queue_id": "bbb", "minutes_to_respond": 0}"#,
            r#"{"op": "request_heartbeat", "queue_id": "bbb", "minutes_to_respond": 1e18}"#,
            r#"{"op": "request_heartbeat", "queue_id": "bbb", "minutes_to_respond": 1441}"#,
            r#"{"op": "heartbeat", "request_ids": []}"#,
            r#"{"op": "add_announcement", "queue_id": "bbb", "message": ""}"#,
            r#"{"op": "override_schedule", "queue_id": "bbb", "schedule_override":
                {"from": "2024-02-12T15:00:00Z", "to": "2024-02-12T14:00:00Z", "type": "open"}}"#,
        ];

        for json in bad {
            let result = parse(json).request.validate();
            assert!(
                matches!(result, Err(QueueError::Validation(_))),
                "accepted {}",
                json
            );
        }
    }

    #[test]
    fn responses_are_tagged() {
        let ok: ServiceResponse<QueueResponse, ErrorBody> =
            ServiceResponse::Ok(QueueResponse::IsStaff { is_staff: true });
        let err: ServiceResponse<QueueResponse, ErrorBody> =
            ServiceResponse::Err(ErrorBody::from(&QueueError::AlreadyQueued));

        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"status": "ok", "data": {"kind": "is_staff", "is_staff": true}})
        );
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"status": "err", "data": {"code": "already_queued", "message": "Already in queue"}})
        );
    }
}
