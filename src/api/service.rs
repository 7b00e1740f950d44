use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::auth::{Authorizer, Context, Requirement};
use super::protocol::{
    ListedEntry, Notification, OrderUpdate, PresenceEvent, PresenceRouter, QueueRequest,
    QueueResponse, QueueServiceRPC, RequestEnvelope, ServiceResponse,
};
use super::registry::{QueueHandle, QueueRegistry};
use super::sync::Synchronizer;
use crate::domain::entity::{Announcement, Entry};
use crate::domain::error::{ErrorBody, QueueError};
use crate::domain::heartbeat::{HeartbeatOutcome, HeartbeatRegistry};
use crate::domain::repository::{
    Broadcaster, CalendarProvider, HelpedRepository, IdentityProvider, SnapshotRepository,
};
use crate::domain::schedule::ScheduleOverride;
use crate::domain::visibility::project;

use Requirement::{Entry as RequiresEntry, Queue, Staff, User, Viewer};

/// Start of the current UTC day; windows and helped records are scoped to it.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(i64::from(now.num_seconds_from_midnight()))
        - Duration::nanoseconds(i64::from(now.nanosecond()))
}

fn heartbeat_deadline(
    now: DateTime<Utc>,
    minutes_to_respond: f64,
) -> Result<(std::time::Duration, DateTime<Utc>), QueueError> {
    let out_of_range = || QueueError::validation("minutes_to_respond is out of range");

    let window = std::time::Duration::try_from_secs_f64(minutes_to_respond * 60.0)
        .map_err(|_| out_of_range())?;
    let deadline = Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .ok_or_else(out_of_range)?;

    Ok((window, deadline))
}

#[derive(Clone)]
pub struct QueueServiceImpl<SR, HR, E, ID, CP>
where
    SR: SnapshotRepository,
    HR: HelpedRepository,
    E: Broadcaster,
    ID: IdentityProvider,
    CP: CalendarProvider,
{
    snapshots: SR,
    helped: HR,
    calendar: CP,
    sync: Synchronizer<E>,
    auth: Authorizer<ID>,
    registry: Arc<QueueRegistry>,
    heartbeats: Arc<Mutex<HeartbeatRegistry>>,
}

impl<SR, HR, E, ID, CP> QueueServiceImpl<SR, HR, E, ID, CP>
where
    SR: SnapshotRepository,
    HR: HelpedRepository,
    E: Broadcaster,
    ID: IdentityProvider,
    CP: CalendarProvider,
{
    pub fn new(
        registry: Arc<QueueRegistry>,
        snapshots: SR,
        helped: HR,
        event: E,
        identity: ID,
        calendar: CP,
    ) -> Self {
        Self {
            snapshots,
            helped,
            calendar,
            sync: Synchronizer::new(event),
            auth: Authorizer::new(identity, registry.clone()),
            registry,
            heartbeats: Arc::new(Mutex::new(HeartbeatRegistry::new())),
        }
    }

    pub async fn dispatch(&self, envelope: RequestEnvelope) -> Result<QueueResponse, QueueError> {
        let RequestEnvelope {
            credential,
            request,
        } = envelope;
        request.validate()?;

        let ctx = Context::new(credential);

        match request {
            QueueRequest::ListQueues => Ok(QueueResponse::Queues {
                queues: self.registry.names().await,
            }),
            QueueRequest::ListEntries { queue_id } => {
                self.list_entries(ctx.for_queue(&queue_id)).await
            }
            QueueRequest::ItemInfo { queue_id, slot_ids } => {
                self.item_info(ctx.for_queue(&queue_id), slot_ids).await
            }
            QueueRequest::RequestUpdate { queue_id } => {
                self.request_update(ctx.for_queue(&queue_id)).await
            }
            QueueRequest::CheckIfStaff { queue_id } => {
                let ctx = self
                    .auth
                    .authorize(ctx.for_queue(&queue_id), &[Queue, Viewer])
                    .await?;
                Ok(QueueResponse::IsStaff {
                    is_staff: ctx.is_staff,
                })
            }
            QueueRequest::Join {
                queue_id,
                help_description,
                location,
                time_requested,
            } => {
                self.join(
                    ctx.for_queue(&queue_id),
                    help_description,
                    location,
                    time_requested,
                )
                .await
            }
            QueueRequest::Leave { queue_id, slot_id } => {
                self.leave(ctx.for_queue(&queue_id).for_slot(&slot_id)).await
            }
            QueueRequest::UpdateSelf {
                queue_id,
                slot_id,
                help_description,
                location,
            } => {
                self.update_self(
                    ctx.for_queue(&queue_id).for_slot(&slot_id),
                    help_description,
                    location,
                )
                .await
            }
            QueueRequest::Help {
                queue_id,
                slot_id,
                is_helped,
            } => {
                self.help(ctx.for_queue(&queue_id).for_slot(&slot_id), is_helped)
                    .await
            }
            QueueRequest::Pin {
                queue_id,
                slot_id,
                in_waiting_room,
            } => {
                self.pin(ctx.for_queue(&queue_id).for_slot(&slot_id), in_waiting_room)
                    .await
            }
            QueueRequest::Helped { queue_id, slot_id } => {
                self.helped(ctx.for_queue(&queue_id).for_slot(&slot_id))
                    .await
            }
            QueueRequest::SendMessage {
                queue_id,
                to_owner_id,
                message,
            } => {
                self.auth
                    .authorize(ctx.for_queue(&queue_id), &[User, Queue, Staff])
                    .await?;
                self.sync
                    .notify(&to_owner_id, Notification::Message { queue_id, message })
                    .await;
                Ok(QueueResponse::Ack)
            }
            QueueRequest::BroadcastMessage { queue_id, message } => {
                self.auth
                    .authorize(ctx.for_queue(&queue_id), &[User, Queue, Staff])
                    .await?;
                self.sync.queue_message(&queue_id, message).await;
                Ok(QueueResponse::Ack)
            }
            QueueRequest::ClearQueue { queue_id } => self.clear_queue(ctx.for_queue(&queue_id)).await,
            QueueRequest::OverrideSchedule {
                queue_id,
                schedule_override,
            } => {
                self.override_schedule(ctx.for_queue(&queue_id), Some(schedule_override))
                    .await
            }
            QueueRequest::ClearOverride { queue_id } => {
                self.override_schedule(ctx.for_queue(&queue_id), None).await
            }
            QueueRequest::SyncCalendar { queue_id } => {
                self.sync_calendar(ctx.for_queue(&queue_id)).await
            }
            QueueRequest::AddAnnouncement {
                queue_id,
                message,
                until,
            } => {
                self.add_announcement(ctx.for_queue(&queue_id), message, until)
                    .await
            }
            QueueRequest::RemoveAnnouncement {
                queue_id,
                announcement_id,
            } => {
                self.remove_announcement(ctx.for_queue(&queue_id), &announcement_id)
                    .await
            }
            QueueRequest::RequestHeartbeat {
                queue_id,
                minutes_to_respond,
            } => {
                self.request_heartbeat(ctx.for_queue(&queue_id), minutes_to_respond)
                    .await
            }
            QueueRequest::Heartbeat { request_ids } => self.heartbeat(ctx, request_ids).await,
        }
    }

    // Reads

    async fn list_entries(&self, ctx: Context) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Viewer]).await?;
        let queue = ctx.queue()?.read().await;

        let entries = queue
            .entries()
            .slots()
            .iter()
            .map(|slot| ListedEntry {
                slot_id: slot.slot_id.clone(),
                has_heartbeat: slot.has_heartbeat,
                entry: project(&slot.entry, ctx.identity.as_ref(), ctx.is_staff),
            })
            .collect();

        Ok(QueueResponse::Entries { entries })
    }

    async fn item_info(
        &self,
        ctx: Context,
        slot_ids: Vec<String>,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Viewer]).await?;
        let queue = ctx.queue()?.read().await;

        let mut items = BTreeMap::new();
        for slot_id in slot_ids {
            let entry = queue
                .entries()
                .find_by_id(&slot_id)
                .ok_or(QueueError::EntryNotFound)?;
            items.insert(slot_id, project(entry, ctx.identity.as_ref(), ctx.is_staff));
        }

        Ok(QueueResponse::ItemInfo { items })
    }

    async fn request_update(&self, ctx: Context) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue]).await?;
        let queue = ctx.queue()?.read().await;

        let update = OrderUpdate::of(&queue, vec![]).with_status(queue.status(Utc::now()));

        Ok(QueueResponse::Update(update))
    }

    // Participant actions

    async fn join(
        &self,
        ctx: Context,
        help_description: String,
        location: String,
        time_requested: Option<f64>,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[User, Queue]).await?;
        let identity = ctx.identity()?.clone();
        let now = Utc::now();

        let helped_today = match self
            .helped
            .helped_since(&identity.owner_id, start_of_day(now))
            .await
        {
            Ok(helped) => helped,
            Err(e) => {
                warn!(owner_id = %identity.owner_id, "Helped lookup failed: {:?}", e);
                false
            }
        };

        let entry = Entry::new(
            identity.owner_id.clone(),
            identity.display_name.clone(),
            help_description,
            location,
            time_requested,
            helped_today,
            now,
        );

        let (slot_id, update) = {
            let mut queue = ctx.queue()?.write().await;

            if !queue.is_open(now) {
                return Err(QueueError::QueueClosed);
            }

            let slot_id = queue.entries_mut().enqueue(entry, now)?;
            (slot_id, OrderUpdate::of(&queue, vec![]))
        };

        info!(queue_id = %update.queue_id, owner_id = %identity.owner_id, slot_id, "Joined queue");

        self.registry
            .joined(&identity.owner_id, &update.queue_id)
            .await;
        self.sync.order_update(update).await;

        Ok(QueueResponse::Joined { slot_id })
    }

    async fn leave(&self, ctx: Context) -> Result<QueueResponse, QueueError> {
        let ctx = self
            .auth
            .authorize(ctx, &[User, Queue, RequiresEntry])
            .await?;
        let owner_id = ctx.identity()?.owner_id.clone();

        if ctx.entry()?.owner_id != owner_id {
            return Err(QueueError::Forbidden);
        }

        let slot_id = ctx.slot_id.clone().unwrap_or_default();
        let update = {
            let mut queue = ctx.queue()?.write().await;
            queue
                .entries_mut()
                .remove(&slot_id)
                .ok_or(QueueError::EntryNotFound)?;

            OrderUpdate::of(&queue, vec![slot_id.clone()])
        };

        info!(queue_id = %update.queue_id, owner_id, slot_id, "Left queue");

        self.registry.left(&owner_id, &update.queue_id).await;
        self.sync.order_update(update).await;

        Ok(QueueResponse::Ack)
    }

    async fn update_self(
        &self,
        ctx: Context,
        help_description: Option<String>,
        location: Option<String>,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self
            .auth
            .authorize(ctx, &[User, Queue, Viewer, RequiresEntry])
            .await?;

        if !ctx.is_staff && ctx.entry()?.owner_id != ctx.identity()?.owner_id {
            return Err(QueueError::Forbidden);
        }

        self.modify_entry(&ctx, |entry| {
            if let Some(help_description) = help_description.filter(|s| !s.trim().is_empty()) {
                entry.help_description = Some(help_description);
            }
            if let Some(location) = location.filter(|s| !s.trim().is_empty()) {
                entry.location = Some(location);
            }
        })
        .await?;

        Ok(QueueResponse::Ack)
    }

    // Staff actions

    async fn help(&self, ctx: Context, is_helped: bool) -> Result<QueueResponse, QueueError> {
        let ctx = self
            .auth
            .authorize(ctx, &[Queue, Staff, RequiresEntry])
            .await?;

        let entry = self
            .modify_entry(&ctx, |entry| entry.being_helped = is_helped)
            .await?;

        self.sync
            .notify(
                &entry.owner_id,
                Notification::BeingHelped {
                    queue_id: ctx.queue_id.clone().unwrap_or_default(),
                    is_helped,
                },
            )
            .await;

        Ok(QueueResponse::Ack)
    }

    /// Pinning is staff-only; an owner may unpin themselves.
    async fn pin(&self, ctx: Context, in_waiting_room: bool) -> Result<QueueResponse, QueueError> {
        let ctx = self
            .auth
            .authorize(ctx, &[User, Queue, Viewer, RequiresEntry])
            .await?;

        let is_owner = ctx.entry()?.owner_id == ctx.identity()?.owner_id;
        if !ctx.is_staff && (in_waiting_room || !is_owner) {
            return Err(QueueError::Forbidden);
        }

        self.modify_entry(&ctx, |entry| entry.in_waiting_room = in_waiting_room)
            .await?;

        Ok(QueueResponse::Ack)
    }

    async fn helped(&self, ctx: Context) -> Result<QueueResponse, QueueError> {
        let ctx = self
            .auth
            .authorize(ctx, &[Queue, Staff, RequiresEntry])
            .await?;

        let slot_id = ctx.slot_id.clone().unwrap_or_default();
        let (entry, update) = {
            let mut queue = ctx.queue()?.write().await;
            let entry = queue
                .entries_mut()
                .remove(&slot_id)
                .ok_or(QueueError::EntryNotFound)?;

            (entry, OrderUpdate::of(&queue, vec![slot_id.clone()]))
        };

        info!(queue_id = %update.queue_id, owner_id = %entry.owner_id, "Helped");

        let helped = self.helped.clone();
        let (owner_id, queue_id) = (entry.owner_id.clone(), update.queue_id.clone());
        tokio::spawn(async move {
            if let Err(e) = helped.record(&owner_id, &queue_id, Utc::now()).await {
                warn!(owner_id, queue_id, "Failed to record helped: {:?}", e);
            }
        });

        self.registry.left(&entry.owner_id, &update.queue_id).await;
        self.sync.order_update(update).await;

        Ok(QueueResponse::Ack)
    }

    async fn clear_queue(&self, ctx: Context) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Staff]).await?;

        let (owners, update) = {
            let mut queue = ctx.queue()?.write().await;
            let owners: Vec<String> = queue
                .entries()
                .slots()
                .iter()
                .map(|slot| slot.entry.owner_id.clone())
                .collect();
            let removed = queue.entries_mut().clear();

            (owners, OrderUpdate::of(&queue, removed))
        };

        info!(queue_id = %update.queue_id, removed = owners.len(), "Cleared queue");

        for owner_id in &owners {
            self.registry.left(owner_id, &update.queue_id).await;
        }
        self.sync.order_update(update).await;

        Ok(QueueResponse::Ack)
    }

    async fn override_schedule(
        &self,
        ctx: Context,
        schedule_override: Option<ScheduleOverride>,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Staff]).await?;

        let update = {
            let mut queue = ctx.queue()?.write().await;
            match schedule_override {
                Some(o) => {
                    info!(queue_id = %queue.id(), kind = ?o.kind, from = %o.from, to = %o.to, "Schedule override set");
                    queue.set_override(o);
                }
                None => {
                    info!(queue_id = %queue.id(), "Schedule override cleared");
                    queue.clear_override();
                }
            }

            OrderUpdate::of(&queue, vec![]).with_status(queue.status(Utc::now()))
        };

        self.sync.order_update(update).await;

        Ok(QueueResponse::Ack)
    }

    async fn sync_calendar(&self, ctx: Context) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Staff]).await?;

        let windows = self
            .calendar
            .busy_windows(start_of_day(Utc::now()))
            .await
            .map_err(|e| {
                warn!("Calendar fetch failed: {:?}", e);
                QueueError::Unavailable("calendar".to_string())
            })?;

        let update = {
            let mut queue = ctx.queue()?.write().await;
            queue.set_windows(&windows);

            OrderUpdate::of(&queue, vec![]).with_status(queue.status(Utc::now()))
        };

        self.sync.order_update(update).await;

        Ok(QueueResponse::Ack)
    }

    async fn add_announcement(
        &self,
        ctx: Context,
        message: String,
        until: Option<DateTime<Utc>>,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Staff]).await?;

        let announcement = Announcement::new(message, until);
        let announcement_id = announcement.id.clone();

        let update = {
            let mut queue = ctx.queue()?.write().await;
            queue.add_announcement(announcement);

            OrderUpdate::of(&queue, vec![]).with_status(queue.status(Utc::now()))
        };

        self.sync.order_update(update).await;

        Ok(QueueResponse::AnnouncementAdded { announcement_id })
    }

    async fn remove_announcement(
        &self,
        ctx: Context,
        announcement_id: &str,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Staff]).await?;

        let update = {
            let mut queue = ctx.queue()?.write().await;
            if !queue.remove_announcement(announcement_id) {
                return Ok(QueueResponse::Ack);
            }

            OrderUpdate::of(&queue, vec![]).with_status(queue.status(Utc::now()))
        };

        self.sync.order_update(update).await;

        Ok(QueueResponse::Ack)
    }

    // Liveness

    async fn request_heartbeat(
        &self,
        ctx: Context,
        minutes_to_respond: f64,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[Queue, Staff]).await?;
        let queue_id = ctx.queue_id.clone().unwrap_or_default();

        // Resolve the deadline before any slot is marked at risk.
        let (window, deadline) = heartbeat_deadline(Utc::now(), minutes_to_respond)?;

        let at_risk: HashSet<String> = {
            let mut queue = ctx.queue()?.write().await;
            let slots: Vec<(String, String)> = queue
                .entries()
                .slots()
                .iter()
                .map(|slot| (slot.slot_id.clone(), slot.entry.owner_id.clone()))
                .collect();

            for (slot_id, _) in &slots {
                queue.entries_mut().set_heartbeat(slot_id, false);
            }

            slots.into_iter().map(|(_, owner_id)| owner_id).collect()
        };

        let at_risk_count = at_risk.len();

        let request = self
            .heartbeats
            .lock()
            .await
            .open(&queue_id, at_risk, deadline);

        info!(queue_id, request_id = %request.request_id, at_risk = at_risk_count, %deadline, "Heartbeat requested");

        for owner_id in &request.at_risk {
            self.sync
                .notify(
                    owner_id,
                    Notification::HeartbeatRequested {
                        queue_id: queue_id.clone(),
                        request_id: request.request_id.clone(),
                        deadline,
                    },
                )
                .await;
        }

        let service = self.clone();
        let request_id = request.request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            service.expire_heartbeat(&request_id).await;
        });

        Ok(QueueResponse::HeartbeatRequested {
            request_id: request.request_id,
            deadline,
            at_risk: at_risk_count,
        })
    }

    async fn heartbeat(
        &self,
        ctx: Context,
        request_ids: Vec<String>,
    ) -> Result<QueueResponse, QueueError> {
        let ctx = self.auth.authorize(ctx, &[User]).await?;
        let owner_id = ctx.identity()?.owner_id.clone();

        let answered: HashSet<String> = {
            let mut heartbeats = self.heartbeats.lock().await;
            request_ids
                .iter()
                .filter_map(|request_id| heartbeats.respond(&owner_id, request_id))
                .collect()
        };

        debug!(owner_id, answered = answered.len(), "Heartbeat");

        for queue_id in answered {
            let handle = match self.registry.get(&queue_id) {
                Some(handle) => handle,
                None => continue,
            };

            let slot_id = {
                let mut queue = handle.write().await;
                let slot_id = match queue.entries().find_by_owner(&owner_id) {
                    Some(slot) => slot.slot_id.clone(),
                    None => continue,
                };
                queue.entries_mut().set_heartbeat(&slot_id, true);
                slot_id
            };

            self.sync.content_update(&queue_id, vec![slot_id]).await;
        }

        Ok(QueueResponse::Ack)
    }

    /// Deadline callback. Safe to call for requests that are unknown or
    /// already finalized.
    pub async fn expire_heartbeat(&self, request_id: &str) {
        let outcome = self.heartbeats.lock().await.finalize(request_id);

        let (queue_id, unresponsive) = match outcome {
            None => {
                debug!(request_id, "Heartbeat already finalized");
                return;
            }
            Some(HeartbeatOutcome::Resolved { queue_id }) => {
                info!(queue_id, request_id, "Heartbeat resolved");
                return;
            }
            Some(HeartbeatOutcome::Expired {
                queue_id,
                unresponsive,
            }) => (queue_id, unresponsive),
        };

        let handle = match self.registry.get(&queue_id) {
            Some(handle) => handle,
            None => return,
        };

        let (removed, update) = {
            let mut queue = handle.write().await;
            let removed = queue
                .entries_mut()
                .remove_matching(|entry| unresponsive.contains(&entry.owner_id));
            let ids = removed.iter().map(|slot| slot.slot_id.clone()).collect();

            (removed, OrderUpdate::of(&queue, ids))
        };

        info!(queue_id, request_id, evicted = removed.len(), "Heartbeat expired");

        for slot in &removed {
            self.registry.left(&slot.entry.owner_id, &queue_id).await;
        }
        self.sync.order_update(update).await;
    }

    // Presence

    async fn set_online(&self, owner_id: &str, is_online: bool) {
        for queue_id in self.registry.queues_of(owner_id).await {
            let handle = match self.registry.get(&queue_id) {
                Some(handle) => handle,
                None => continue,
            };

            let slot_id = {
                let mut queue = handle.write().await;
                let slot = match queue.entries().find_by_owner(owner_id) {
                    Some(slot) => slot.clone(),
                    None => continue,
                };

                let mut entry = slot.entry;
                entry.is_online = is_online;
                if queue
                    .entries_mut()
                    .update(&slot.slot_id, entry, Utc::now())
                    .is_err()
                {
                    continue;
                }
                slot.slot_id
            };

            self.sync.content_update(&queue_id, vec![slot_id]).await;
        }
    }

    async fn resend_heartbeats(&self, owner_id: &str) {
        let pending: Vec<Notification> = self
            .heartbeats
            .lock()
            .await
            .outstanding_for(owner_id)
            .into_iter()
            .map(|request| Notification::HeartbeatRequested {
                queue_id: request.queue_id.clone(),
                request_id: request.request_id.clone(),
                deadline: request.expiration,
            })
            .collect();

        for notification in pending {
            self.sync.notify(owner_id, notification).await;
        }
    }

    /// Applies `change` to the entry behind the context's slot, re-sorts and
    /// tells observers. Order update only if positions actually moved.
    async fn modify_entry<F>(&self, ctx: &Context, change: F) -> Result<Entry, QueueError>
    where
        F: FnOnce(&mut Entry),
    {
        let slot_id = ctx
            .slot_id
            .clone()
            .ok_or_else(|| QueueError::validation("slot_id is required"))?;
        let handle: &QueueHandle = ctx.queue()?;

        let (entry, moved) = {
            let mut queue = handle.write().await;
            let mut entry = queue
                .entries()
                .find_by_id(&slot_id)
                .cloned()
                .ok_or(QueueError::EntryNotFound)?;
            change(&mut entry);

            let before = queue.entries().snapshot_index();
            queue
                .entries_mut()
                .update(&slot_id, entry.clone(), Utc::now())?;

            let update = OrderUpdate::of(&queue, vec![]);
            let moved = (update.updated_index != before).then(|| update);
            (entry, moved)
        };

        let queue_id = ctx.queue_id.clone().unwrap_or_default();
        if let Some(update) = moved {
            self.sync.order_update(update).await;
        }
        self.sync.content_update(&queue_id, vec![slot_id]).await;

        Ok(entry)
    }

    // Timers

    pub async fn restore_all(&self) {
        let now = Utc::now();

        for (queue_id, handle) in self.registry.handles() {
            let snapshot = match self.snapshots.load(queue_id).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    debug!(queue_id = %queue_id, "No snapshot");
                    continue;
                }
                Err(e) => {
                    warn!(queue_id = %queue_id, "Failed to load snapshot: {:?}", e);
                    continue;
                }
            };

            let owners: Vec<String> = {
                let mut queue = handle.write().await;
                let dropped = queue.restore(snapshot, now);
                if dropped > 0 {
                    warn!(queue_id = %queue_id, dropped, "Dropped duplicate entries from snapshot");
                }
                queue
                    .entries()
                    .slots()
                    .iter()
                    .map(|slot| slot.entry.owner_id.clone())
                    .collect()
            };

            info!(queue_id = %queue_id, entries = owners.len(), "Restored queue");

            for owner_id in &owners {
                self.registry.joined(owner_id, queue_id).await;
            }
        }
    }

    /// Saves one queue if it changed. A failed save re-marks the queue so the
    /// next tick tries again with whatever state is current then.
    pub async fn save_queue(&self, queue_id: &str) -> Result<bool, QueueError> {
        let handle = self
            .registry
            .get(queue_id)
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))?;

        let snapshot = match handle.write().await.take_snapshot() {
            Some(snapshot) => snapshot,
            None => return Ok(false),
        };

        if let Err(e) = self.snapshots.save(queue_id, &snapshot).await {
            handle.write().await.mark_changed();
            return Err(QueueError::Persistence(format!("{:#}", e)));
        }

        info!(queue_id, entries = snapshot.slots.len(), "Saved queue state");

        Ok(true)
    }

    pub async fn save_changed(&self) {
        let queue_ids: Vec<String> = self.registry.handles().map(|(id, _)| id.clone()).collect();

        for queue_id in queue_ids {
            if let Err(e) = self.save_queue(&queue_id).await {
                error!(queue_id, "{}", e);
            }
        }
    }

    pub async fn refresh_calendar(&self) {
        let now = Utc::now();

        let windows = match self.calendar.busy_windows(start_of_day(now)).await {
            Ok(windows) => windows,
            Err(e) => {
                warn!("Calendar refresh failed: {:?}", e);
                return;
            }
        };

        debug!(windows = windows.len(), "Calendar refreshed");

        for (_, handle) in self.registry.handles() {
            let update = {
                let mut queue = handle.write().await;
                queue.set_windows(&windows);

                OrderUpdate::of(&queue, vec![]).with_status(queue.status(now))
            };

            self.sync.order_update(update).await;
        }
    }
}

#[async_trait::async_trait]
impl<SR, HR, E, ID, CP> QueueServiceRPC for QueueServiceImpl<SR, HR, E, ID, CP>
where
    SR: SnapshotRepository,
    HR: HelpedRepository,
    E: Broadcaster,
    ID: IdentityProvider,
    CP: CalendarProvider,
{
    async fn handle(&self, envelope: RequestEnvelope) -> ServiceResponse<QueueResponse, ErrorBody> {
        debug!("Request: {:?}", envelope.request);

        match self.dispatch(envelope).await {
            Ok(response) => ServiceResponse::Ok(response),
            Err(e) => {
                warn!(code = e.code(), "Request rejected: {}", e);
                ServiceResponse::Err(ErrorBody::from(&e))
            }
        }
    }
}

#[async_trait::async_trait]
impl<SR, HR, E, ID, CP> PresenceRouter for QueueServiceImpl<SR, HR, E, ID, CP>
where
    SR: SnapshotRepository,
    HR: HelpedRepository,
    E: Broadcaster,
    ID: IdentityProvider,
    CP: CalendarProvider,
{
    async fn route(&self, event: PresenceEvent) -> Result<()> {
        info!("Presence: {:?}", event);

        match event {
            PresenceEvent::Connected { owner_id } => {
                self.set_online(&owner_id, true).await;
                self.resend_heartbeats(&owner_id).await;
            }
            PresenceEvent::Disconnected { owner_id } => {
                self.set_online(&owner_id, false).await;
            }
        }

        Ok(())
    }
}
