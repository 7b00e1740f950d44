//! In-process collaborators used by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::entity::Identity;
use crate::domain::queue::Snapshot;
use crate::domain::repository::{
    Broadcaster, CalendarProvider, HelpedRepository, IdentityProvider, SnapshotRepository,
};
use crate::domain::schedule::CalendarWindow;

#[derive(Clone, Default)]
pub struct MemorySnapshotRepository {
    saved: Arc<Mutex<HashMap<String, Snapshot>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemorySnapshotRepository {
    pub fn with(self, queue_id: &str, snapshot: Snapshot) -> Self {
        self.saved
            .lock()
            .unwrap()
            .insert(queue_id.to_string(), snapshot);
        self
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn saved(&self, queue_id: &str) -> Option<Snapshot> {
        self.saved.lock().unwrap().get(queue_id).cloned()
    }
}

#[async_trait::async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn load(&self, queue_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.saved(queue_id))
    }

    async fn save(&self, queue_id: &str, snapshot: &Snapshot) -> Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("store unavailable"));
        }

        self.saved
            .lock()
            .unwrap()
            .insert(queue_id.to_string(), snapshot.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryHelpedRepository {
    records: Arc<Mutex<Vec<(String, String, DateTime<Utc>)>>>,
}

impl MemoryHelpedRepository {
    pub fn records(&self) -> Vec<(String, String, DateTime<Utc>)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HelpedRepository for MemoryHelpedRepository {
    async fn record(&self, owner_id: &str, queue_id: &str, helped_at: DateTime<Utc>) -> Result<()> {
        self.records.lock().unwrap().push((
            owner_id.to_string(),
            queue_id.to_string(),
            helped_at,
        ));
        Ok(())
    }

    async fn helped_since(&self, owner_id: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .any(|(owner, _, at)| owner == owner_id && *at >= since))
    }
}

#[derive(Clone, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    pub fn with(mut self, token: &str, owner_id: &str, is_staff: bool) -> Self {
        self.tokens.insert(
            token.to_string(),
            Identity {
                owner_id: owner_id.to_string(),
                display_name: owner_id.to_string(),
                is_staff,
            },
        );
        self
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, credential: &str) -> Result<Option<Identity>> {
        Ok(self.tokens.get(credential).cloned())
    }
}

#[derive(Clone, Default)]
pub struct StaticCalendar {
    windows: Arc<Mutex<Option<Vec<CalendarWindow>>>>,
}

impl StaticCalendar {
    /// `None` makes every fetch fail.
    pub fn set(&self, windows: Option<Vec<CalendarWindow>>) {
        *self.windows.lock().unwrap() = windows;
    }
}

#[async_trait::async_trait]
impl CalendarProvider for StaticCalendar {
    async fn busy_windows(&self, _since: DateTime<Utc>) -> Result<Vec<CalendarWindow>> {
        self.windows
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("calendar unreachable"))
    }
}

#[derive(Clone, Default)]
pub struct RecordingBroadcaster {
    published: Arc<Mutex<Vec<(String, Value)>>>,
    sent: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingBroadcaster {
    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn sent_to(&self, owner_id: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| o == owner_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn publish<T: Serialize + Sync>(&self, topic: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), value));
        Ok(())
    }

    async fn send_to_identity<T: Serialize + Sync>(&self, owner_id: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.sent.lock().unwrap().push((owner_id.to_string(), value));
        Ok(())
    }
}
