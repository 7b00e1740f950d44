use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entity::Identity;
use super::queue::Snapshot;
use super::schedule::CalendarWindow;

#[async_trait::async_trait]
pub trait SnapshotRepository: Clone + Send + Sync + 'static {
    async fn load(&self, queue_id: &str) -> Result<Option<Snapshot>>;

    async fn save(&self, queue_id: &str, snapshot: &Snapshot) -> Result<()>;
}

#[async_trait::async_trait]
pub trait HelpedRepository: Clone + Send + Sync + 'static {
    async fn record(&self, owner_id: &str, queue_id: &str, helped_at: DateTime<Utc>) -> Result<()>;

    async fn helped_since(&self, owner_id: &str, since: DateTime<Utc>) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait IdentityProvider: Clone + Send + Sync + 'static {
    /// `Ok(None)` means the credential is not valid.
    async fn verify(&self, credential: &str) -> Result<Option<Identity>>;
}

#[async_trait::async_trait]
pub trait CalendarProvider: Clone + Send + Sync + 'static {
    async fn busy_windows(&self, since: DateTime<Utc>) -> Result<Vec<CalendarWindow>>;
}

/// Where broadcasts and direct notifications go out.
#[async_trait::async_trait]
pub trait Broadcaster: Clone + Send + Sync + 'static {
    async fn publish<T: Serialize + Sync>(&self, topic: &str, payload: &T) -> Result<()>;

    async fn send_to_identity<T: Serialize + Sync>(&self, owner_id: &str, payload: &T) -> Result<()>;
}
