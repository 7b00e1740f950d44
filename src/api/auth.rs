use std::sync::Arc;

use tracing::warn;

use super::registry::{QueueHandle, QueueRegistry};
use crate::domain::entity::{Entry, Identity};
use crate::domain::error::QueueError;
use crate::domain::repository::IdentityProvider;

/// One prerequisite of an operation. A chain of these is checked left to
/// right and stops at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Caller must present a valid credential.
    User,
    /// Caller must be global staff, or on the roster of an already resolved queue.
    Staff,
    /// `queue_id` must name a hosted queue.
    Queue,
    /// `slot_id` must name an entry in the resolved queue.
    Entry,
    /// Resolve the caller if possible and work out whether they are staff.
    /// Never fails.
    Viewer,
}

/// Accumulated request context, enriched by each passing check.
#[derive(Clone, Default)]
pub struct Context {
    pub credential: Option<String>,
    pub queue_id: Option<String>,
    pub slot_id: Option<String>,

    pub identity: Option<Identity>,
    pub is_staff: bool,
    pub queue: Option<QueueHandle>,
    pub entry: Option<Entry>,
}

impl Context {
    pub fn new(credential: Option<String>) -> Self {
        Self {
            credential,
            ..Default::default()
        }
    }

    pub fn for_queue(mut self, queue_id: &str) -> Self {
        self.queue_id = Some(queue_id.to_string());
        self
    }

    pub fn for_slot(mut self, slot_id: &str) -> Self {
        self.slot_id = Some(slot_id.to_string());
        self
    }

    pub fn identity(&self) -> Result<&Identity, QueueError> {
        self.identity.as_ref().ok_or(QueueError::Unauthenticated)
    }

    pub fn queue(&self) -> Result<&QueueHandle, QueueError> {
        self.queue
            .as_ref()
            .ok_or_else(|| QueueError::validation("queue_id is required"))
    }

    pub fn entry(&self) -> Result<&Entry, QueueError> {
        self.entry.as_ref().ok_or(QueueError::EntryNotFound)
    }
}

#[derive(Clone)]
pub struct Authorizer<ID>
where
    ID: IdentityProvider,
{
    identity: ID,
    registry: Arc<QueueRegistry>,
}

impl<ID> Authorizer<ID>
where
    ID: IdentityProvider,
{
    pub fn new(identity: ID, registry: Arc<QueueRegistry>) -> Self {
        Self { identity, registry }
    }

    pub async fn authorize(
        &self,
        mut ctx: Context,
        chain: &[Requirement],
    ) -> Result<Context, QueueError> {
        for requirement in chain {
            ctx = match requirement {
                Requirement::User => self.requires_user(ctx).await?,
                Requirement::Staff => self.requires_staff(ctx).await?,
                Requirement::Queue => self.requires_queue(ctx)?,
                Requirement::Entry => self.requires_entry(ctx).await?,
                Requirement::Viewer => self.resolve_viewer(ctx).await,
            };
        }

        Ok(ctx)
    }

    async fn requires_user(&self, mut ctx: Context) -> Result<Context, QueueError> {
        if ctx.identity.is_some() {
            return Ok(ctx);
        }

        let credential = ctx
            .credential
            .as_deref()
            .ok_or(QueueError::Unauthenticated)?;

        match self.identity.verify(credential).await {
            Ok(Some(identity)) => {
                ctx.identity = Some(identity);
                Ok(ctx)
            }
            Ok(None) => Err(QueueError::Unauthenticated),
            Err(e) => {
                warn!("Identity provider failed: {:?}", e);
                Err(QueueError::Unauthenticated)
            }
        }
    }

    async fn requires_staff(&self, ctx: Context) -> Result<Context, QueueError> {
        let mut ctx = self.requires_user(ctx).await?;

        if !is_staff(&ctx).await {
            return Err(QueueError::NotStaff);
        }

        ctx.is_staff = true;
        Ok(ctx)
    }

    fn requires_queue(&self, mut ctx: Context) -> Result<Context, QueueError> {
        let queue_id = ctx
            .queue_id
            .as_deref()
            .ok_or_else(|| QueueError::validation("queue_id is required"))?;

        let queue = self
            .registry
            .get(queue_id)
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))?;

        ctx.queue = Some(queue);
        Ok(ctx)
    }

    async fn requires_entry(&self, mut ctx: Context) -> Result<Context, QueueError> {
        let slot_id = ctx
            .slot_id
            .as_deref()
            .ok_or_else(|| QueueError::validation("slot_id is required"))?;

        let entry = ctx
            .queue()?
            .read()
            .await
            .entries()
            .find_by_id(slot_id)
            .cloned()
            .ok_or(QueueError::EntryNotFound)?;

        ctx.entry = Some(entry);
        Ok(ctx)
    }

    async fn resolve_viewer(&self, ctx: Context) -> Context {
        let mut ctx = match self.requires_user(ctx.clone()).await {
            Ok(ctx) => ctx,
            Err(_) => ctx,
        };

        ctx.is_staff = is_staff(&ctx).await;
        ctx
    }
}

async fn is_staff(ctx: &Context) -> bool {
    let identity = match &ctx.identity {
        Some(identity) => identity,
        None => return false,
    };

    if identity.is_staff {
        return true;
    }

    match &ctx.queue {
        Some(queue) => queue.read().await.is_user_staff(&identity.owner_id),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ordering::PriorityPolicy;
    use crate::domain::queue::QueueDefinition;
    use crate::infrastructure::memory::StaticIdentityProvider;
    use chrono::Utc;

    fn setup() -> Authorizer<StaticIdentityProvider> {
        let registry = Arc::new(QueueRegistry::new(
            vec![QueueDefinition {
                id: "bbb".to_string(),
                name: "BBB".to_string(),
                calendar: Default::default(),
                staff: vec!["rosterta".to_string()],
            }],
            PriorityPolicy::default(),
        ));

        let identity = StaticIdentityProvider::default()
            .with("student-token", "alice", false)
            .with("staff-token", "prof", true)
            .with("roster-token", "rosterta", false);

        Authorizer::new(identity, registry)
    }

    #[tokio::test]
    async fn staff_check_short_circuits_before_queue_lookup() {
        let auth = setup();
        let ctx = Context::new(Some("student-token".to_string())).for_queue("does-not-exist");

        let result = auth
            .authorize(ctx, &[Requirement::Staff, Requirement::Queue])
            .await;

        // A queue lookup would have failed with QueueNotFound.
        assert_eq!(result.err(), Some(QueueError::NotStaff));
    }

    #[tokio::test]
    async fn queue_then_staff_accepts_roster_members() {
        let auth = setup();
        let ctx = Context::new(Some("roster-token".to_string())).for_queue("bbb");

        let ctx = auth
            .authorize(ctx, &[Requirement::Queue, Requirement::Staff])
            .await
            .unwrap();

        assert!(ctx.is_staff);
        assert_eq!(ctx.identity().unwrap().owner_id, "rosterta");
        assert!(ctx.queue.is_some());
    }

    #[tokio::test]
    async fn missing_or_bad_credentials_are_unauthenticated() {
        let auth = setup();

        for credential in [None, Some("forged".to_string())] {
            let result = auth
                .authorize(Context::new(credential), &[Requirement::User])
                .await;
            assert_eq!(result.err(), Some(QueueError::Unauthenticated));
        }
    }

    #[tokio::test]
    async fn entry_requires_a_live_slot() {
        let auth = setup();
        let queue = auth.registry.get("bbb").unwrap();
        let slot_id = queue
            .write()
            .await
            .entries_mut()
            .enqueue(
                Entry::new(
                    "alice".to_string(),
                    "Alice".to_string(),
                    "help".to_string(),
                    "here".to_string(),
                    None,
                    false,
                    Utc::now(),
                ),
                Utc::now(),
            )
            .unwrap();

        let ctx = auth
            .authorize(
                Context::new(None).for_queue("bbb").for_slot(&slot_id),
                &[Requirement::Queue, Requirement::Entry],
            )
            .await
            .unwrap();
        assert_eq!(ctx.entry().unwrap().owner_id, "alice");

        let missing = auth
            .authorize(
                Context::new(None).for_queue("bbb").for_slot("gone"),
                &[Requirement::Queue, Requirement::Entry],
            )
            .await;
        assert_eq!(missing.err(), Some(QueueError::EntryNotFound));
    }

    #[tokio::test]
    async fn viewer_never_fails() {
        let auth = setup();

        let anonymous = auth
            .authorize(Context::new(None).for_queue("bbb"), &[Requirement::Queue, Requirement::Viewer])
            .await
            .unwrap();
        assert!(anonymous.identity.is_none());
        assert!(!anonymous.is_staff);

        let staff = auth
            .authorize(
                Context::new(Some("staff-token".to_string())).for_queue("bbb"),
                &[Requirement::Queue, Requirement::Viewer],
            )
            .await
            .unwrap();
        assert!(staff.is_staff);
    }
}
