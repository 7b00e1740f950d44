use anyhow::{anyhow, Result};
use async_nats::{Client, Message};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::protocol::{
    PresenceEvent, PresenceRouter, QueueServiceRPC, RequestEnvelope, ServiceResponse,
};
use crate::api::sync::identity_topic;
use crate::domain::entity::Identity;
use crate::domain::error::{ErrorBody, QueueError};
use crate::domain::repository::{Broadcaster, CalendarProvider, IdentityProvider};
use crate::domain::schedule::CalendarWindow;

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

#[derive(Clone, Debug)]
pub struct NATSBroadcaster {
    client: Client,
}

impl NATSBroadcaster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Broadcaster for NATSBroadcaster {
    async fn publish<T: Serialize + Sync>(&self, topic: &str, payload: &T) -> Result<()> {
        let bytes = encode(payload)?;

        self.client
            .publish(topic.to_string(), bytes)
            .await
            .map_err(|e| anyhow!("publish to {}: {}", topic, e))
    }

    async fn send_to_identity<T: Serialize + Sync>(&self, owner_id: &str, payload: &T) -> Result<()> {
        self.publish(&identity_topic(owner_id), payload).await
    }
}

/// Asks the identity service to verify a credential. The reply is the
/// identity as JSON, or `null` if the credential is invalid.
#[derive(Clone, Debug)]
pub struct NATSIdentityProvider {
    client: Client,
    subject: String,
}

impl NATSIdentityProvider {
    pub fn new(client: Client, subject: String) -> Self {
        Self { client, subject }
    }
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    credential: &'a str,
}

#[async_trait::async_trait]
impl IdentityProvider for NATSIdentityProvider {
    async fn verify(&self, credential: &str) -> Result<Option<Identity>> {
        let reply = self
            .client
            .request(self.subject.clone(), encode(&VerifyRequest { credential })?)
            .await
            .map_err(|e| anyhow!("request to {}: {}", self.subject, e))?;

        Ok(serde_json::from_slice(&reply.payload)?)
    }
}

#[derive(Clone, Debug)]
pub struct NATSCalendarProvider {
    client: Client,
    subject: String,
}

impl NATSCalendarProvider {
    pub fn new(client: Client, subject: String) -> Self {
        Self { client, subject }
    }
}

#[derive(Serialize)]
struct BusyWindowsRequest {
    since: DateTime<Utc>,
}

#[async_trait::async_trait]
impl CalendarProvider for NATSCalendarProvider {
    async fn busy_windows(&self, since: DateTime<Utc>) -> Result<Vec<CalendarWindow>> {
        let reply = self
            .client
            .request(self.subject.clone(), encode(&BusyWindowsRequest { since })?)
            .await
            .map_err(|e| anyhow!("request to {}: {}", self.subject, e))?;

        Ok(serde_json::from_slice(&reply.payload)?)
    }
}

/// Request/reply listener for client operations.
#[derive(Clone, Debug)]
pub struct NATSRPC {
    client: Client,
    subject: String,
}

impl NATSRPC {
    pub fn new(client: Client, subject: String) -> Self {
        Self { client, subject }
    }

    pub async fn listen<S: QueueServiceRPC>(&self, service: S) -> Result<()> {
        let mut requests = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| anyhow!("subscribe to {}: {}", self.subject, e))?;

        info!(subject = %self.subject, "Listening for requests");

        while let Some(message) = requests.next().await {
            let client = self.client.clone();
            let service = service.clone();

            // Queues serialize their own writers, so requests run concurrently.
            tokio::spawn(async move {
                if let Err(e) = respond(client, service, message).await {
                    warn!("Failed to reply: {:?}", e);
                }
            });
        }

        Ok(())
    }
}

async fn respond<S: QueueServiceRPC>(client: Client, service: S, message: Message) -> Result<()> {
    let reply = match message.reply {
        Some(reply) => reply,
        None => {
            debug!(subject = %message.subject, "Dropping request without reply subject");
            return Ok(());
        }
    };

    let response = match serde_json::from_slice::<RequestEnvelope>(&message.payload) {
        Ok(envelope) => service.handle(envelope).await,
        Err(e) => ServiceResponse::Err(ErrorBody::from(&QueueError::validation(e.to_string()))),
    };

    client
        .publish(reply.clone(), encode(&response)?)
        .await
        .map_err(|e| anyhow!("reply to {}: {}", reply, e))
}

/// Connect/disconnect notices from the gateway, handled in arrival order.
#[derive(Clone, Debug)]
pub struct NATSPresence {
    client: Client,
    subject: String,
}

impl NATSPresence {
    pub fn new(client: Client, subject: String) -> Self {
        Self { client, subject }
    }

    pub async fn listen<R: PresenceRouter>(&self, router: R) -> Result<()> {
        let mut events = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| anyhow!("subscribe to {}: {}", self.subject, e))?;

        info!(subject = %self.subject, "Listening for presence events");

        while let Some(message) = events.next().await {
            let event: PresenceEvent = match serde_json::from_slice(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Malformed presence event: {}", e);
                    continue;
                }
            };

            if let Err(e) = router.route(event).await {
                warn!("Presence event failed: {:?}", e);
            }
        }

        Ok(())
    }
}
