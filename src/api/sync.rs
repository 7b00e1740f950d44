use tracing::{debug, warn};

use super::protocol::{ContentUpdate, Notification, OrderUpdate, QueueBroadcast};
use crate::domain::repository::Broadcaster;

pub fn queue_topic(queue_id: &str) -> String {
    format!("queue.{}", queue_id)
}

pub fn identity_topic(owner_id: &str) -> String {
    format!("user.{}", owner_id)
}

/// Keeps observers in step with queue state. Delivery is best effort: a
/// failed publish is logged and the observer catches up on the next update
/// or an explicit `request_update`.
#[derive(Clone, Debug)]
pub struct Synchronizer<E>
where
    E: Broadcaster,
{
    event: E,
}

impl<E> Synchronizer<E>
where
    E: Broadcaster,
{
    pub fn new(event: E) -> Self {
        Self { event }
    }

    pub async fn order_update(&self, update: OrderUpdate) {
        let topic = queue_topic(&update.queue_id);
        debug!(
            topic,
            entries = update.updated_index.len(),
            removed = update.removable_slot_ids.len(),
            "Order update"
        );

        self.publish(&topic, &QueueBroadcast::OrderUpdate(update))
            .await;
    }

    pub async fn content_update(&self, queue_id: &str, updated_slot_ids: Vec<String>) {
        if updated_slot_ids.is_empty() {
            return;
        }

        let update = ContentUpdate {
            queue_id: queue_id.to_string(),
            updated_slot_ids,
        };

        self.publish(&queue_topic(queue_id), &QueueBroadcast::ContentUpdate(update))
            .await;
    }

    pub async fn queue_message(&self, queue_id: &str, message: String) {
        let payload = QueueBroadcast::Message {
            queue_id: queue_id.to_string(),
            message,
        };

        self.publish(&queue_topic(queue_id), &payload).await;
    }

    pub async fn notify(&self, owner_id: &str, notification: Notification) {
        if let Err(e) = self.event.send_to_identity(owner_id, &notification).await {
            warn!(owner_id, "Failed to notify: {:?}", e);
        }
    }

    async fn publish(&self, topic: &str, payload: &QueueBroadcast) {
        if let Err(e) = self.event.publish(topic, payload).await {
            warn!(topic, "Failed to publish: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::RecordingBroadcaster;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn order_update_goes_to_queue_topic() {
        let recorder = RecordingBroadcaster::default();
        let sync = Synchronizer::new(recorder.clone());

        sync.order_update(OrderUpdate {
            queue_id: "bbb".to_string(),
            updated_index: BTreeMap::from([("s1".to_string(), 0)]),
            removable_slot_ids: vec!["s0".to_string()],
            status: None,
        })
        .await;

        let published = recorder.published_to("queue.bbb");
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0],
            serde_json::json!({
                "event": "order_update",
                "queue_id": "bbb",
                "updated_index": {"s1": 0},
                "removable_slot_ids": ["s0"]
            })
        );
    }

    #[tokio::test]
    async fn empty_content_update_is_not_sent() {
        let recorder = RecordingBroadcaster::default();
        let sync = Synchronizer::new(recorder.clone());

        sync.content_update("bbb", vec![]).await;
        sync.content_update("bbb", vec!["s1".to_string()]).await;

        let published = recorder.published_to("queue.bbb");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["updated_slot_ids"], serde_json::json!(["s1"]));
    }

    #[tokio::test]
    async fn notifications_go_to_the_identity_channel() {
        let recorder = RecordingBroadcaster::default();
        let sync = Synchronizer::new(recorder.clone());

        sync.notify(
            "alice",
            Notification::BeingHelped {
                queue_id: "bbb".to_string(),
                is_helped: true,
            },
        )
        .await;

        assert!(recorder.published_to("queue.bbb").is_empty());
        let sent = recorder.sent_to("alice");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["event"], "being_helped");
    }
}
