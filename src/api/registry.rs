use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::domain::ordering::PriorityPolicy;
use crate::domain::queue::{HelpQueue, QueueDefinition};

/// Shared handle to one queue. Writers are serialized by the lock; readers
/// see a consistent point-in-time state.
pub type QueueHandle = Arc<RwLock<HelpQueue>>;

/// The hosted queues plus the `owner_id -> queue ids` membership index.
///
/// Lock order: a queue lock may be held while touching `memberships`, never
/// the other way round.
pub struct QueueRegistry {
    queues: BTreeMap<String, QueueHandle>,
    memberships: Mutex<HashMap<String, HashSet<String>>>,
}

impl QueueRegistry {
    pub fn new(definitions: Vec<QueueDefinition>, policy: PriorityPolicy) -> Self {
        let queues = definitions
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(RwLock::new(HelpQueue::new(d, policy)))))
            .collect();

        Self {
            queues,
            memberships: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, queue_id: &str) -> Option<QueueHandle> {
        self.queues.get(queue_id).cloned()
    }

    pub fn handles(&self) -> impl Iterator<Item = (&String, &QueueHandle)> {
        self.queues.iter()
    }

    pub async fn names(&self) -> BTreeMap<String, String> {
        let mut names = BTreeMap::new();
        for (id, handle) in &self.queues {
            names.insert(id.clone(), handle.read().await.name().to_string());
        }
        names
    }

    pub async fn joined(&self, owner_id: &str, queue_id: &str) {
        self.memberships
            .lock()
            .await
            .entry(owner_id.to_string())
            .or_default()
            .insert(queue_id.to_string());
    }

    pub async fn left(&self, owner_id: &str, queue_id: &str) {
        let mut memberships = self.memberships.lock().await;

        if let Some(queues) = memberships.get_mut(owner_id) {
            queues.remove(queue_id);
            if queues.is_empty() {
                memberships.remove(owner_id);
            }
        }
    }

    pub async fn queues_of(&self, owner_id: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .memberships
            .lock()
            .await
            .get(owner_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        queues.sort();
        queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, name: &str) -> QueueDefinition {
        QueueDefinition {
            id: id.to_string(),
            name: name.to_string(),
            calendar: Default::default(),
            staff: vec![],
        }
    }

    #[tokio::test]
    async fn membership_index_tracks_joins_and_leaves() {
        let registry = QueueRegistry::new(
            vec![definition("bbb", "BBB"), definition("ugli", "UGLI")],
            PriorityPolicy::default(),
        );

        registry.joined("alice", "ugli").await;
        registry.joined("alice", "bbb").await;
        assert_eq!(registry.queues_of("alice").await, vec!["bbb", "ugli"]);

        registry.left("alice", "bbb").await;
        registry.left("alice", "ugli").await;
        registry.left("alice", "ugli").await;
        assert!(registry.queues_of("alice").await.is_empty());
    }

    #[tokio::test]
    async fn names_and_lookup() {
        let registry = QueueRegistry::new(vec![definition("bbb", "BBB Office Hours")], PriorityPolicy::default());

        assert!(registry.get("bbb").is_some());
        assert!(registry.get("nope").is_none());
        assert_eq!(
            registry.names().await.get("bbb").map(String::as_str),
            Some("BBB Office Hours")
        );
    }
}
