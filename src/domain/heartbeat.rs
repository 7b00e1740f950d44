use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entity::random_id;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatRequest {
    pub request_id: String,
    pub queue_id: String,
    pub at_risk: HashSet<String>,
    pub expiration: DateTime<Utc>,
}

impl HeartbeatRequest {
    pub fn is_resolved(&self) -> bool {
        self.at_risk.is_empty()
    }
}

/// Final state of a request once its deadline has fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Everyone answered before the deadline.
    Resolved { queue_id: String },
    /// These owners never answered and are to be evicted.
    Expired {
        queue_id: String,
        unresponsive: HashSet<String>,
    },
}

/// Pending liveness checks, plus the reverse index of which requests each
/// owner still has to answer.
#[derive(Debug, Default)]
pub struct HeartbeatRegistry {
    pending: HashMap<String, HeartbeatRequest>,
    outstanding: HashMap<String, HashSet<String>>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        queue_id: &str,
        at_risk: HashSet<String>,
        expiration: DateTime<Utc>,
    ) -> HeartbeatRequest {
        let request = HeartbeatRequest {
            request_id: random_id(),
            queue_id: queue_id.to_string(),
            at_risk,
            expiration,
        };

        for owner_id in &request.at_risk {
            self.outstanding
                .entry(owner_id.clone())
                .or_default()
                .insert(request.request_id.clone());
        }
        self.pending
            .insert(request.request_id.clone(), request.clone());

        request
    }

    /// Records that `owner_id` answered `request_id`. Returns the request's
    /// queue when the owner was actually at risk in it.
    pub fn respond(&mut self, owner_id: &str, request_id: &str) -> Option<String> {
        if let Some(requests) = self.outstanding.get_mut(owner_id) {
            requests.remove(request_id);
            if requests.is_empty() {
                self.outstanding.remove(owner_id);
            }
        }

        let request = self.pending.get_mut(request_id)?;
        if request.at_risk.remove(owner_id) {
            Some(request.queue_id.clone())
        } else {
            None
        }
    }

    /// Closes a request at its deadline. Unknown or already finalized ids
    /// yield `None`, so a deadline firing twice is harmless.
    pub fn finalize(&mut self, request_id: &str) -> Option<HeartbeatOutcome> {
        let request = self.pending.remove(request_id)?;

        for owner_id in &request.at_risk {
            if let Some(requests) = self.outstanding.get_mut(owner_id) {
                requests.remove(request_id);
                if requests.is_empty() {
                    self.outstanding.remove(owner_id);
                }
            }
        }

        if request.is_resolved() {
            Some(HeartbeatOutcome::Resolved {
                queue_id: request.queue_id,
            })
        } else {
            Some(HeartbeatOutcome::Expired {
                queue_id: request.queue_id,
                unresponsive: request.at_risk,
            })
        }
    }

    pub fn get(&self, request_id: &str) -> Option<&HeartbeatRequest> {
        self.pending.get(request_id)
    }

    /// Requests `owner_id` has not answered yet, for re-notifying on reconnect.
    pub fn outstanding_for(&self, owner_id: &str) -> Vec<&HeartbeatRequest> {
        let mut requests: Vec<&HeartbeatRequest> = self
            .outstanding
            .get(owner_id)
            .into_iter()
            .flatten()
            .filter_map(|request_id| self.pending.get(request_id))
            .collect();
        requests.sort_by_key(|r| r.expiration);

        requests
    }
}
