// Queue core: entries, their ordering and visibility, the open/closed gate
// and liveness checks. Nothing in here does I/O.

// Collaborators (persistence, identity, calendar, broadcast) are reached
// through the traits in `repository`.

pub mod entity;
pub mod error;
pub mod heartbeat;
pub mod ordering;
pub mod queue;
pub mod repository;
pub mod schedule;
pub mod visibility;
