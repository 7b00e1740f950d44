pub mod auth;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod sync;
