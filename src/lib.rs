//! entity-sync - topic-routed entity synchronization
//!
//! Keeps local copies of entities owned by other microservices in sync by
//! consuming their lifecycle events (`created`, `updated`, `deleted`) from
//! topic exchanges and applying them to a local entity store. Also publishes
//! such events for entities this service owns.

pub mod bus;
pub mod config;
pub mod handlers;
pub mod orchestration;
pub mod service;
pub mod storage;
pub mod topology;
pub mod utils;
