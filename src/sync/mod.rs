pub mod config;
pub mod connectivity;
pub mod merge;
pub mod observer;
pub mod orchestrator;
pub mod polling;
pub mod push;
pub mod queue;
pub mod store;
pub mod transport;
pub mod types;

pub const SNAPSHOT_KEY: &str = "price_cache.snapshot";
pub const ACTION_QUEUE_KEY: &str = "offline_queue.actions";
