pub mod config;
pub mod event_bus;
pub mod human_queue;
pub mod plan_store;
pub mod sink;

pub use config::*;
pub use event_bus::*;
pub use human_queue::*;
pub use plan_store::*;
pub use sink::*;
