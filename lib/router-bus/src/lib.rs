//! Publish/subscribe bus connecting router instances and their peers
pub mod client;
pub mod error;
pub mod local;
pub mod redis_bus;

pub use client::{BusMessage, MessageBus, Subscription};
pub use error::{BusError, BusResult};
pub use local::LocalBus;
pub use redis_bus::RedisBus;
