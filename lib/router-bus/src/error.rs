use thiserror::Error;

pub type BusResult<T> = std::result::Result<T, BusError>;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,

    #[error("bus is closed")]
    Closed,

    #[error("too many messages queued while disconnected ({0})")]
    QueueFull(usize),

    #[error("bus rejected {operation} on {subject}")]
    Rejected { operation: &'static str, subject: String },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
