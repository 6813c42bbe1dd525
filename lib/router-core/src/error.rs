use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("No endpoints available for route: {0}")]
    NoEndpoints(String),

    #[error("Invalid route announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
