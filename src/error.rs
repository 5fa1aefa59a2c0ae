use thiserror::Error;

use crate::cache::CacheError;
use crate::config::LoadError;
use crate::infra::error::InfraError;
use crate::pubsub::PubSubError;
use crate::queue::QueueError;

/// Errors surfaced while assembling or running the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("cache engine error: {0}")]
    Cache(#[from] CacheError),
    #[error("pubsub engine error: {0}")]
    PubSub(#[from] PubSubError),
    #[error("queue engine error: {0}")]
    Queue(#[from] QueueError),
    #[error("invalid route `{path}`: {reason}")]
    Route { path: String, reason: String },
    #[error("route `{method} {path}` is registered twice")]
    DuplicateRoute { method: String, path: String },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn route(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Route {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::from(err))
    }
}
