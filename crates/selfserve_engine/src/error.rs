//! Request error taxonomy.
//!
//! Every variant except the infrastructure ones (`Store`, `Io`, `Queue`)
//! carries a message meant for the end user. The infrastructure variants
//! are converted at the HTTP boundary according to the error reporting
//! policy.

use crate::queue::QueueError;
use selfserve_db::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RequestError>;

#[derive(Error, Debug)]
pub enum RequestError {
    /// Bad input, first failing check only
    #[error("{0}")]
    Validation(String),

    /// Actor lacks a required affiliation or flag
    #[error("{0}")]
    Unauthorized(String),

    /// No such token, or token not verified yet
    #[error("{0}")]
    NotFound(String),

    /// Transition already happened (verified twice, denied twice, approval in flight)
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RateLimited(String),

    /// Downstream command failed; message already classified
    #[error("{0}")]
    Downstream(String),

    #[error("Record store failure: {0}")]
    Store(#[from] DbError),

    #[error("IO failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue failure: {0}")]
    Queue(#[from] QueueError),
}

impl RequestError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::Downstream(msg.into())
    }

    /// Whether the message may be shown to the end user verbatim.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Io(_) | Self::Queue(_))
    }
}
