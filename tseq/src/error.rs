//! Unit failure types

use std::any::Any;

use thiserror::Error;
use tokio::task::JoinError;

/// Failures contained at the boundary of a single unit
///
/// Bodies have no error channel back to the caller. These are only logged
/// and counted; they never stop the worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitFailure {
    #[error("Body panicked: {0}")]
    Panicked(String),

    #[error("Body was abandoned before it signalled completion")]
    Abandoned,
}

impl UnitFailure {
    /// Check if the body panicked
    pub fn is_panic(&self) -> bool {
        matches!(self, UnitFailure::Panicked(_))
    }
}

impl From<JoinError> for UnitFailure {
    fn from(err: JoinError) -> Self {
        match err.try_into_panic() {
            Ok(payload) => UnitFailure::Panicked(panic_message(payload.as_ref())),
            Err(_) => UnitFailure::Abandoned,
        }
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
