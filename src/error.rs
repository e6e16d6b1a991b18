use std::any::Any;
use std::fmt;

use thiserror::Error;

///
/// The error type returned by [`Action::run`](crate::Action::run). Boxed so actions can
/// return whatever concrete error type is convenient for them.
///
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

///
/// A misconfiguration caught while building or reconfiguring a
/// [`MainLoop`](crate::MainLoop).
///
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_threads must be at least 1, got {0}")]
    MaxThreadsTooSmall(usize),
}

///
/// The captured terminal failure of a [`Job`](crate::Job): either the error an action's
/// `run` returned, or the payload of a panic it raised. From the scheduler's point of
/// view these are indistinguishable — both just mean the action failed, and both are
/// surfaced the same way via the `job-aborted` signal.
///
#[derive(Debug, Clone)]
pub struct ActionFailure {
    message: String,
}

impl ActionFailure {
    pub(crate) fn from_error(err: ActionError) -> Self {
        ActionFailure { message: err.to_string() }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "action panicked with a non-string payload".to_string()
        };
        ActionFailure { message }
    }
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionFailure {}
