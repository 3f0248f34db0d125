//! The user-instance seam.
//!
//! The per-tick execution engine is a collaborator: the runner only
//! starts instances, counts them, and stops them. A [`User`] performs one
//! unit of work per `tick`; a [`UserFactory`] creates fresh instances of
//! one class.

use std::future::Future;
use std::pin::Pin;

/// Boxed tick future, so `User` stays object-safe.
pub type TickFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'a>>;

/// An error raised by a user instance during one unit of work.
///
/// The instance continues to its next unit of work unless `terminate`
/// is set; either way the error is captured and deduplicated by its
/// traceback, never crashing the runner.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub msg: String,
    pub traceback: String,
    pub terminate: bool,
}

impl TaskError {
    pub fn new(msg: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            traceback: traceback.into(),
            terminate: false,
        }
    }

    /// Mark this error as fatal to the instance.
    pub fn terminating(mut self) -> Self {
        self.terminate = true;
        self
    }
}

/// One simulated client. Each call to `tick` is one unit of work.
pub trait User: Send {
    fn tick(&mut self) -> TickFuture<'_>;
}

/// Creates user instances of one declared class.
pub trait UserFactory: Send + Sync {
    fn create(&self) -> Box<dyn User>;
}

/// Any `Fn() -> Box<dyn User>` closure is a factory.
impl<F> UserFactory for F
where
    F: Fn() -> Box<dyn User> + Send + Sync,
{
    fn create(&self) -> Box<dyn User> {
        self()
    }
}
