//! A bounded-concurrency work queue.
//!
//! [`MainLoop`] is a scheduler that admits at most `max_threads` user-supplied
//! [`Action`]s to concurrent execution at once, on top of priority injection, a
//! force-start bypass that ignores both the concurrency cap and the pause gate, and
//! suspension-aware admission: a running action can declare itself asleep so it stops
//! counting against the concurrency budget while it waits on something external.
//!
//! What an action actually does, persisting queue state across restarts, distributing
//! work across machines, and fairness beyond FIFO-with-priority are all out of scope —
//! this crate only schedules.
//!
//! ```no_run
//! use std::sync::Arc;
//! use workqueue::{Action, ActionError, MainLoop, MainLoopConfig};
//!
//! struct Greet(String);
//!
//! impl Action for Greet {
//!     fn name(&self) -> &str { &self.0 }
//!     fn run(&self) -> Result<(), ActionError> {
//!         println!("hello, {}", self.0);
//!         Ok(())
//!     }
//! }
//!
//! let main_loop = MainLoop::new(MainLoopConfig::default()).unwrap();
//! main_loop.enqueue(Arc::new(Greet("world".to_string())));
//! main_loop.wait_until_done();
//! ```

mod action;
mod config;
mod error;
mod job;
mod main_loop;
mod signal;

pub use action::{Action, ActionRef};
pub use config::MainLoopConfig;
pub use error::{ActionError, ActionFailure, ConfigError};
pub use job::Job;
pub use main_loop::{MainLoop, MainLoopHandle};
pub use signal::{Event, EventKind, SignalBus};
