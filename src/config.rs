use std::time::Duration;

use crate::error::ConfigError;

///
/// Tunables for a [`MainLoop`](crate::MainLoop).
///
#[derive(Debug, Clone)]
pub struct MainLoopConfig {
    /// Maximum number of actions admitted to concurrent execution at once. Must be at
    /// least 1. Force-started actions bypass this cap entirely, and a sleeping action
    /// does not count against it.
    pub max_threads: usize,

    /// How long a call to [`wait_for_activity`](crate::MainLoop::wait_for_activity)
    /// blocks before giving up if nothing changes, matching the reference source's
    /// ~200ms polling tick.
    pub activity_tick: Duration,

    /// Whether the loop should start in the paused state. Force-started actions still
    /// run immediately regardless of this setting.
    pub start_paused: bool,
}

impl Default for MainLoopConfig {
    fn default() -> Self {
        MainLoopConfig {
            max_threads: num_cpus::get().max(1),
            activity_tick: Duration::from_millis(200),
            start_paused: false,
        }
    }
}

impl MainLoopConfig {
    /// Checks that this configuration can be used to build a `MainLoop`. Called
    /// automatically by [`MainLoop::new`](crate::MainLoop::new); exposed separately so
    /// callers building config from user input (e.g. a CLI flag) can validate early.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads < 1 {
            return Err(ConfigError::MaxThreadsTooSmall(self.max_threads));
        }
        Ok(())
    }
}
