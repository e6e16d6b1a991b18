use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::action::{Action, ActionRef};
use crate::error::ActionFailure;

///
/// The scheduler's per-action runtime record. Owns exactly one [`Action`] for the
/// duration of its worker thread.
///
pub struct Job {
    action: ActionRef,
    name: String,
    alive: AtomicBool,
    exception: Mutex<Option<ActionFailure>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Job {
    pub(crate) fn new(action: ActionRef) -> Job {
        let name = action.name().to_string();
        Job {
            action,
            name,
            alive: AtomicBool::new(true),
            exception: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    ///
    /// Launches the action on a fresh worker thread. `notify` is called exactly once,
    /// after the action has finished — successfully, with a returned error, or by
    /// panicking — so the scheduler can wake up and reap this job.
    ///
    pub(crate) fn start(self: &Arc<Self>, notify: Arc<dyn Fn() + Send + Sync>) {
        let job = Arc::clone(self);
        let action = Arc::clone(&job.action);

        let handle = thread::Builder::new()
            .name(job.name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| action.run()));
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(ActionFailure::from_error(err)),
                    Err(payload) => Some(ActionFailure::from_panic(payload)),
                };

                *job.exception.lock().expect("job exception lock") = failure;
                job.alive.store(false, Ordering::SeqCst);
                notify();
            })
            .expect("failed to spawn worker thread");

        *job.thread.lock().expect("job thread lock") = Some(handle);
    }

    /// True from [`start`](Self::start) until the action's `run` has returned or
    /// panicked.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// The action this job owns.
    pub fn action(&self) -> &ActionRef {
        &self.action
    }

    /// The job's display name, derived from the action at construction time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The captured failure, if the action did not complete successfully. `None` after
    /// a successful completion, or while the job is still alive.
    pub fn exception(&self) -> Option<ActionFailure> {
        self.exception.lock().expect("job exception lock").clone()
    }

    /// Blocks until the worker thread has fully exited. Safe to call more than once —
    /// subsequent calls are no-ops, since the handle is taken on first join.
    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().expect("job thread lock").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    struct Succeeds;
    impl Action for Succeeds {
        fn name(&self) -> &str { "succeeds" }
        fn run(&self) -> Result<(), crate::error::ActionError> { Ok(()) }
    }

    struct Failing;
    impl Action for Failing {
        fn name(&self) -> &str { "failing" }
        fn run(&self) -> Result<(), crate::error::ActionError> {
            Err("deliberate failure".into())
        }
    }

    struct Panicking;
    impl Action for Panicking {
        fn name(&self) -> &str { "panicking" }
        fn run(&self) -> Result<(), crate::error::ActionError> {
            panic!("deliberate panic");
        }
    }

    fn run_to_completion(action: ActionRef) -> Arc<Job> {
        let job = Arc::new(Job::new(action));
        let barrier = Arc::new(Barrier::new(2));
        let notify_barrier = Arc::clone(&barrier);
        job.start(Arc::new(move || { notify_barrier.wait(); }));
        barrier.wait();
        // give the worker thread a moment to actually exit after the notify callback runs
        while job.is_alive() {
            thread::sleep(Duration::from_millis(1));
        }
        job.join();
        job
    }

    #[test]
    fn successful_action_has_no_exception() {
        let job = run_to_completion(Arc::new(Succeeds));
        assert!(!job.is_alive());
        assert!(job.exception().is_none());
    }

    #[test]
    fn failing_action_captures_exception_message() {
        let job = run_to_completion(Arc::new(Failing));
        let failure = job.exception().expect("failing action should have an exception");
        assert_eq!(failure.to_string(), "deliberate failure");
    }

    #[test]
    fn panicking_action_is_captured_not_propagated() {
        let job = run_to_completion(Arc::new(Panicking));
        let failure = job.exception().expect("panicking action should have an exception");
        assert_eq!(failure.to_string(), "deliberate panic");
    }

    #[test]
    fn name_is_derived_from_action() {
        let job = Job::new(Arc::new(Succeeds));
        assert_eq!(job.name(), "succeeds");
    }
}
