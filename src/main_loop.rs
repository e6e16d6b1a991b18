use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace};

use crate::action::ActionRef;
use crate::config::MainLoopConfig;
use crate::job::Job;
use crate::signal::{Event, EventKind, SignalBus};

///
/// Everything a [`MainLoop`] mutates under its single mutex. Split out from `MainLoop` itself so
/// the scheduler thread and the public API share exactly one lock without needing to reach through
/// an `Arc<MainLoop>` cycle.
///
struct State {
    queue: Vec<ActionRef>,
    force_start: Vec<ActionRef>,
    running_jobs: Vec<Arc<Job>>,
    sleeping_actions: Vec<ActionRef>,
    paused: bool,
    shutdown_now: bool,
    max_threads: usize,
}

impl State {
    fn queue_length(&self) -> usize {
        self.queue.len() + self.force_start.len() + self.running_jobs.len()
    }

    fn effective_active(&self) -> usize {
        self.running_jobs.len() - self.sleeping_actions.len()
    }

    fn is_running(&self, name: &str) -> bool {
        self.running_jobs.iter().any(|job| job.action().name() == name)
    }

    fn is_force_started(&self, name: &str) -> bool {
        self.force_start.iter().any(|a| a.name() == name)
    }

    fn queue_position(&self, name: &str) -> Option<usize> {
        self.queue.iter().position(|a| a.name() == name)
    }

    fn first_action_from_name(&self, name: &str) -> Option<ActionRef> {
        self.queue
            .iter()
            .chain(self.force_start.iter())
            .chain(self.running_jobs.iter().map(|j| j.action()))
            .find(|a| a.name() == name)
            .cloned()
    }

    fn contains(&self, action: &ActionRef) -> bool {
        self.queue.iter().any(|a| Arc::ptr_eq(a, action))
            || self.force_start.iter().any(|a| Arc::ptr_eq(a, action))
            || self.running_jobs.iter().any(|j| Arc::ptr_eq(j.action(), action))
    }
}

///
/// The shared condition, guarding [`State`] and waking both the scheduler thread and any client
/// blocked in an observer call. Held behind an `Arc` so a [`MainLoopHandle`] installed on an
/// `Action` can notify it without keeping the whole `MainLoop` alive.
///
struct Condition {
    state: Mutex<State>,
    cvar: Condvar,
    bus: SignalBus,
    activity_tick: Duration,
}

impl Condition {
    fn notify(&self) {
        self.cvar.notify_all();
    }
}

///
/// The back-reference an [`Action`](crate::Action) receives via
/// [`added_notify`](crate::Action::added_notify). Lets an action report that it has suspended or
/// woken without holding on to the whole [`MainLoop`].
///
#[derive(Clone)]
pub struct MainLoopHandle {
    condition: Weak<Condition>,
}

impl MainLoopHandle {
    /// Declares `action` asleep: it stops counting against `max_threads` until
    /// [`action_wake_notify`](Self::action_wake_notify) is called for it.
    ///
    /// # Panics
    ///
    /// Panics if `action` is not currently in `running_jobs` — reporting sleep for an action the
    /// scheduler does not believe is running is a programmer error (§7.3 of the design).
    pub fn action_sleep_notify(&self, action: &ActionRef) {
        let condition = match self.condition.upgrade() {
            Some(condition) => condition,
            None => return,
        };
        let mut state = condition.state.lock().expect("main loop state lock");
        assert!(
            state.is_running(action.name()),
            "action_sleep_notify called for \"{}\", which is not running",
            action.name()
        );
        state.sleeping_actions.push(Arc::clone(action));
        condition.notify();
    }

    /// Declares a previously-sleeping `action` awake again.
    ///
    /// # Panics
    ///
    /// Panics if `action` is not currently running, or was not previously reported asleep.
    pub fn action_wake_notify(&self, action: &ActionRef) {
        let condition = match self.condition.upgrade() {
            Some(condition) => condition,
            None => return,
        };
        let mut state = condition.state.lock().expect("main loop state lock");
        assert!(
            state.is_running(action.name()),
            "action_wake_notify called for \"{}\", which is not running",
            action.name()
        );
        let position = state
            .sleeping_actions
            .iter()
            .position(|a| Arc::ptr_eq(a, action))
            .unwrap_or_else(|| {
                panic!("action_wake_notify called for \"{}\", which was not asleep", action.name())
            });
        state.sleeping_actions.remove(position);
        condition.notify();
    }
}

///
/// A bounded-concurrency scheduler. See the crate-level documentation for an overview; this type
/// exposes the admission API (§4.2), the observer API (§4.3) and owns the scheduler thread (§4.5).
///
pub struct MainLoop {
    condition: Arc<Condition>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl MainLoop {
    /// Builds and starts a `MainLoop`, spawning its dedicated scheduler thread. Returns
    /// [`ConfigError`](crate::ConfigError) if `config` is invalid.
    pub fn new(config: MainLoopConfig) -> Result<Arc<MainLoop>, crate::ConfigError> {
        config.validate()?;

        let condition = Arc::new(Condition {
            state: Mutex::new(State {
                queue: Vec::new(),
                force_start: Vec::new(),
                running_jobs: Vec::new(),
                sleeping_actions: Vec::new(),
                paused: config.start_paused,
                shutdown_now: false,
                max_threads: config.max_threads,
            }),
            cvar: Condvar::new(),
            bus: SignalBus::new(),
            activity_tick: config.activity_tick,
        });

        let scheduler_condition = Arc::clone(&condition);
        let handle = thread::Builder::new()
            .name("workqueue-scheduler".to_string())
            .spawn(move || scheduler_loop(scheduler_condition))
            .expect("failed to spawn scheduler thread");

        Ok(Arc::new(MainLoop { condition, scheduler: Mutex::new(Some(handle)) }))
    }

    /// Registers a callback for `kind`. See [`SignalBus::on`].
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: for<'a> Fn(Event<'a>) + Send + Sync + 'static,
    {
        self.condition.bus.on(kind, callback);
    }

    fn handle(&self) -> MainLoopHandle {
        MainLoopHandle { condition: Arc::downgrade(&self.condition) }
    }

    fn install(&self, action: &ActionRef) {
        action.added_notify(self.handle());
    }

    /// Appends `action` to the back of the queue.
    pub fn enqueue(&self, action: ActionRef) {
        self.install(&action);
        let mut state = self.condition.state.lock().expect("main loop state lock");
        debug!("enqueue: \"{}\"", action.name());
        state.queue.push(action);
        self.condition.notify();
    }

    /// Appends `action` unless an action of the same name is already reachable from `queue`,
    /// `force_start` or `running_jobs`. Returns whether it was actually enqueued.
    pub fn enqueue_or_ignore(&self, action: ActionRef) -> bool {
        self.install(&action);
        let mut state = self.condition.state.lock().expect("main loop state lock");
        let enqueued = state.first_action_from_name(action.name()).is_none();
        if enqueued {
            debug!("enqueue_or_ignore: admitted \"{}\"", action.name());
            state.queue.push(action);
        } else {
            debug!("enqueue_or_ignore: dropped duplicate \"{}\"", action.name());
        }
        self.condition.notify();
        enqueued
    }

    /// Inserts `action` at the front of the queue, or into `force_start` if `force_start` is true
    /// (which bypasses both the concurrency cap and the pause gate).
    pub fn priority_enqueue(&self, action: ActionRef, force_start: bool) {
        self.install(&action);
        let mut state = self.condition.state.lock().expect("main loop state lock");
        if force_start {
            debug!("priority_enqueue: force-starting \"{}\"", action.name());
            state.force_start.push(action);
        } else {
            debug!("priority_enqueue: \"{}\" to front of queue", action.name());
            state.queue.insert(0, action);
        }
        self.condition.notify();
    }

    /// Bubbles up priority for a pending entry named `action.name()` without creating a duplicate.
    ///
    /// Returns `true` if this was a new admission (no matching name was pending or running), or
    /// `false` if an existing queued entry was reshuffled to the front instead (in which case
    /// `action` itself is discarded).
    pub fn priority_enqueue_or_raise(&self, action: ActionRef, force_start: bool) -> bool {
        let mut state = self.condition.state.lock().expect("main loop state lock");

        if state.is_force_started(action.name()) || state.is_running(action.name()) {
            self.condition.notify();
            return false;
        }

        let existing = state.queue_position(action.name()).map(|i| state.queue.remove(i));
        let is_new = existing.is_none();
        let action = existing.unwrap_or(action);

        if is_new {
            self.install(&action);
        } else {
            debug!("priority_enqueue_or_raise: reshuffled \"{}\"", action.name());
        }

        if force_start {
            state.force_start.push(action);
        } else {
            state.queue.insert(0, action);
        }

        self.condition.notify();
        is_new
    }

    /// Gates admission of new actions from `queue`. Already-running jobs and `force_start` are
    /// unaffected. Idempotent.
    pub fn pause(&self) {
        let mut state = self.condition.state.lock().expect("main loop state lock");
        state.paused = true;
        self.condition.notify();
    }

    /// Lifts a prior [`pause`](Self::pause). A no-op if the loop was not paused. Idempotent.
    pub fn resume(&self) {
        let mut state = self.condition.state.lock().expect("main loop state lock");
        state.paused = false;
        self.condition.notify();
    }

    /// Whether the loop is currently paused.
    pub fn is_paused(&self) -> bool {
        self.condition.state.lock().expect("main loop state lock").paused
    }

    /// Updates the concurrency cap. Lowering it below the current active count does not interrupt
    /// already-running jobs; the scheduler simply stops admitting new work until it drains.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero — use [`MainLoopConfig::validate`] ahead of time if `n` comes from
    /// untrusted input and you'd rather get a `Result`.
    pub fn set_max_threads(&self, n: usize) {
        assert!(n >= 1, "max_threads must be at least 1");
        let mut state = self.condition.state.lock().expect("main loop state lock");
        state.max_threads = n;
        self.condition.notify();
    }

    /// The current concurrency cap.
    pub fn max_threads(&self) -> usize {
        self.condition.state.lock().expect("main loop state lock").max_threads
    }

    /// Flags the scheduler to stop admitting new work, then blocks until every currently-running
    /// job has been joined. Idempotent — calling `shutdown` again after it has already completed is
    /// a no-op, and no further admission or signal takes effect.
    pub fn shutdown(&self) {
        {
            let mut state = self.condition.state.lock().expect("main loop state lock");
            state.shutdown_now = true;
            self.condition.notify();
        }

        if let Some(handle) = self.scheduler.lock().expect("scheduler handle lock").take() {
            let _ = handle.join();
        }

        let running = {
            let mut state = self.condition.state.lock().expect("main loop state lock");
            std::mem::take(&mut state.running_jobs)
        };
        for job in running {
            job.join();
        }
    }

    /// Blocks while `action` is reachable from `queue`, `force_start` or `running_jobs`.
    pub fn wait_for(&self, action: &ActionRef) {
        let mut state = self.condition.state.lock().expect("main loop state lock");
        while state.contains(action) {
            state = self.condition.cvar.wait(state).expect("main loop state lock");
        }
    }

    /// Blocks while [`get_queue_length`](Self::get_queue_length) is nonzero.
    pub fn wait_until_done(&self) {
        let mut state = self.condition.state.lock().expect("main loop state lock");
        while state.queue_length() > 0 {
            state = self.condition.cvar.wait(state).expect("main loop state lock");
        }
    }

    /// Blocks for up to one activity tick (see [`MainLoopConfig::activity_tick`], fixed at
    /// construction time) or until any state change, whichever comes first. Used by polling
    /// observers that want a bounded wake-up rather than an indefinite wait.
    pub fn wait_for_activity(&self) {
        let state = self.condition.state.lock().expect("main loop state lock");
        let _ = self
            .condition
            .cvar
            .wait_timeout(state, self.condition.activity_tick)
            .expect("main loop state lock");
    }

    /// Whether `action` is reachable from `queue`, `force_start` or `running_jobs`.
    pub fn in_queue(&self, action: &ActionRef) -> bool {
        self.condition.state.lock().expect("main loop state lock").contains(action)
    }

    /// Whether `action` is currently in `running_jobs`.
    pub fn in_progress(&self, action: &ActionRef) -> bool {
        self.condition.state.lock().expect("main loop state lock").is_running(action.name())
    }

    /// A snapshot of the actions currently in `running_jobs`.
    pub fn get_running_actions(&self) -> Vec<ActionRef> {
        self.condition
            .state
            .lock()
            .expect("main loop state lock")
            .running_jobs
            .iter()
            .map(|j| Arc::clone(j.action()))
            .collect()
    }

    /// `|queue| + |force_start| + |running_jobs|` — the sole published size metric.
    pub fn get_queue_length(&self) -> usize {
        self.condition.state.lock().expect("main loop state lock").queue_length()
    }

    /// The first action named `name`, searched in `queue`, then `force_start`, then
    /// `running_jobs`, or `None` if no such action is reachable.
    pub fn get_first_action_from_name(&self, name: &str) -> Option<ActionRef> {
        self.condition.state.lock().expect("main loop state lock").first_action_from_name(name)
    }

    /// Every action named `name` reachable from `queue ∪ force_start ∪ running_jobs`, in that
    /// order. Unlike the method this generalizes in the reference source (see DESIGN.md), this
    /// does not depend on an attribute that was never actually set — it scans the real pools.
    pub fn get_actions_from_name(&self, name: &str) -> Vec<ActionRef> {
        let state = self.condition.state.lock().expect("main loop state lock");
        state
            .queue
            .iter()
            .chain(state.force_start.iter())
            .chain(state.running_jobs.iter().map(|j| j.action()))
            .filter(|a| a.name() == name)
            .cloned()
            .collect()
    }
}

impl Drop for MainLoop {
    /// Ensures the scheduler thread and any still-running jobs are joined rather than leaked if a
    /// caller drops the `MainLoop` without calling [`shutdown`](Self::shutdown) themselves. Safe to
    /// call `shutdown` explicitly first — this is then a no-op, same as any other repeat call.
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a `Job` for `action` and registers it in `running_jobs`. Does not start its worker
/// thread — the caller does that once the state lock has been released, per §4.5/§5.
fn register(state: &mut State, action: ActionRef) -> Arc<Job> {
    let job = Arc::new(Job::new(action));
    state.running_jobs.push(Arc::clone(&job));
    job
}

/// Starts `job`'s worker thread and emits `job-started`. Called with the state lock released —
/// thread creation can be slow and must not block client admission calls.
fn start_and_announce(condition: &Arc<Condition>, job: &Arc<Job>) {
    let name = job.name().to_string();
    let notify_condition = Arc::clone(condition);
    job.start(Arc::new(move || notify_condition.notify()));
    debug!("job started: \"{}\"", name);
    condition.bus.emit(Event::JobStarted(job));
}

fn scheduler_loop(condition: Arc<Condition>) {
    loop {
        let mut state = condition.state.lock().expect("main loop state lock");

        if state.shutdown_now {
            break;
        }

        // 1. Reap terminated jobs.
        let mut still_running = Vec::with_capacity(state.running_jobs.len());
        let mut terminated = Vec::new();
        for job in state.running_jobs.drain(..) {
            if job.is_alive() {
                still_running.push(job);
            } else {
                terminated.push(job);
            }
        }
        state.running_jobs = still_running;
        let running_actions: Vec<ActionRef> =
            state.running_jobs.iter().map(|j| Arc::clone(j.action())).collect();
        state
            .sleeping_actions
            .retain(|a| running_actions.iter().any(|running| Arc::ptr_eq(running, a)));

        // 2. Level-triggered queue-empty, decided now but emitted once unlocked below.
        let emit_queue_empty = state.queue_length() == 0;

        // 3. Register every force-started action as running; its thread is started below.
        let force_started: Vec<ActionRef> = state.force_start.drain(..).collect();
        let mut to_launch: Vec<Arc<Job>> = Vec::with_capacity(force_started.len() + 1);
        for action in force_started {
            to_launch.push(register(&mut state, action));
        }

        // 4/5. Dequeue at most one action if admission allows it.
        if !state.queue.is_empty()
            && !state.paused
            && state.effective_active() < state.max_threads
        {
            let action = state.queue.remove(0);
            to_launch.push(register(&mut state, action));
        }

        // Release the state lock before touching the signal bus or spawning worker threads, so
        // an observer calling back into `MainLoop`, or a slow thread spawn, never blocks another
        // admission call waiting on this same lock.
        drop(state);

        for job in &terminated {
            match job.exception() {
                Some(failure) => {
                    error!("job \"{}\" aborted: {}", job.name(), failure);
                    condition.bus.emit(Event::JobAborted(job, &failure));
                }
                None => {
                    trace!("job \"{}\" succeeded", job.name());
                    condition.bus.emit(Event::JobSucceeded(job));
                }
            }
            condition.bus.emit(Event::JobCompleted(job));
            job.join();
        }

        if emit_queue_empty {
            trace!("queue empty");
            condition.bus.emit(Event::QueueEmpty);
        }

        let launched_any = !to_launch.is_empty();
        for job in &to_launch {
            start_and_announce(&condition, job);
        }
        if launched_any {
            condition.notify();
        }

        // 6. Block for more work. Re-examined under a freshly acquired lock so a state change
        // made while we were off emitting signals or spawning threads is never missed.
        let state = condition.state.lock().expect("main loop state lock");
        if !state.shutdown_now
            && state.force_start.is_empty()
            && (state.queue.is_empty() || state.paused || state.effective_active() >= state.max_threads)
        {
            let _ = condition.cvar.wait(state).expect("main loop state lock");
        }
    }

    trace!("scheduler loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::error::ActionError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Instant;
    impl Action for Instant {
        fn name(&self) -> &str {
            "instant"
        }
        fn run(&self) -> Result<(), ActionError> {
            Ok(())
        }
    }

    struct Sleepy {
        millis: u64,
        label: &'static str,
    }
    impl Action for Sleepy {
        fn name(&self) -> &str {
            self.label
        }
        fn run(&self) -> Result<(), ActionError> {
            thread::sleep(Duration::from_millis(self.millis));
            Ok(())
        }
    }

    struct Failing;
    impl Action for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn run(&self) -> Result<(), ActionError> {
            Err("boom".into())
        }
    }

    fn test_loop(max_threads: usize) -> Arc<MainLoop> {
        MainLoop::new(MainLoopConfig { max_threads, ..MainLoopConfig::default() }).unwrap()
    }

    #[test]
    fn simple_action_runs_to_completion() {
        let main_loop = test_loop(1);
        main_loop.enqueue(Arc::new(Instant));
        main_loop.wait_until_done();
        assert_eq!(main_loop.get_queue_length(), 0);
        main_loop.shutdown();
    }

    #[test]
    fn fifo_under_cap_s1() {
        let main_loop = test_loop(2);
        let started = Arc::new(StdMutex::new(Vec::new()));
        let s1 = Arc::clone(&started);
        main_loop.on(EventKind::JobStarted, move |event| {
            if let Event::JobStarted(job) = event {
                s1.lock().unwrap().push(job.name().to_string());
            }
        });

        main_loop.enqueue(Arc::new(Sleepy { millis: 100, label: "a" }));
        main_loop.enqueue(Arc::new(Sleepy { millis: 100, label: "b" }));
        main_loop.enqueue(Arc::new(Sleepy { millis: 100, label: "c" }));

        main_loop.wait_until_done();
        main_loop.shutdown();

        let order = started.lock().unwrap().clone();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn force_start_bypasses_pause_s2() {
        let main_loop = test_loop(1);
        main_loop.pause();
        main_loop.enqueue(Arc::new(Instant));
        let b: ActionRef = Arc::new(Instant);
        main_loop.priority_enqueue(Arc::clone(&b), true);

        main_loop.wait_for(&b);
        assert!(main_loop.is_paused());
        assert_eq!(main_loop.get_queue_length(), 1);

        main_loop.resume();
        main_loop.wait_until_done();
        main_loop.shutdown();
    }

    #[test]
    fn dedup_on_name_s4() {
        let main_loop = test_loop(1);
        main_loop.pause();

        let first = main_loop.enqueue_or_ignore(Arc::new(Sleepy { millis: 50, label: "x" }));
        let second = main_loop.enqueue_or_ignore(Arc::new(Sleepy { millis: 50, label: "x" }));

        assert!(first);
        assert!(!second);
        assert_eq!(main_loop.get_queue_length(), 1);

        main_loop.resume();
        main_loop.wait_until_done();
        main_loop.shutdown();
    }

    #[test]
    fn promote_existing_s5() {
        let main_loop = test_loop(1);
        main_loop.pause();

        let x1: ActionRef = Arc::new(Sleepy { millis: 10, label: "x" });
        let y: ActionRef = Arc::new(Sleepy { millis: 10, label: "y" });
        main_loop.enqueue(Arc::clone(&x1));
        main_loop.enqueue(Arc::clone(&y));

        let x2: ActionRef = Arc::new(Sleepy { millis: 10, label: "x" });
        let is_new = main_loop.priority_enqueue_or_raise(x2, false);
        assert!(!is_new);

        let front = main_loop.get_first_action_from_name("x").unwrap();
        assert!(Arc::ptr_eq(&front, &x1));

        main_loop.resume();
        main_loop.wait_until_done();
        main_loop.shutdown();
    }

    #[test]
    fn failing_action_still_completes_queue() {
        let main_loop = test_loop(1);
        let aborted = Arc::new(AtomicUsize::new(0));
        let a1 = Arc::clone(&aborted);
        main_loop.on(EventKind::JobAborted, move |_| {
            a1.fetch_add(1, Ordering::SeqCst);
        });

        main_loop.enqueue(Arc::new(Failing));
        main_loop.wait_until_done();
        main_loop.shutdown();

        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_joins_running_jobs_s6() {
        let main_loop = test_loop(3);
        main_loop.enqueue(Arc::new(Sleepy { millis: 50, label: "a" }));
        main_loop.enqueue(Arc::new(Sleepy { millis: 50, label: "b" }));
        main_loop.enqueue(Arc::new(Sleepy { millis: 50, label: "c" }));

        main_loop.wait_for_activity();
        main_loop.shutdown();

        assert!(main_loop.get_running_actions().is_empty());
    }

    #[test]
    fn pause_resume_are_idempotent() {
        let main_loop = test_loop(1);
        main_loop.pause();
        main_loop.pause();
        assert!(main_loop.is_paused());
        main_loop.resume();
        main_loop.resume();
        assert!(!main_loop.is_paused());
        main_loop.shutdown();
    }

    #[test]
    fn set_max_threads_rejects_zero() {
        let main_loop = test_loop(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            main_loop.set_max_threads(0);
        }));
        assert!(result.is_err());
        main_loop.shutdown();
    }
}
