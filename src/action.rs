use std::sync::Arc;

use crate::error::ActionError;
use crate::main_loop::MainLoopHandle;

///
/// A user-supplied unit of work.
///
/// Implementors are opaque to the scheduler: it never inspects what `run` actually
/// does. It only needs a stable `name` for dedup/lookup and a way to install a
/// back-reference so the action can report suspension (see [`MainLoopHandle`]).
///
pub trait Action: Send + Sync + 'static {
    /// A display name for this action. Not required to be unique; name-based admission
    /// methods treat the first match in queue order as authoritative.
    fn name(&self) -> &str;

    /// Called once, at enqueue time, with a handle this action can stash away and
    /// later use to report that it has suspended
    /// ([`action_sleep_notify`](MainLoopHandle::action_sleep_notify)) or woken
    /// ([`action_wake_notify`](MainLoopHandle::action_wake_notify)). Actions that never
    /// suspend can ignore the handle entirely, so the default implementation does
    /// nothing.
    #[allow(unused_variables)]
    fn added_notify(&self, handle: MainLoopHandle) {}

    /// Runs this action on its dedicated worker thread. A returned `Err` becomes the
    /// owning job's terminal failure; it is never propagated back into the caller of an
    /// admission method. A panic out of `run` is captured the same way (see
    /// [`ActionFailure`](crate::ActionFailure)).
    fn run(&self) -> Result<(), ActionError>;
}

///
/// A reference-counted, shared handle to an [`Action`]. Held by the scheduler's
/// internal queues and by clients that want to later refer back to the same action
/// (e.g. to call [`MainLoop::wait_for`](crate::MainLoop::wait_for)).
///
pub type ActionRef = Arc<dyn Action>;
