use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::ActionFailure;
use crate::job::Job;

///
/// The event names a [`SignalBus`] subscriber can register for.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    QueueEmpty,
    JobStarted,
    JobSucceeded,
    JobAborted,
    JobCompleted,
}

///
/// A single lifecycle event, carrying whatever arguments are relevant to it. Cheap to
/// copy: every variant only holds references into state the scheduler already owns.
///
#[derive(Clone, Copy)]
pub enum Event<'a> {
    QueueEmpty,
    JobStarted(&'a Job),
    JobSucceeded(&'a Job),
    JobAborted(&'a Job, &'a ActionFailure),
    JobCompleted(&'a Job),
}

impl<'a> Event<'a> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::QueueEmpty => EventKind::QueueEmpty,
            Event::JobStarted(_) => EventKind::JobStarted,
            Event::JobSucceeded(_) => EventKind::JobSucceeded,
            Event::JobAborted(_, _) => EventKind::JobAborted,
            Event::JobCompleted(_) => EventKind::JobCompleted,
        }
    }
}

type Callback = Arc<dyn for<'a> Fn(Event<'a>) + Send + Sync>;

///
/// A minimal publish/subscribe facility keyed by event name.
///
/// Emissions are synchronous, on whichever thread calls [`emit`](Self::emit) (always
/// the scheduler thread, for events the [`MainLoop`](crate::MainLoop) emits itself). A
/// subscriber that panics cannot stop the scheduler: its panic is caught and logged,
/// and the remaining subscribers still run.
///
#[derive(Default)]
pub struct SignalBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Callback>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        SignalBus { subscribers: Mutex::new(HashMap::new()) }
    }

    /// Registers a callback for the given event. Multiple subscribers for the same
    /// event are invoked in registration order.
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: for<'a> Fn(Event<'a>) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .expect("signal bus lock")
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(Arc::new(callback));
    }

    /// Emits `event` to every subscriber registered for its kind. The subscriber list
    /// is snapshotted before invoking anything, so a subscriber that registers another
    /// subscriber, or that calls back into the `MainLoop`, cannot deadlock against this
    /// lock.
    pub(crate) fn emit(&self, event: Event) {
        let callbacks: Vec<Callback> = {
            let subscribers = self.subscribers.lock().expect("signal bus lock");
            subscribers.get(&event.kind()).cloned().unwrap_or_default()
        };

        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                let failure = ActionFailure::from_panic(payload);
                warn!("signal observer for {:?} panicked: {}", event.kind(), failure);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = SignalBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order1 = Arc::clone(&order);
        bus.on(EventKind::QueueEmpty, move |_| order1.lock().unwrap().push(1));
        let order2 = Arc::clone(&order);
        bus.on(EventKind::QueueEmpty, move |_| order2.lock().unwrap().push(2));

        bus.emit(Event::QueueEmpty);

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn a_panicking_subscriber_does_not_stop_the_rest() {
        let bus = SignalBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::QueueEmpty, |_| panic!("bad observer"));
        let ran2 = Arc::clone(&ran);
        bus.on(EventKind::QueueEmpty, move |_| { ran2.fetch_add(1, Ordering::SeqCst); });

        bus.emit(Event::QueueEmpty);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_subscribers_of_the_matching_kind_run() {
        let bus = SignalBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran2 = Arc::clone(&ran);
        bus.on(EventKind::JobStarted, move |_| { ran2.fetch_add(1, Ordering::SeqCst); });

        bus.emit(Event::QueueEmpty);

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
