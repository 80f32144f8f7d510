//! The generic closing protocol embedded by every level of the hierarchy,
//! see `spec.md` section 4.1 and the `closeable.c` simplification noted in
//! `SPEC_FULL.md`: one subscriber record with per-event booleans, instead of
//! three parallel queues.

use std::sync::{Arc, Mutex};

/// Observable lifecycle state of a [`Closeable`].
///
/// Advances only forward, see `spec.md` section 8 ("close monotonicity").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    Alive,
    Closing,
    Closed,
}

type Callback = Box<dyn FnOnce() + Send>;

/// One interested peer's subscription: which of the three close events it
/// wants delivered, and the callback to run for each.
#[derive(Default)]
struct Subscriber {
    on_intend_to_close: Option<Callback>,
    on_closed: Option<Callback>,
    on_closed_all_done: Option<Callback>,
}

struct Inner {
    state: CloseState,
    underlying_total: usize,
    underlying_closed: usize,
    depended_on_total: usize,
    depended_on_closed: usize,
    subscribers: Vec<Subscriber>,
    close_action: Option<Callback>,
    action_running: bool,
    pending_closed_acks: usize,
}

/// Generic closing-protocol state machine, composed into `Extension`,
/// `ExtensionGroup`, `ExtensionThread`, `Engine`, and `App`.
///
/// The owner registers underlying resources and dependencies before calling
/// [`Closeable::close`]; `close()` itself may be called at most once, later
/// calls are no-ops per `spec.md` section 4.1 contracts.
pub struct Closeable {
    inner: Mutex<Inner>,
}

impl Closeable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: CloseState::Alive,
                underlying_total: 0,
                underlying_closed: 0,
                depended_on_total: 0,
                depended_on_closed: 0,
                subscribers: Vec::new(),
                close_action: None,
                action_running: false,
                pending_closed_acks: 0,
            }),
        })
    }

    pub fn state(self: &Arc<Self>) -> CloseState {
        self.inner.lock().unwrap().state
    }

    /// Registers the action to run once every underlying resource and every
    /// depended-on peer is `Closed` (`spec.md` section 4.1 step 3). Must be
    /// called before [`Closeable::close`].
    pub fn set_close_action(self: &Arc<Self>, action: impl FnOnce() + Send + 'static) {
        self.inner.lock().unwrap().close_action = Some(Box::new(action));
    }

    /// Declares that this closeable owns one more underlying resource; the
    /// owner must later call [`Closeable::underlying_closed`] for it.
    pub fn add_underlying(self: &Arc<Self>) {
        self.inner.lock().unwrap().underlying_total += 1;
    }

    /// Declares one more `be_depended_on` peer this closeable must wait on.
    pub fn add_depended_on(self: &Arc<Self>) {
        self.inner.lock().unwrap().depended_on_total += 1;
    }

    /// Registers interest in one or more of the three close events.
    pub fn subscribe(
        self: &Arc<Self>,
        on_intend_to_close: Option<Callback>,
        on_closed: Option<Callback>,
        on_closed_all_done: Option<Callback>,
    ) {
        self.inner.lock().unwrap().subscribers.push(Subscriber {
            on_intend_to_close,
            on_closed,
            on_closed_all_done,
        });
    }

    /// Begins closing: sets `Closing` and fires every `on_intend_to_close`
    /// subscriber. A no-op if already `Closing` or `Closed`.
    pub fn close(self: &Arc<Self>) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != CloseState::Alive {
                return;
            }
            inner.state = CloseState::Closing;
            inner
                .subscribers
                .iter_mut()
                .filter_map(|s| s.on_intend_to_close.take())
                .collect::<Vec<_>>()
        };
        for callback in callbacks {
            callback();
        }
        self.try_close_action();
    }

    /// Acknowledges one underlying resource has reached `Closed`. Re-checks
    /// whether the close action can now run, per the "removing an
    /// underlying resource while Closing re-checks" contract.
    pub fn underlying_closed(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.underlying_closed += 1;
        }
        self.try_close_action();
    }

    /// Acknowledges one `be_depended_on` peer has reached `Closed`.
    pub fn depended_on_closed(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.depended_on_closed += 1;
        }
        self.try_close_action();
    }

    fn try_close_action(self: &Arc<Self>) {
        let action = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != CloseState::Closing || inner.action_running {
                return;
            }
            if inner.underlying_closed < inner.underlying_total
                || inner.depended_on_closed < inner.depended_on_total
            {
                return;
            }
            inner.action_running = true;
            inner.close_action.take()
        };

        match action {
            Some(action) => action(),
            None => self.action_to_close_myself_done(),
        }
    }

    /// Called by the owner once its `action_to_close_myself` callback has
    /// completed (or immediately, if it registered none).
    pub fn action_to_close_myself_done(self: &Arc<Self>) {
        let (callbacks, pending) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == CloseState::Closed {
                return;
            }
            inner.state = CloseState::Closed;
            let callbacks = inner
                .subscribers
                .iter_mut()
                .filter_map(|s| s.on_closed.take())
                .collect::<Vec<_>>();
            inner.pending_closed_acks = callbacks.len();
            (callbacks, inner.pending_closed_acks)
        };

        if pending == 0 {
            self.fire_all_done();
            return;
        }

        for callback in callbacks {
            callback();
        }
    }

    /// Acknowledges one `on_closed` subscriber has finished its own
    /// teardown (`on_closed_done`). Once every subscriber has acknowledged,
    /// `on_closed_all_done` fires and the owner may destroy this object.
    pub fn closed_done(self: &Arc<Self>) {
        let fire = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending_closed_acks == 0 {
                return;
            }
            inner.pending_closed_acks -= 1;
            inner.pending_closed_acks == 0
        };
        if fire {
            self.fire_all_done();
        }
    }

    fn fire_all_done(self: &Arc<Self>) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .iter_mut()
                .filter_map(|s| s.on_closed_all_done.take())
                .collect::<Vec<_>>()
        };
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn close_is_idempotent() {
        let closeable = Closeable::new();
        closeable.close();
        closeable.close();
        assert_eq!(closeable.state(), CloseState::Closed);
    }

    #[test]
    fn waits_for_underlying_resources_before_close_action() {
        let closeable = Closeable::new();
        closeable.add_underlying();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        closeable.set_close_action(move || ran_clone.store(true, Ordering::SeqCst));

        closeable.close();
        assert_eq!(closeable.state(), CloseState::Closing);
        assert!(!ran.load(Ordering::SeqCst));

        closeable.underlying_closed();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn all_done_fires_only_after_every_on_closed_ack() {
        let closeable = Closeable::new();
        let all_done = Arc::new(AtomicBool::new(false));
        let all_done_clone = all_done.clone();

        closeable.subscribe(None, Some(Box::new(|| {})), None);
        closeable.subscribe(None, Some(Box::new(|| {})), None);
        closeable.subscribe(
            None,
            None,
            Some(Box::new(move || all_done_clone.store(true, Ordering::SeqCst))),
        );

        closeable.close();
        assert!(!all_done.load(Ordering::SeqCst));

        closeable.closed_done();
        assert!(!all_done.load(Ordering::SeqCst));

        closeable.closed_done();
        assert!(all_done.load(Ordering::SeqCst));
    }

    #[test]
    fn on_closed_all_done_fires_immediately_with_no_subscribers() {
        let closeable = Closeable::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        closeable.subscribe(
            None,
            None,
            Some(Box::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        closeable.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
