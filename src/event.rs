//! Event subscriber lists and a small labelled state-machine holder (module J).
//!
//! The reference source expresses these as generic `Event<Args...>` and `StateMachine<S>` helpers
//! used throughout the network manager, the tractor ECU, and the NIU. This module ports the same
//! shape to Rust: a FIFO subscriber list and a bare state cell.

/// A handle returned by [`Event::subscribe`], used to remove a subscriber later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// An ordered list of subscribers notified on `emit`.
///
/// Subscriptions fire in registration order. Re-entrant emission (a handler that triggers another
/// `emit` on the same event) is permitted: the subscriber list is snapshotted before dispatch, so a
/// handler added or removed during dispatch does not affect the current emission.
pub struct Event<Args: Clone> {
    next_id: u64,
    subscribers: Vec<(u64, Box<dyn FnMut(Args)>)>,
}

impl<Args: Clone> Event<Args> {
    /// Create an empty event with no subscribers.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    /// Register a subscriber, returning a handle that can later be passed to [`unsubscribe`].
    ///
    /// [`unsubscribe`]: Event::unsubscribe
    pub fn subscribe(&mut self, handler: impl FnMut(Args) + 'static) -> SubscriptionHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, Box::new(handler)));
        SubscriptionHandle(id)
    }

    /// Remove a previously registered subscriber. No-op if the handle is unknown (already removed).
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        self.subscribers.retain(|(id, _)| *id != handle.0);
    }

    /// Invoke every subscriber, in registration order, with a clone of `args`.
    pub fn emit(&mut self, args: Args) {
        let ids: Vec<u64> = self.subscribers.iter().map(|(id, _)| *id).collect();
        for id in ids {
            if let Some((_, handler)) = self.subscribers.iter_mut().find(|(i, _)| *i == id) {
                handler(args.clone());
            }
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<Args: Clone> Default for Event<Args> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bare labelled-state holder. Unlike a validating transition table, `transition` always
/// succeeds; callers are responsible for only requesting legal transitions, matching how the
/// reference source uses its `StateMachine<S>`.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine<S: Copy + PartialEq> {
    state: S,
}

impl<S: Copy + PartialEq> StateMachine<S> {
    /// Start the machine in `initial`.
    pub fn new(initial: S) -> Self {
        Self { state: initial }
    }

    /// The current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Whether the machine is currently in state `s`.
    pub fn is(&self, s: S) -> bool {
        self.state == s
    }

    /// Unconditionally move to a new state.
    pub fn transition(&mut self, s: S) {
        self.state = s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn subscribers_fire_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut event: Event<u32> = Event::new();

        let o1 = order.clone();
        event.subscribe(move |v| o1.borrow_mut().push((1, v)));
        let o2 = order.clone();
        event.subscribe(move |v| o2.borrow_mut().push((2, v)));

        event.emit(42);

        assert_eq!(*order.borrow(), vec![(1, 42), (2, 42)]);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let calls = Rc::new(RefCell::new(0));
        let mut event: Event<()> = Event::new();
        let c = calls.clone();
        let handle = event.subscribe(move |_| *c.borrow_mut() += 1);
        event.emit(());
        event.unsubscribe(handle);
        event.emit(());
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn reentrant_emit_does_not_panic_or_double_fire_current_pass() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let event: Rc<RefCell<Event<u32>>> = Rc::new(RefCell::new(Event::new()));

        let log1 = log.clone();
        let event1 = event.clone();
        event.borrow_mut().subscribe(move |v| {
            log1.borrow_mut().push(v);
            if v == 1 {
                event1.borrow_mut().emit(2);
            }
        });

        event.borrow_mut().emit(1);
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
    }

    #[test]
    fn state_machine_transitions_unconditionally() {
        let mut sm = StateMachine::new(Light::Red);
        assert!(sm.is(Light::Red));
        sm.transition(Light::Green);
        assert_eq!(sm.state(), Light::Green);
    }
}
