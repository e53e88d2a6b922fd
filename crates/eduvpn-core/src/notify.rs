//! Enter/exit subscriptions for state machine transitions.
//!
//! Interested components register a handler for a state kind and an edge;
//! the model fans out after every transition that changed the state.

use std::fmt;
use std::hash::Hash;

/// A state whose variants can be subscribed to.
pub trait Observable {
    type Kind: Copy + Eq + Hash + fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

/// Which side of a transition a handler fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Enter,
    Exit,
}

/// Returned by [`Notifier::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<S> = Box<dyn Fn(&S) + Send + Sync>;

struct Subscription<S: Observable> {
    id: SubscriptionId,
    kind: S::Kind,
    edge: Edge,
    handler: Handler<S>,
}

/// Registry of transition handlers for one state machine.
pub struct Notifier<S: Observable> {
    next_id: u64,
    subscriptions: Vec<Subscription<S>>,
}

impl<S: Observable> Default for Notifier<S> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscriptions: Vec::new(),
        }
    }
}

impl<S: Observable> fmt::Debug for Notifier<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl<S: Observable> Notifier<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` whenever a state of `kind` is entered or exited.
    pub fn subscribe<F>(&mut self, kind: S::Kind, edge: Edge, handler: F) -> SubscriptionId
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription {
            id,
            kind,
            edge,
            handler: Box::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Fire exit handlers for `old`, then enter handlers for `new`.
    pub fn notify(&self, old: &S, new: &S) {
        self.fire(old, Edge::Exit);
        self.fire(new, Edge::Enter);
    }

    fn fire(&self, state: &S, edge: Edge) {
        let kind = state.kind();
        for sub in self
            .subscriptions
            .iter()
            .filter(|s| s.edge == edge && s.kind == kind)
        {
            (sub.handler)(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
    }

    impl Observable for Light {
        type Kind = Light;

        fn kind(&self) -> Light {
            *self
        }
    }

    #[test]
    fn test_exit_fires_before_enter() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = Notifier::new();
        let l = log.clone();
        notifier.subscribe(Light::Green, Edge::Enter, move |_| l.lock().push("enter green"));
        let l = log.clone();
        notifier.subscribe(Light::Red, Edge::Exit, move |_| l.lock().push("exit red"));
        let l = log.clone();
        notifier.subscribe(Light::Red, Edge::Enter, move |_| l.lock().push("enter red"));

        notifier.notify(&Light::Red, &Light::Green);
        assert_eq!(*log.lock(), vec!["exit red", "enter green"]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let mut notifier = Notifier::new();
        let c = count.clone();
        let id = notifier.subscribe(Light::Green, Edge::Enter, move |_| *c.lock() += 1);

        notifier.notify(&Light::Red, &Light::Green);
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.notify(&Light::Red, &Light::Green);
        assert_eq!(*count.lock(), 1);
    }
}
