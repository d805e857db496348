//! Minimal publish/subscribe subject used by every stateful component.
//!
//! Observers run synchronously on the engine thread, in subscription order, once per
//! published event. Events are delivered in the order the owning component applied its
//! mutations.

/// Handle returned by [`Subject::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer<E> = Box<dyn FnMut(&E)>;

/// Ordered list of observers for one event type.
pub struct Subject<E> {
    next_id: u64,
    observers: Vec<(SubscriptionId, Observer<E>)>,
}

impl<E> Default for Subject<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Subject<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            observers: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: FnMut(&E) + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns `false` if the id was unknown (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn notify(&mut self, event: &E) {
        for (_, observer) in self.observers.iter_mut() {
            observer(event);
        }
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::Subject;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_observers_receive_events_in_publish_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut subject = Subject::new();
        let sink = Rc::clone(&seen);
        subject.subscribe(move |value: &u32| sink.borrow_mut().push(*value));

        subject.notify(&1);
        subject.notify(&2);
        subject.notify(&3);

        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery_and_is_idempotent() {
        let count = Rc::new(RefCell::new(0));
        let mut subject = Subject::new();
        let counter = Rc::clone(&count);
        let id = subject.subscribe(move |_: &()| *counter.borrow_mut() += 1);

        subject.notify(&());
        assert!(subject.unsubscribe(id));
        assert!(!subject.unsubscribe(id));
        subject.notify(&());

        assert_eq!(*count.borrow(), 1);
        assert_eq!(subject.observer_count(), 0);
    }
}
