//! Single-topic callback list used for the data service's change events.

/// Type alias for subscription callback ID.
pub type SubscriptionId = u64;

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

pub struct Signal<T> {
    subscribers: Vec<(SubscriptionId, Callback<T>)>,
    next_id: SubscriptionId,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe. Returns an ID for unsubscribing.
    pub fn subscribe(&mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Unsubscribe by ID. Returns true if found.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() < before
    }

    pub fn emit(&self, value: &T) {
        for (_, callback) in &self.subscribers {
            callback(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn subscribe_emit_unsubscribe() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut signal = Signal::<u8>::new();
        let id = signal.subscribe(move |v| sink.lock().unwrap().push(*v));

        signal.emit(&1);
        assert!(signal.unsubscribe(id));
        assert!(!signal.unsubscribe(id));
        signal.emit(&2);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(signal.subscriber_count(), 0);
    }
}
