//! Fixed-capacity history addressed by monotonically increasing keys.
//!
//! Keys survive eviction: the entry pushed as key 5 stays key 5 until it is
//! dropped, no matter how many older entries go first.

use std::collections::VecDeque;

/// Handle returned by [`BoundedHistoryBuffer::on_remove`].
pub type RemoveListenerId = u64;

type RemoveListener<T> = Box<dyn FnMut(&T) + Send>;

pub struct BoundedHistoryBuffer<T> {
    max_length: usize,
    first_key: u64,
    next_key: u64,
    items: VecDeque<T>,
    listeners: Vec<(RemoveListenerId, RemoveListener<T>)>,
    next_listener_id: RemoveListenerId,
}

impl<T> BoundedHistoryBuffer<T> {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            first_key: 0,
            next_key: 0,
            items: VecDeque::with_capacity(max_length.min(1024)),
            listeners: Vec::new(),
            next_listener_id: 1,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Key of the oldest live entry (equal to `next_key` when empty).
    pub fn first_key(&self) -> u64 {
        self.first_key
    }

    /// Key the next pushed entry will receive.
    pub fn next_key(&self) -> u64 {
        self.next_key
    }

    /// Key of the newest live entry.
    pub fn last_key(&self) -> Option<u64> {
        (!self.items.is_empty()).then(|| self.next_key - 1)
    }

    pub fn get(&self, key: u64) -> Option<&T> {
        let offset = key.checked_sub(self.first_key)?;
        self.items.get(usize::try_from(offset).ok()?)
    }

    /// Live entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Register a listener that sees every evicted entry. Listeners run in
    /// registration order.
    pub fn on_remove(&mut self, listener: impl FnMut(&T) + Send + 'static) -> RemoveListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Unregister a listener; `false` when `id` is unknown.
    pub fn remove_listener(&mut self, id: RemoveListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() < before
    }

    /// Append `item`, evicting the oldest entry first when full. Returns the
    /// evicted entry after every listener has seen it.
    ///
    /// With a capacity of zero the pushed item itself is evicted.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.max_length == 0 {
            self.first_key += 1;
            self.next_key += 1;
            self.notify(&item);
            return Some(item);
        }

        let evicted = if self.items.len() >= self.max_length {
            let dropped = self.items.pop_front();
            self.first_key += 1;
            if let Some(dropped) = &dropped {
                self.notify(dropped);
            }
            dropped
        } else {
            None
        };

        self.items.push_back(item);
        self.next_key += 1;
        evicted
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.push(item);
        }
    }

    /// Drop every entry and restart the key space. Removal listeners are not
    /// notified; a bulk clear is not an eviction.
    pub fn reset(&mut self) {
        self.items.clear();
        self.first_key = 0;
        self.next_key = 0;
    }

    fn notify(&mut self, item: &T) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(item);
        }
    }
}
