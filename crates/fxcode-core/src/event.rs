//! Reference-counted event emitter.
//!
//! An [`Emitter`] hands out [`Listener`] streams. Optional hooks run when the
//! first listener attaches and when the last one detaches, which is how
//! channels tie an underlying resource (a file watch, a streamed read) to the
//! lifetime of its subscribers.

use futures_util::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

type Hook = Arc<dyn Fn() + Send + Sync>;

struct Shared<T> {
    listeners: Vec<(u64, mpsc::UnboundedSender<T>)>,
    next_id: u64,
    on_first: Option<Hook>,
    on_last: Option<Hook>,
    disposed: bool,
}

pub struct Emitter<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                listeners: Vec::new(),
                next_id: 0,
                on_first: None,
                on_last: None,
                disposed: false,
            })),
        }
    }

    /// Run `hook` whenever the listener count goes from zero to one.
    pub fn on_first_listener(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        if let Ok(mut shared) = self.shared.lock() {
            shared.on_first = Some(Arc::new(hook));
        }
        self
    }

    /// Run `hook` whenever the listener count drops back to zero.
    pub fn on_last_listener(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        if let Ok(mut shared) = self.shared.lock() {
            shared.on_last = Some(Arc::new(hook));
        }
        self
    }

    /// Attach a new listener. A disposed emitter yields a stream that ends
    /// immediately.
    pub fn subscribe(&self) -> Listener<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut first_hook = None;
        let id = match self.shared.lock() {
            Ok(mut shared) if !shared.disposed => {
                if shared.listeners.is_empty() {
                    first_hook = shared.on_first.clone();
                }
                let id = shared.next_id;
                shared.next_id += 1;
                shared.listeners.push((id, tx));
                Some(id)
            }
            _ => None,
        };
        if let Some(hook) = first_hook {
            hook();
        }
        Listener {
            id,
            rx,
            shared: self.shared.clone(),
        }
    }

    /// A handle that can fire without keeping the emitter alive.
    pub fn downgrade(&self) -> WeakEmitter<T> {
        WeakEmitter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Deliver `value` to every attached listener.
    pub fn fire(&self, value: T) {
        let Ok(mut shared) = self.shared.lock() else {
            return;
        };
        shared
            .listeners
            .retain(|(_, tx)| tx.send(value.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.shared.lock().map(|s| s.listeners.len()).unwrap_or(0)
    }

    /// Detach every listener (their streams end) without running the
    /// last-listener hook. Later subscriptions end immediately.
    pub fn dispose(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.disposed = true;
            shared.listeners.clear();
        }
    }
}

/// Emitter handle held by producers; firing after every listener and
/// emitter handle is gone is a no-op.
pub struct WeakEmitter<T> {
    shared: Weak<Mutex<Shared<T>>>,
}

impl<T> Clone for WeakEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> WeakEmitter<T> {
    pub fn fire(&self, value: T) {
        if let Some(shared) = self.shared.upgrade() {
            Emitter { shared }.fire(value);
        }
    }
}

/// Subscription handle; keeps its emitter alive and detaches on drop.
pub struct Listener<T> {
    id: Option<u64>,
    rx: mpsc::UnboundedReceiver<T>,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Stream for Listener<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Listener<T> {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        let last_hook = {
            let Ok(mut shared) = self.shared.lock() else {
                return;
            };
            let before = shared.listeners.len();
            shared.listeners.retain(|(lid, _)| *lid != id);
            let removed = before != shared.listeners.len();
            if removed && shared.listeners.is_empty() {
                shared.on_last.clone()
            } else {
                None
            }
        };
        if let Some(hook) = last_hook {
            hook();
        }
    }
}
