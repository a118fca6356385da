//! Scrollback of structured console lines.

use crate::data::StructuredMessage;
use crate::history::{BoundedHistoryBuffer, RemoveListenerId};

pub const DEFAULT_SCROLLBACK: usize = 200;

/// Bounded scrollback; the view drops its rendered row whenever a line is
/// evicted here.
pub struct ConsoleLog {
    lines: BoundedHistoryBuffer<StructuredMessage>,
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

impl ConsoleLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: BoundedHistoryBuffer::new(max_lines),
        }
    }

    pub fn push(&mut self, message: StructuredMessage) -> Option<StructuredMessage> {
        self.lines.push(message)
    }

    pub fn on_evict(
        &mut self,
        listener: impl FnMut(&StructuredMessage) + Send + 'static,
    ) -> RemoveListenerId {
        self.lines.on_remove(listener)
    }

    /// Detach a listener registered with [`on_evict`](Self::on_evict).
    pub fn remove_evict_listener(&mut self, id: RemoveListenerId) -> bool {
        self.lines.remove_listener(id)
    }

    /// Forget every line without firing eviction listeners.
    pub fn clear(&mut self) {
        self.lines.reset();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> impl Iterator<Item = &StructuredMessage> {
        self.lines.iter()
    }

    /// Lines rendered as `[channel] message`, oldest first.
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|m| format!("[{}] {}", m.channel, m.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn line(channel: &str, message: &str) -> StructuredMessage {
        StructuredMessage {
            channel: channel.into(),
            message: message.into(),
        }
    }

    #[test]
    fn scrollback_is_bounded() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let mut log = ConsoleLog::new(2);
        log.on_evict(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        log.push(line("citizen-server-impl", "Started resource chat"));
        log.push(line("resources", "Scanning resources."));
        log.push(line("script:chat", "ready"));

        assert_eq!(log.len(), 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(
            log.render(),
            "[resources] Scanning resources.\n[script:chat] ready"
        );
    }

    #[test]
    fn detached_view_stops_hearing_evictions() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let mut log = ConsoleLog::new(1);
        let id = log.on_evict(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        log.push(line("svadhesive", "heartbeat"));
        log.push(line("svadhesive", "heartbeat"));
        assert_eq!(evictions.load(Ordering::SeqCst), 1);

        assert!(log.remove_evict_listener(id));
        assert!(!log.remove_evict_listener(id));
        log.push(line("svadhesive", "heartbeat"));
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_is_not_eviction() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let mut log = ConsoleLog::default();
        log.on_evict(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        log.push(line("a", "b"));
        log.clear();
        assert!(log.is_empty());
        assert_eq!(evictions.load(Ordering::SeqCst), 0);
    }
}
