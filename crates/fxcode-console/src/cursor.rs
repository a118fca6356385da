//! Up/down recall over submitted console commands.

use crate::history::BoundedHistoryBuffer;

pub const DEFAULT_COMMAND_HISTORY: usize = 200;

/// Submitted commands plus a recall cursor.
///
/// The cursor lives in `[first_key, next_key]`; `next_key` is the write head,
/// meaning "not recalling anything".
pub struct CommandHistoryCursor {
    entries: BoundedHistoryBuffer<String>,
    ptr: u64,
}

impl Default for CommandHistoryCursor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_HISTORY)
    }
}

impl CommandHistoryCursor {
    pub fn new(max_length: usize) -> Self {
        Self {
            entries: BoundedHistoryBuffer::new(max_length),
            ptr: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the cursor is parked at the write head.
    pub fn at_head(&self) -> bool {
        self.ptr == self.entries.next_key()
    }

    /// Record `cmd` if the cursor is at the write head. While recalling, the
    /// call only returns the cursor to the head.
    pub fn push(&mut self, cmd: impl Into<String>) {
        if !self.at_head() {
            self.reset_state();
            return;
        }
        self.entries.push(cmd.into());
        self.reset_state();
    }

    /// Move one entry back. Past the oldest entry the oldest is returned
    /// again.
    pub fn step_back(&mut self) -> Option<&str> {
        if self.ptr > self.entries.first_key() {
            self.ptr -= 1;
        } else {
            self.ptr = self.entries.first_key();
        }
        self.entries.get(self.ptr).map(String::as_str)
    }

    /// Move one entry forward. Returns `None` at the write head.
    pub fn step_forward(&mut self) -> Option<&str> {
        if self.ptr >= self.entries.next_key() {
            return None;
        }
        self.ptr += 1;
        self.entries.get(self.ptr).map(String::as_str)
    }

    pub fn reset_state(&mut self) {
        self.ptr = self.entries.next_key();
    }

    /// Commands oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}
