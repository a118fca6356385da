//! Console command line: submit on Enter, recall with the arrow keys.

use crate::cursor::CommandHistoryCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    ArrowUp,
    ArrowDown,
    Other,
}

/// Text input state for the console panel.
///
/// Recall only replaces the text while the input is not dirty, so a
/// half-typed command is never clobbered by an arrow key.
#[derive(Default)]
pub struct ConsoleInput {
    value: String,
    dirty: bool,
    history: CommandHistoryCursor,
}

impl ConsoleInput {
    pub fn new(history: CommandHistoryCursor) -> Self {
        Self {
            value: String::new(),
            dirty: false,
            history,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn history(&self) -> &CommandHistoryCursor {
        &self.history
    }

    /// Replace the text as the user types it.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.handle_key(Key::Other);
    }

    /// React to a key press. Returns the command to send when Enter submits
    /// a non-blank line.
    pub fn handle_key(&mut self, key: Key) -> Option<String> {
        match key {
            Key::Enter => {
                self.dirty = false;
                let cmd = self.value.trim().to_string();
                if cmd.is_empty() {
                    return None;
                }
                self.value.clear();
                self.history.push(cmd.clone());
                Some(cmd)
            }
            Key::ArrowUp => {
                if !self.dirty {
                    self.value = self.history.step_back().unwrap_or_default().to_string();
                }
                None
            }
            Key::ArrowDown => {
                if !self.dirty {
                    self.value = self.history.step_forward().unwrap_or_default().to_string();
                }
                None
            }
            Key::Other => {
                self.dirty = !self.value.trim().is_empty();
                None
            }
        }
    }
}
