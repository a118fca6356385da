//! Byte-bounded buffer for raw server console output.
//!
//! Keeps the last N bytes so the console panel can be reopened with recent
//! scrollback without the UI holding the whole server log.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Write position (wraps around).
    write_pos: usize,
    /// Total bytes ever written (used to detect wrap).
    total_written: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append output, overwriting the oldest bytes if full.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        // Only the tail of an oversized write can survive.
        let data = if data.len() > self.capacity {
            self.total_written += (data.len() - self.capacity) as u64;
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let first = data.len().min(self.capacity - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = &data[first..];
        self.buf[..rest.len()].copy_from_slice(rest);
        self.write_pos = (self.write_pos + data.len()) % self.capacity;
        self.total_written += data.len() as u64;
    }

    /// All buffered bytes, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        let len = self.len();
        let mut result = Vec::with_capacity(len);
        if self.total_written <= self.capacity as u64 {
            result.extend_from_slice(&self.buf[..len]);
        } else {
            result.extend_from_slice(&self.buf[self.write_pos..]);
            result.extend_from_slice(&self.buf[..self.write_pos]);
        }
        result
    }

    /// Buffered output as text. A multi-byte character cut by the wrap is
    /// dropped rather than rendered as garbage.
    pub fn text(&self) -> String {
        let bytes = self.read_all();
        let start = if self.total_written > self.capacity as u64 {
            bytes
                .iter()
                .position(|b| (*b & 0xC0) != 0x80)
                .unwrap_or(bytes.len())
        } else {
            0
        };
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_written == 0 || self.capacity == 0
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.total_written = 0;
    }
}
