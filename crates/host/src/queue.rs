//! Bounded FIFO of shell commands produced by plugins.
//!
//! The embedder drains it with a caller-supplied buffer; an entry that does
//! not fit is retained so the caller can retry with a bigger buffer. The
//! backing vector compacts once the read cursor passes the halfway mark, so
//! a long session never accumulates dead entries.

use anyhow::{bail, Result};

/// Most commands that may sit in the queue at once.
pub const MAX_QUEUED_COMMANDS: usize = 256;
/// Longest accepted command, in bytes.
pub const MAX_COMMAND_BYTES: usize = 4096;

/// Outcome of a [`CommandQueue::take_into`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeCmd {
    /// Nothing queued.
    Empty,
    /// The entry was copied into the buffer; this many bytes are valid.
    Taken(usize),
    /// The caller's buffer is too small; the entry is retained and needs a
    /// buffer of at least this many bytes.
    TooSmall(usize),
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: Vec<String>,
    read: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&mut self, cmd: &str) -> Result<()> {
        if cmd.len() > MAX_COMMAND_BYTES {
            bail!("command exceeds {MAX_COMMAND_BYTES} bytes");
        }
        if self.len() >= MAX_QUEUED_COMMANDS {
            bail!("command queue is full");
        }
        self.entries.push(cmd.to_string());
        Ok(())
    }

    fn advance(&mut self) {
        self.read += 1;
        if self.read > self.entries.len() / 2 {
            self.entries.drain(..self.read);
            self.read = 0;
        }
    }

    /// Copies the oldest entry into `buf` when it fits.
    pub fn take_into(&mut self, buf: &mut [u8]) -> TakeCmd {
        let Some(entry) = self.entries.get(self.read) else {
            return TakeCmd::Empty;
        };
        let bytes = entry.as_bytes();
        if bytes.len() > buf.len() {
            return TakeCmd::TooSmall(bytes.len());
        }
        let n = bytes.len();
        buf[..n].copy_from_slice(bytes);
        self.advance();
        TakeCmd::Taken(n)
    }

    /// Takes the oldest entry as an owned string.
    pub fn take(&mut self) -> Option<String> {
        if self.read >= self.entries.len() {
            return None;
        }
        let entry = std::mem::take(&mut self.entries[self.read]);
        self.advance();
        Some(entry)
    }
}
