//! Bounded tail of a session's raw output.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::ansi::strip_ansi;

/// Raw bytes kept per displayed character; covers multi-byte UTF-8 and escapes.
const BYTES_PER_CHAR: usize = 4;

#[derive(Debug, Default)]
struct Tail {
    bytes: VecDeque<u8>,
    epoch: u64,
}

/// Most recent output of one session, capped in size.
///
/// The epoch increases with every append so callers can tell whether a
/// classification refers to output they have already acted on.
#[derive(Debug)]
pub struct OutputWindow {
    max_chars: usize,
    tail: Mutex<Tail>,
}

impl OutputWindow {
    /// Window holding at most `max_chars` characters of stripped text.
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
            tail: Mutex::new(Tail::default()),
        }
    }

    fn tail(&self) -> MutexGuard<'_, Tail> {
        self.tail.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a chunk, dropping the oldest bytes beyond the cap.
    pub fn push(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let cap = self.max_chars.saturating_mul(BYTES_PER_CHAR);
        let mut tail = self.tail();
        let keep = chunk.len().min(cap);
        tail.bytes.extend(&chunk[chunk.len() - keep..]);
        let excess = tail.bytes.len().saturating_sub(cap);
        tail.bytes.drain(..excess);
        tail.epoch += 1;
    }

    /// Stripped text of the last `max_chars` characters.
    #[must_use]
    pub fn text(&self) -> String {
        let raw: Vec<u8> = self.tail().bytes.iter().copied().collect();
        let text = strip_ansi(&raw);
        let count = text.chars().count();
        if count <= self.max_chars {
            return text;
        }
        text.chars().skip(count - self.max_chars).collect()
    }

    /// Number of appends seen so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.tail().epoch
    }

    /// Drop buffered output, keeping the epoch.
    pub fn clear(&self) {
        self.tail().bytes.clear();
    }
}
