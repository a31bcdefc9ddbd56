//! Inbound byte accumulation with newline framing.
//!
//! Bytes are appended as they arrive and drained from the front as they are
//! echoed. A line is only ever handed out once its terminating `\n` has been
//! received, so a send never spans a line that is still waiting for input.

use bytes::{Buf, BytesMut};

/// Initial capacity of a connection's inbound buffer.
const INITIAL_CAPACITY: usize = 4096;

/// Append-only byte accumulator drained one complete line at a time.
#[derive(Debug, Default)]
pub struct LineBuffer {
    data: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Append received bytes to the end of the buffer.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// The first complete line, including its terminating newline.
    ///
    /// Returns `None` while the buffered bytes contain no newline.
    pub fn next_line(&self) -> Option<&[u8]> {
        find_newline(&self.data).map(|pos| &self.data[..=pos])
    }

    /// True if at least one complete line is buffered.
    pub fn has_line(&self) -> bool {
        find_newline(&self.data).is_some()
    }

    /// Drop `cnt` bytes from the front of the buffer.
    ///
    /// Only bytes the transport actually accepted are consumed; anything
    /// left over stays at the front for the next attempt.
    pub fn consume(&mut self, cnt: usize) {
        let cnt = cnt.min(self.data.len());
        self.data.advance(cnt);
    }

    /// Everything currently buffered, complete lines and partial tail alike.
    #[cfg(test)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Position of the first `\n` in the buffer.
fn find_newline(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
