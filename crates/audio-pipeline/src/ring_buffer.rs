//! Thread-safe bounded byte FIFO shared between two pipeline stages.
//!
//! Every hand-off between stages goes through a [`RingBuffer`]:
//! - reader thread → ring → decoder thread
//! - producer (`play()`) → ring → mixer / resampler / output callback
//!
//! Each ring has exactly one producer and one consumer. Reads and writes block for at
//! most the timeout passed by the caller, so a stop request is always observed at the
//! next poll point.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded byte queue with timeout-based blocking.
///
/// ## Design
/// - A single [`Condvar`] signals "state changed" to both sides.
/// - `write` may overwrite the oldest bytes; `write_without_replacement` back-pressures
///   instead and is what every stage uses for audio.
pub struct RingBuffer {
    inner: Mutex<VecDeque<u8>>,
    cv: Condvar,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            cv: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered (best-effort snapshot).
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Bytes that can be written without blocking.
    pub fn free(&self) -> usize {
        self.capacity - self.inner.lock().unwrap().len()
    }

    /// Drop all buffered bytes and wake any blocked writer.
    pub fn reset(&self) {
        self.inner.lock().unwrap().clear();
        self.cv.notify_all();
    }

    /// Read up to `out.len()` bytes, waiting up to `timeout` for at least one byte.
    ///
    /// Returns the number of bytes copied; `0` means the timeout expired on an empty ring.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> usize {
        if out.is_empty() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        while g.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (ng, _timeout) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }

        let n = out.len().min(g.len());
        for (dst, src) in out[..n].iter_mut().zip(g.drain(..n)) {
            *dst = src;
        }
        drop(g);
        self.cv.notify_all();
        n
    }

    /// Write all of `data`, discarding the oldest buffered bytes if there is not enough room.
    ///
    /// Returns the number of bytes accepted (at most `capacity`).
    pub fn write(&self, data: &[u8]) -> usize {
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let mut g = self.inner.lock().unwrap();
        let overflow = (g.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            tracing::debug!(bytes = overflow, "ring buffer overwrote unread data");
            g.drain(..overflow);
        }
        g.extend(data.iter().copied());
        drop(g);
        self.cv.notify_all();
        data.len()
    }

    /// Write as much of `data` as fits, waiting up to `timeout` for space to free up.
    ///
    /// Never overwrites unread bytes. Returns the number of bytes accepted.
    pub fn write_without_replacement(&self, data: &[u8], timeout: Duration) -> usize {
        if data.is_empty() {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut g = self.inner.lock().unwrap();
        while g.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (ng, _timeout) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = ng;
        }

        let n = data.len().min(self.capacity - g.len());
        g.extend(data[..n].iter().copied());
        drop(g);
        self.cv.notify_all();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_times_out_on_empty() {
        let rb = RingBuffer::new(16);
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out, Duration::from_millis(5)), 0);
    }

    #[test]
    fn write_without_replacement_respects_capacity() {
        let rb = RingBuffer::new(4);
        assert_eq!(rb.write_without_replacement(&[1, 2, 3, 4, 5, 6], Duration::ZERO), 4);
        assert_eq!(rb.free(), 0);
        assert_eq!(rb.write_without_replacement(&[7], Duration::from_millis(5)), 0);

        let mut out = [0u8; 8];
        assert_eq!(rb.read(&mut out, Duration::ZERO), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn write_replaces_oldest() {
        let rb = RingBuffer::new(4);
        rb.write(&[1, 2, 3]);
        rb.write(&[4, 5, 6]);
        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out, Duration::ZERO), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn blocked_writer_wakes_when_reader_drains() {
        let rb = Arc::new(RingBuffer::new(2));
        rb.write_without_replacement(&[1, 2], Duration::ZERO);

        let rb_reader = rb.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let mut out = [0u8; 2];
            rb_reader.read(&mut out, Duration::from_millis(100))
        });

        let written = rb.write_without_replacement(&[3], Duration::from_millis(500));
        assert_eq!(written, 1);
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn reset_clears() {
        let rb = RingBuffer::new(8);
        rb.write(&[1, 2, 3]);
        rb.reset();
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.free(), 8);
    }
}
