//! Staging buffers between ring buffers and processing stages.
//!
//! A [`TransferWindow`] is a fixed-capacity buffer with a movable unread region. Stages
//! consume from the front of the region and append at its tail; shifting the region
//! back to the buffer start is the only O(n) move, and every caller can opt out of it.
//!
//! Two wrappers attach the window to its external collaborator:
//! - [`SourceTransferWindow`] fills itself from a [`RingBuffer`].
//! - [`SinkTransferWindow`] drains itself into an [`AudioSink`] or a [`RingBuffer`].

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::ring_buffer::RingBuffer;
use crate::sink::AudioSink;

/// Fixed-capacity byte buffer with an unread window `[start, start + len)`.
#[derive(Debug, Default)]
pub struct TransferWindow {
    buffer: Vec<u8>,
    start: usize,
    len: usize,
}

impl TransferWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Unread bytes in the window.
    pub fn available(&self) -> usize {
        self.len
    }

    /// Bytes that can be appended at the tail without shifting.
    pub fn free(&self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        self.buffer.len() - (self.len + self.start)
    }

    /// Offset of the window start from the buffer start.
    pub fn offset(&self) -> usize {
        self.start
    }

    /// The unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.start..self.start + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.start..self.start + self.len]
    }

    /// The writable region after the unread bytes.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let end = self.start + self.len;
        &mut self.buffer[end..]
    }

    /// The unread bytes and the writable tail at once.
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let end = self.start + self.len;
        let (head, tail) = self.buffer.split_at_mut(end);
        (&mut head[self.start..], tail)
    }

    /// Mark `bytes` at the front of the window as consumed.
    pub fn decrease_length(&mut self, bytes: usize) {
        let bytes = bytes.min(self.len);
        self.len -= bytes;
        if self.len > 0 {
            self.start += bytes;
        } else {
            self.start = 0;
        }
    }

    /// Mark `bytes` written into [`tail_mut`](Self::tail_mut) as unread data.
    pub fn increase_length(&mut self, bytes: usize) {
        self.len = (self.len + bytes).min(self.buffer.len() - self.start);
    }

    /// Move the unread bytes to the buffer start.
    pub fn shift_to_start(&mut self) {
        if self.start > 0 {
            self.buffer.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Replace the buffer with one of `capacity` bytes.
    ///
    /// Fails without changing anything while unread data is pending.
    pub fn reallocate(&mut self, capacity: usize) -> bool {
        if self.len > 0 {
            return false;
        }
        self.buffer = vec![0; capacity];
        self.start = 0;
        true
    }
}

/// A window that fills itself from a ring buffer.
#[derive(Default)]
pub struct SourceTransferWindow {
    window: TransferWindow,
    source: Option<Weak<RingBuffer>>,
}

impl SourceTransferWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: TransferWindow::new(capacity),
            source: None,
        }
    }

    pub fn set_source(&mut self, ring: &Arc<RingBuffer>) {
        self.source = Some(Arc::downgrade(ring));
    }

    fn source(&self) -> Option<Arc<RingBuffer>> {
        self.source.as_ref().and_then(Weak::upgrade)
    }

    /// Read from the source ring into the free tail, waiting up to `timeout`.
    ///
    /// With `pre_shift` the unread bytes are first moved to the buffer start, maximising
    /// the space available for the read. Returns the number of bytes read.
    pub fn transfer_from_source(&mut self, timeout: Duration, pre_shift: bool) -> usize {
        if pre_shift {
            self.window.shift_to_start();
        }
        let Some(ring) = self.source() else {
            return 0;
        };
        if self.window.free() == 0 {
            return 0;
        }
        let n = ring.read(self.window.tail_mut(), timeout);
        self.window.increase_length(n);
        n
    }

    /// Unread bytes in the window or in the source ring.
    pub fn has_buffered_data(&self) -> bool {
        if self.window.available() > 0 {
            return true;
        }
        self.source().is_some_and(|ring| ring.available() > 0)
    }

    pub fn clear_buffered_data(&mut self) {
        self.window.clear();
        if let Some(ring) = self.source() {
            ring.reset();
        }
    }
}

impl Deref for SourceTransferWindow {
    type Target = TransferWindow;

    fn deref(&self) -> &TransferWindow {
        &self.window
    }
}

impl DerefMut for SourceTransferWindow {
    fn deref_mut(&mut self) -> &mut TransferWindow {
        &mut self.window
    }
}

/// A window that drains itself into an [`AudioSink`] or a ring buffer.
#[derive(Default)]
pub struct SinkTransferWindow {
    window: TransferWindow,
    ring: Option<Weak<RingBuffer>>,
    sink: Option<Arc<dyn AudioSink>>,
}

impl SinkTransferWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: TransferWindow::new(capacity),
            ring: None,
            sink: None,
        }
    }

    pub fn set_sink_ring(&mut self, ring: &Arc<RingBuffer>) {
        self.ring = Some(Arc::downgrade(ring));
    }

    pub fn set_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.sink = Some(sink);
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some() || self.ring().is_some()
    }

    fn ring(&self) -> Option<Arc<RingBuffer>> {
        self.ring.as_ref().and_then(Weak::upgrade)
    }

    /// Write the unread bytes to the sink, waiting up to `timeout` for room.
    ///
    /// A push-style sink takes priority over a ring-buffer sink. With `post_shift`
    /// whatever was not accepted is moved back to the buffer start. Returns the number
    /// of bytes written.
    pub fn transfer_to_sink(&mut self, timeout: Duration, post_shift: bool) -> usize {
        if self.window.available() == 0 {
            return 0;
        }
        let written = if let Some(sink) = &self.sink {
            sink.play(self.window.data(), timeout)
        } else if let Some(ring) = self.ring() {
            ring.write_without_replacement(self.window.data(), timeout)
        } else {
            0
        };
        self.window.decrease_length(written);
        if post_shift {
            self.window.shift_to_start();
        }
        written
    }

    /// Unread bytes in the window or still queued downstream.
    pub fn has_buffered_data(&self) -> bool {
        if let Some(sink) = &self.sink {
            return sink.has_buffered_data() || self.window.available() > 0;
        }
        if self.window.available() > 0 {
            return true;
        }
        self.ring().is_some_and(|ring| ring.available() > 0)
    }

    /// Drop pending bytes here and downstream; a push-style sink is stopped.
    pub fn clear_buffered_data(&mut self) {
        self.window.clear();
        if let Some(ring) = self.ring() {
            ring.reset();
        }
        if let Some(sink) = &self.sink {
            sink.stop();
        }
    }
}

impl Deref for SinkTransferWindow {
    type Target = TransferWindow;

    fn deref(&self) -> &TransferWindow {
        &self.window
    }
}

impl DerefMut for SinkTransferWindow {
    fn deref_mut(&mut self) -> &mut TransferWindow {
        &mut self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StreamFormat;
    use crate::sink::MemorySink;

    fn fill(window: &mut TransferWindow, bytes: &[u8]) {
        window.tail_mut()[..bytes.len()].copy_from_slice(bytes);
        window.increase_length(bytes.len());
    }

    #[test]
    fn available_plus_free_is_capacity_when_anchored() {
        let mut w = TransferWindow::new(64);
        assert_eq!(w.available() + w.free(), w.capacity());

        fill(&mut w, &[1; 40]);
        assert_eq!(w.available() + w.free(), w.capacity());

        w.decrease_length(10);
        assert_eq!(w.available() + w.free() + w.offset(), w.capacity());
        w.shift_to_start();
        assert_eq!(w.available() + w.free(), w.capacity());

        w.decrease_length(30);
        assert_eq!(w.offset(), 0);
        assert_eq!(w.available() + w.free(), w.capacity());
    }

    #[test]
    fn window_start_resets_when_drained() {
        let mut w = TransferWindow::new(8);
        fill(&mut w, &[1, 2, 3, 4]);
        w.decrease_length(3);
        assert_eq!(w.data(), &[4]);
        assert_eq!(w.offset(), 3);
        w.decrease_length(1);
        assert_eq!(w.offset(), 0);
        assert_eq!(w.free(), 8);
    }

    #[test]
    fn reallocate_refused_while_pending() {
        let mut w = TransferWindow::new(16);
        fill(&mut w, &[9; 4]);
        assert!(!w.reallocate(32));
        assert_eq!(w.capacity(), 16);
        assert_eq!(w.data(), &[9; 4]);

        w.decrease_length(4);
        assert!(w.reallocate(32));
        assert_eq!(w.capacity(), 32);
    }

    #[test]
    fn zero_capacity_has_no_free_space() {
        let w = TransferWindow::new(0);
        assert_eq!(w.free(), 0);
    }

    #[test]
    fn source_window_shifts_then_reads() {
        let ring = Arc::new(RingBuffer::new(64));
        ring.write(&[1, 2, 3, 4, 5, 6]);

        let mut src = SourceTransferWindow::new(8);
        src.set_source(&ring);
        assert_eq!(src.transfer_from_source(Duration::ZERO, true), 6);
        src.decrease_length(4);
        assert_eq!(src.offset(), 4);

        ring.write(&[7, 8, 9, 10, 11, 12, 13, 14]);
        // Without a shift only the tail (2 bytes) can be filled.
        assert_eq!(src.transfer_from_source(Duration::ZERO, false), 2);
        src.decrease_length(2);
        assert_eq!(src.transfer_from_source(Duration::ZERO, true), 6);
        assert_eq!(src.data(), &[7, 8, 9, 10, 11, 12, 13, 14]);
        assert_eq!(src.available() + src.free(), src.capacity());
        assert!(src.has_buffered_data());
    }

    #[test]
    fn source_window_without_ring_reads_nothing() {
        let mut src = SourceTransferWindow::new(8);
        assert_eq!(src.transfer_from_source(Duration::ZERO, true), 0);
        assert!(!src.has_buffered_data());
    }

    #[test]
    fn sink_window_prefers_push_sink() {
        let ring = Arc::new(RingBuffer::new(64));
        let sink = Arc::new(MemorySink::new());
        sink.set_stream_format(StreamFormat::new(16, 1, 16_000));

        let mut out = SinkTransferWindow::new(16);
        out.set_sink_ring(&ring);
        out.set_sink(sink.clone());
        fill(&mut out, &[1, 2, 3, 4]);

        assert_eq!(out.transfer_to_sink(Duration::ZERO, true), 4);
        assert_eq!(sink.captured(), vec![1, 2, 3, 4]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn sink_window_post_shift_keeps_remainder_at_start() {
        let ring = Arc::new(RingBuffer::new(3));
        let mut out = SinkTransferWindow::new(8);
        out.set_sink_ring(&ring);
        fill(&mut out, &[1, 2, 3, 4, 5]);

        assert_eq!(out.transfer_to_sink(Duration::ZERO, true), 3);
        assert_eq!(out.offset(), 0);
        assert_eq!(out.data(), &[4, 5]);
        assert!(out.has_buffered_data());

        out.clear_buffered_data();
        assert_eq!(out.available(), 0);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn dropped_ring_detaches_window() {
        let ring = Arc::new(RingBuffer::new(8));
        let mut out = SinkTransferWindow::new(8);
        out.set_sink_ring(&ring);
        assert!(out.has_sink());
        drop(ring);
        assert!(!out.has_sink());
        fill(&mut out, &[1]);
        assert_eq!(out.transfer_to_sink(Duration::ZERO, false), 0);
    }
}
