//! Push-style audio sink interface.
//!
//! Decoders, the mixer and the resampler adapter all write PCM through
//! [`AudioSink::play`]. The hardware output, mixer sources and the resampler adapter
//! implement the trait, so stages can be stacked freely.

#[cfg(test)]
use std::sync::Mutex;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::format::StreamFormat;

/// Called with `(frames_played, write_timestamp)` whenever the sink hands frames to hardware.
pub type PlaybackCallback = Arc<dyn Fn(u32, Instant) + Send + Sync>;

/// Lifecycle of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SinkState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => SinkState::Starting,
            2 => SinkState::Running,
            3 => SinkState::Stopping,
            _ => SinkState::Stopped,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SinkState::Stopped => 0,
            SinkState::Starting => 1,
            SinkState::Running => 2,
            SinkState::Stopping => 3,
        }
    }
}

/// Lock-free holder for a [`SinkState`].
#[derive(Debug)]
pub(crate) struct AtomicSinkState(AtomicU8);

impl AtomicSinkState {
    pub(crate) fn new(state: SinkState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub(crate) fn load(&self) -> SinkState {
        SinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: SinkState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Volume stored as `f32` bits so it can be shared without a lock.
#[derive(Debug)]
pub(crate) struct AtomicVolume(AtomicU32);

impl AtomicVolume {
    pub(crate) fn new(volume: f32) -> Self {
        Self(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()))
    }

    pub(crate) fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn store(&self, volume: f32) {
        self.0.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

/// A consumer of PCM audio.
///
/// All methods take `&self`; implementations use interior mutability because a sink is
/// shared between the producing worker, its own worker and the polling thread.
pub trait AudioSink: Send + Sync {
    /// Queue PCM bytes in the current stream format, waiting up to `timeout` for room.
    ///
    /// Returns the number of bytes accepted. A stopped sink starts itself.
    fn play(&self, data: &[u8], timeout: Duration) -> usize;

    fn set_stream_format(&self, format: StreamFormat);
    fn stream_format(&self) -> StreamFormat;

    fn start(&self);
    /// Stop immediately, discarding buffered audio.
    fn stop(&self);
    /// Play out buffered audio, then stop.
    fn finish(&self) {
        self.stop();
    }

    fn state(&self) -> SinkState;
    fn is_running(&self) -> bool {
        self.state() == SinkState::Running
    }
    fn is_stopped(&self) -> bool {
        self.state() == SinkState::Stopped
    }

    fn has_buffered_data(&self) -> bool;

    fn set_pause_state(&self, _paused: bool) {}
    fn pause_state(&self) -> bool {
        false
    }

    fn set_volume(&self, volume: f32);
    fn volume(&self) -> f32;
    fn set_mute_state(&self, muted: bool);
    fn mute_state(&self) -> bool;

    fn add_playback_callback(&self, callback: PlaybackCallback);

    /// Advance the sink's own state machine. Call regularly from the polling thread.
    fn process_state(&self) {}
}

/// In-memory sink that accepts PCM and reports it as played immediately, so tests can
/// observe the exact bytes a stage produced.
#[cfg(test)]
pub(crate) struct MemorySink {
    format: Mutex<StreamFormat>,
    state: AtomicSinkState,
    data: Mutex<Vec<u8>>,
    limit: Option<usize>,
    paused: AtomicBool,
    volume: AtomicVolume,
    muted: AtomicBool,
    callbacks: Mutex<Vec<PlaybackCallback>>,
    finish_calls: AtomicU32,
    stop_calls: AtomicU32,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Sink that discards captured bytes beyond `limit`, so long runs do not grow memory.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            format: Mutex::new(StreamFormat::default()),
            state: AtomicSinkState::new(SinkState::Stopped),
            data: Mutex::new(Vec::new()),
            limit,
            paused: AtomicBool::new(false),
            volume: AtomicVolume::new(1.0),
            muted: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            finish_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    /// Copy of every byte captured so far.
    pub fn captured(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn captured_len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn finish_calls(&self) -> u32 {
        self.finish_calls.load(Ordering::Relaxed)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl AudioSink for MemorySink {
    fn play(&self, data: &[u8], _timeout: Duration) -> usize {
        if self.is_stopped() {
            self.start();
        }
        let frames = self.format.lock().unwrap().bytes_to_frames(data.len());
        {
            let mut buf = self.data.lock().unwrap();
            let keep = match self.limit {
                Some(limit) => data.len().min(limit.saturating_sub(buf.len())),
                None => data.len(),
            };
            buf.extend_from_slice(&data[..keep]);
        }
        if frames > 0 {
            let now = Instant::now();
            for cb in self.callbacks.lock().unwrap().iter() {
                cb(frames, now);
            }
        }
        data.len()
    }

    fn set_stream_format(&self, format: StreamFormat) {
        *self.format.lock().unwrap() = format;
    }

    fn stream_format(&self) -> StreamFormat {
        *self.format.lock().unwrap()
    }

    fn start(&self) {
        self.state.store(SinkState::Running);
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::Relaxed);
        self.state.store(SinkState::Stopped);
    }

    fn finish(&self) {
        self.finish_calls.fetch_add(1, Ordering::Relaxed);
        self.state.store(SinkState::Stopped);
    }

    fn state(&self) -> SinkState {
        self.state.load()
    }

    fn has_buffered_data(&self) -> bool {
        false
    }

    fn set_pause_state(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn pause_state(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_volume(&self, volume: f32) {
        self.volume.store(volume);
    }

    fn volume(&self) -> f32 {
        self.volume.load()
    }

    fn set_mute_state(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn mute_state(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    fn add_playback_callback(&self, callback: PlaybackCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }
}
