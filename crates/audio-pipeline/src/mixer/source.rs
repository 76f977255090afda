use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use super::Mixer;
use super::ducking::Ducking;
use crate::config::MixerConfig;
use crate::error::PipelineError;
use crate::format::StreamFormat;
use crate::ring_buffer::RingBuffer;
use crate::sink::{AtomicSinkState, AudioSink, PlaybackCallback, SinkState};
use crate::transfer::SourceTransferWindow;

const TRANSFER_BUFFER_DURATION_MS: u32 = 50;

/// One input of a [`Mixer`]. Producers write to it like any other sink.
pub struct MixerSource {
    index: usize,
    mixer: Weak<Mixer>,
    buffer_duration_ms: u32,
    timeout: Option<Duration>,
    state: AtomicSinkState,
    format: Mutex<StreamFormat>,
    ring: Mutex<Option<Arc<RingBuffer>>>,
    /// Read side of `ring`; only the mixer worker drains it.
    pub(super) window: Mutex<Option<SourceTransferWindow>>,
    ducking: Mutex<Ducking>,
    pending_playback_frames: AtomicU32,
    callbacks: Mutex<Vec<PlaybackCallback>>,
    last_seen_data: Mutex<Instant>,
    stop_gracefully: AtomicBool,
    paused: AtomicBool,
}

impl MixerSource {
    pub(super) fn new(index: usize, mixer: Weak<Mixer>, config: &MixerConfig) -> Self {
        Self {
            index,
            mixer,
            buffer_duration_ms: config.source_buffer_ms,
            timeout: config.source_timeout_ms.map(|ms| Duration::from_millis(ms as u64)),
            state: AtomicSinkState::new(SinkState::Stopped),
            format: Mutex::new(StreamFormat::default()),
            ring: Mutex::new(None),
            window: Mutex::new(None),
            ducking: Mutex::new(Ducking::default()),
            pending_playback_frames: AtomicU32::new(0),
            callbacks: Mutex::new(Vec::new()),
            last_seen_data: Mutex::new(Instant::now()),
            stop_gracefully: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Move towards `db_reduction` dB of attenuation over `duration_ms`.
    pub fn apply_ducking(&self, db_reduction: u8, duration_ms: u32) {
        let samples = self.stream_format().ms_to_samples(duration_ms);
        self.ducking.lock().unwrap().apply(db_reduction, samples);
        tracing::debug!(source = self.index, db_reduction, duration_ms, "ducking");
    }

    /// Pull new bytes from the ring into `window` and duck only those bytes.
    pub(super) fn process_data_from_source(&self, window: &mut SourceTransferWindow) -> usize {
        // Everything already in the window was ducked when it arrived.
        window.shift_to_start();
        let already_ducked = window.available();
        let bytes_read = window.transfer_from_source(Duration::ZERO, false);
        if bytes_read > 0 {
            let data = window.data_mut();
            self.ducking
                .lock()
                .unwrap()
                .duck(&mut data[already_ducked..already_ducked + bytes_read]);
        }
        bytes_read
    }

    pub(super) fn add_pending_frames(&self, frames: u32) {
        self.pending_playback_frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Called for frames the output played; forwards the share that came from this source.
    pub(super) fn on_output_played(&self, new_frames: u32, timestamp: Instant) {
        let mut played = 0;
        let _ = self
            .pending_playback_frames
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pending| {
                played = new_frames.min(pending);
                Some(pending - played)
            });
        if played > 0 {
            for callback in self.callbacks.lock().unwrap().iter() {
                callback(played, timestamp);
            }
        }
    }

    fn start_(&self) -> Result<(), PipelineError> {
        let mixer = self.mixer.upgrade().ok_or(PipelineError::InvalidState)?;
        let format = self.stream_format();
        {
            let mut window = self.window.lock().unwrap();
            if window.is_none() {
                let mut ring = self.ring.lock().unwrap();
                let ring = ring.get_or_insert_with(|| {
                    Arc::new(RingBuffer::new(format.ms_to_bytes(self.buffer_duration_ms)))
                });
                let mut new_window =
                    SourceTransferWindow::new(format.ms_to_bytes(TRANSFER_BUFFER_DURATION_MS));
                new_window.set_source(ring);
                *window = Some(new_window);
            }
        }
        self.pending_playback_frames.store(0, Ordering::Relaxed);
        mixer.start(format)
    }

    fn stop_(&self) {
        *self.window.lock().unwrap() = None;
        *self.ring.lock().unwrap() = None;
    }
}

impl AudioSink for MixerSource {
    fn play(&self, data: &[u8], timeout: Duration) -> usize {
        if self.is_stopped() {
            self.start();
        }
        // The ring exists only once the source has been started from the polling thread.
        let Some(ring) = self.ring.lock().unwrap().clone() else {
            std::thread::sleep(timeout);
            return 0;
        };
        let written = ring.write_without_replacement(data, timeout);
        if written > 0 {
            *self.last_seen_data.lock().unwrap() = Instant::now();
        }
        written
    }

    fn set_stream_format(&self, format: StreamFormat) {
        *self.format.lock().unwrap() = format;
    }

    fn stream_format(&self) -> StreamFormat {
        *self.format.lock().unwrap()
    }

    fn start(&self) {
        self.state.store(SinkState::Starting);
    }

    fn stop(&self) {
        if self.state() != SinkState::Stopped {
            self.state.store(SinkState::Stopping);
        }
    }

    fn finish(&self) {
        self.stop_gracefully.store(true, Ordering::Relaxed);
    }

    fn state(&self) -> SinkState {
        self.state.load()
    }

    fn has_buffered_data(&self) -> bool {
        self.window
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(SourceTransferWindow::has_buffered_data)
    }

    fn set_pause_state(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn pause_state(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_volume(&self, volume: f32) {
        if let Some(mixer) = self.mixer.upgrade() {
            mixer.output().set_volume(volume);
        }
    }

    fn volume(&self) -> f32 {
        self.mixer.upgrade().map_or(1.0, |mixer| mixer.output().volume())
    }

    fn set_mute_state(&self, muted: bool) {
        if let Some(mixer) = self.mixer.upgrade() {
            mixer.output().set_mute_state(muted);
        }
    }

    fn mute_state(&self) -> bool {
        self.mixer.upgrade().is_some_and(|mixer| mixer.output().mute_state())
    }

    fn add_playback_callback(&self, callback: PlaybackCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    fn process_state(&self) {
        match self.state() {
            SinkState::Starting => match self.start_() {
                Ok(()) => {
                    self.state.store(SinkState::Running);
                    self.stop_gracefully.store(false, Ordering::Relaxed);
                    *self.last_seen_data.lock().unwrap() = Instant::now();
                }
                Err(e) => {
                    tracing::error!(source = self.index, "failed to start mixer: {e}");
                    self.state.store(SinkState::Stopping);
                }
            },
            SinkState::Running => {
                if !self.has_buffered_data() {
                    let timed_out = self
                        .timeout
                        .is_some_and(|t| self.last_seen_data.lock().unwrap().elapsed() > t);
                    if timed_out || self.stop_gracefully.load(Ordering::Relaxed) {
                        self.state.store(SinkState::Stopping);
                    }
                }
            }
            SinkState::Stopping => {
                self.stop_();
                self.stop_gracefully.store(false, Ordering::Relaxed);
                self.state.store(SinkState::Stopped);
            }
            SinkState::Stopped => {}
        }
    }
}
