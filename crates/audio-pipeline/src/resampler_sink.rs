//! An [`AudioSink`] that converts any incoming PCM to a fixed rate and bit depth before
//! handing it to the next sink.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ResamplerConfig;
use crate::error::PipelineError;
use crate::events::EventGroup;
use crate::format::StreamFormat;
use crate::resample::{RateConverter, ResamplerState};
use crate::ring_buffer::RingBuffer;
use crate::sink::{AtomicSinkState, AudioSink, PlaybackCallback, SinkState};

const TRANSFER_BUFFER_DURATION_MS: u32 = 50;

const COMMAND_STOP: u32 = 1 << 0;
const COMMAND_FINISH: u32 = 1 << 1;
const STATE_STARTING: u32 = 1 << 10;
const STATE_RUNNING: u32 = 1 << 11;
const STATE_STOPPING: u32 = 1 << 12;
const STATE_STOPPED: u32 = 1 << 13;
const ERR_NO_MEM: u32 = 1 << 19;
const ERR_NOT_SUPPORTED: u32 = 1 << 20;
const ERR_FAIL: u32 = 1 << 21;
const ALL_BITS: u32 = 0x00FF_FFFF;

pub struct ResamplerSink {
    this: Weak<ResamplerSink>,
    output: Arc<dyn AudioSink>,
    config: ResamplerConfig,
    state: AtomicSinkState,
    format: Mutex<StreamFormat>,
    target: Mutex<StreamFormat>,
    /// Input ring, present while the worker runs.
    ring: Mutex<Option<Arc<RingBuffer>>>,
    events: EventGroup,
    worker: Mutex<Option<JoinHandle<()>>>,
    callbacks: Mutex<Vec<PlaybackCallback>>,
    callback_remainder: AtomicU64,
    /// Input duration minus output duration consumed by the worker, in milliseconds.
    drift_ms: AtomicI64,
}

impl ResamplerSink {
    pub fn new(output: Arc<dyn AudioSink>, config: ResamplerConfig) -> Arc<Self> {
        let sink = Arc::new_cyclic(|this: &Weak<ResamplerSink>| Self {
            this: this.clone(),
            output,
            config,
            state: AtomicSinkState::new(SinkState::Stopped),
            format: Mutex::new(StreamFormat::default()),
            target: Mutex::new(StreamFormat::default()),
            ring: Mutex::new(None),
            events: EventGroup::new(),
            worker: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            callback_remainder: AtomicU64::new(0),
            drift_ms: AtomicI64::new(0),
        });
        let weak = Arc::downgrade(&sink);
        sink.output.add_playback_callback(Arc::new(move |frames, timestamp| {
            if let Some(sink) = weak.upgrade() {
                sink.on_output_played(frames, timestamp);
            }
        }));
        sink
    }

    pub fn output(&self) -> &Arc<dyn AudioSink> {
        &self.output
    }

    /// Difference between audio consumed and audio produced by the current or last
    /// conversion. Positive while the filter delay holds output back.
    pub fn drift_ms(&self) -> i64 {
        self.drift_ms.load(Ordering::Relaxed)
    }

    fn target_format(&self) -> StreamFormat {
        *self.target.lock().unwrap()
    }

    fn requires_resampling(&self) -> bool {
        let format = self.stream_format();
        format.sample_rate() != self.config.target_sample_rate
            || format.bits_per_sample() != self.config.target_bits_per_sample
    }

    /// Report output frames to our callbacks in source-rate frames.
    fn on_output_played(&self, frames: u32, timestamp: Instant) {
        let source_rate = self.stream_format().sample_rate() as u64;
        let target_rate = self.target_format().sample_rate() as u64;
        let frames = if source_rate != target_rate && target_rate > 0 {
            let mut source_frames = 0;
            let _ = self
                .callback_remainder
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remainder| {
                    let numerator = frames as u64 * source_rate + remainder;
                    source_frames = numerator / target_rate;
                    Some(numerator % target_rate)
                });
            source_frames as u32
        } else {
            frames
        };
        for callback in self.callbacks.lock().unwrap().iter() {
            callback(frames, timestamp);
        }
    }

    fn start_(&self) -> Result<(), PipelineError> {
        let format = self.stream_format();
        let target = StreamFormat::new(
            self.config.target_bits_per_sample,
            format.channels(),
            self.config.target_sample_rate,
        );
        *self.target.lock().unwrap() = target;
        self.callback_remainder.store(0, Ordering::Relaxed);
        self.drift_ms.store(0, Ordering::Relaxed);

        self.output.set_stream_format(target);
        self.output.start();

        if self.requires_resampling() {
            return self.start_worker();
        }
        Ok(())
    }

    fn stop_(&self) {
        if self.worker.lock().unwrap().is_some() {
            self.events.set(COMMAND_STOP);
        }
        self.output.stop();
    }

    fn start_worker(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }
        let sink = self.this.upgrade().ok_or(PipelineError::InvalidState)?;
        let handle = thread::Builder::new()
            .name("resampler".into())
            .spawn(move || sink.run())
            .map_err(|_| PipelineError::InvalidState)?;
        *worker = Some(handle);
        Ok(())
    }

    fn run(&self) {
        self.events.set(STATE_STARTING);
        let format = self.stream_format();
        let target = self.target_format();

        let mut converter = RateConverter::new(
            format.ms_to_bytes(TRANSFER_BUFFER_DURATION_MS),
            target.ms_to_bytes(TRANSFER_BUFFER_DURATION_MS),
        );
        converter.set_chunk_frames(self.config.chunk_frames);

        let started = converter.start(format, target, self.config.taps, self.config.filters);
        match started {
            Ok(()) => {
                let ring = Arc::new(RingBuffer::new(format.ms_to_bytes(self.config.buffer_duration_ms)));
                converter.add_source(&ring);
                *self.ring.lock().unwrap() = Some(ring);
                converter.add_sink(self.output.clone());
                self.events.set(STATE_RUNNING);
            }
            Err(PipelineError::NoMemory) => self.events.set(ERR_NO_MEM),
            Err(PipelineError::NotSupported) => self.events.set(ERR_NOT_SUPPORTED),
            Err(_) => self.events.set(ERR_FAIL),
        }

        if started.is_ok() {
            loop {
                let bits = self.events.get();
                if bits & COMMAND_STOP != 0 {
                    break;
                }
                let graceful = bits & COMMAND_FINISH != 0;
                let mut ms_differential = 0;
                let state = converter.resample(graceful, &mut ms_differential);
                self.drift_ms.fetch_add(ms_differential as i64, Ordering::Relaxed);
                match state {
                    ResamplerState::Resampling => {}
                    ResamplerState::Finished => {
                        self.output.finish();
                        break;
                    }
                    ResamplerState::Failed => {
                        self.events.set(ERR_FAIL);
                        break;
                    }
                }
            }
        }

        tracing::debug!(drift_ms = self.drift_ms(), "resampler worker exiting");
        self.events.set(STATE_STOPPING);
        *self.ring.lock().unwrap() = None;
        self.events.set(STATE_STOPPED);
    }
}

impl AudioSink for ResamplerSink {
    fn play(&self, data: &[u8], timeout: Duration) -> usize {
        if self.is_stopped() {
            self.start();
        }
        if self.output.is_running() && !self.requires_resampling() {
            return self.output.play(data, timeout);
        }
        let Some(ring) = self.ring.lock().unwrap().clone() else {
            thread::sleep(timeout);
            return 0;
        };
        ring.write_without_replacement(data, timeout)
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
        self.state.store(SinkState::Stopping);
    }

    /// Drain the ring through the converter, then let the output drain.
    fn finish(&self) {
        if self.worker.lock().unwrap().is_some() {
            self.events.set(COMMAND_FINISH);
        } else {
            self.output.finish();
        }
    }

    fn state(&self) -> SinkState {
        self.state.load()
    }

    fn has_buffered_data(&self) -> bool {
        let ring_has_data = self.requires_resampling()
            && self
                .ring
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|ring| ring.available() > 0);
        ring_has_data || self.output.has_buffered_data()
    }

    fn set_pause_state(&self, paused: bool) {
        self.output.set_pause_state(paused);
    }

    fn pause_state(&self) -> bool {
        self.output.pause_state()
    }

    fn set_volume(&self, volume: f32) {
        self.output.set_volume(volume);
    }

    fn volume(&self) -> f32 {
        self.output.volume()
    }

    fn set_mute_state(&self, muted: bool) {
        self.output.set_mute_state(muted);
    }

    fn mute_state(&self) -> bool {
        self.output.mute_state()
    }

    fn add_playback_callback(&self, callback: PlaybackCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    fn process_state(&self) {
        let bits = self.events.get();
        if bits & STATE_STARTING != 0 {
            tracing::debug!("starting resampler task");
            self.events.clear(STATE_STARTING);
        }
        if bits & (ERR_NO_MEM | ERR_NOT_SUPPORTED | ERR_FAIL) != 0 {
            if bits & ERR_NO_MEM != 0 {
                tracing::error!("resampler task failed to allocate the internal buffers");
            }
            if bits & ERR_NOT_SUPPORTED != 0 {
                tracing::error!("cannot resample due to an unsupported audio stream");
            }
            if bits & ERR_FAIL != 0 {
                tracing::error!("resampler task failed");
            }
            self.events.clear(ERR_NO_MEM | ERR_NOT_SUPPORTED | ERR_FAIL);
            self.state.store(SinkState::Stopping);
        }
        if bits & STATE_RUNNING != 0 {
            tracing::debug!(
                from = self.stream_format().sample_rate(),
                to = self.target_format().sample_rate(),
                "started resampler task"
            );
            self.events.clear(STATE_RUNNING);
        }
        if bits & STATE_STOPPING != 0 {
            tracing::debug!("stopping resampler task");
            self.events.clear(STATE_STOPPING);
        }
        if bits & STATE_STOPPED != 0 {
            let handle = self.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("resampler worker panicked");
                }
            }
            tracing::debug!("stopped resampler task");
            self.events.clear(ALL_BITS);
        }

        match self.state() {
            SinkState::Starting => match self.start_() {
                Ok(()) => self.state.store(SinkState::Running),
                Err(e) => {
                    tracing::error!("failed to start resampler: {e}");
                    self.state.store(SinkState::Stopping);
                }
            },
            SinkState::Running => {
                if self.output.is_stopped() {
                    self.state.store(SinkState::Stopping);
                }
            }
            SinkState::Stopping => {
                self.stop_();
                self.state.store(SinkState::Stopped);
            }
            SinkState::Stopped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::sink::MemorySink;

    fn config(rate: u32) -> ResamplerConfig {
        ResamplerConfig {
            target_sample_rate: rate,
            ..ResamplerConfig::default()
        }
    }

    fn sine(frames: usize, rate: u32) -> Vec<u8> {
        (0..frames)
            .map(|i| {
                let t = i as f32 / rate as f32;
                ((t * 440.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16
            })
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn run_until(sink: &ResamplerSink, timeout: Duration, done: impl Fn() -> bool) {
        let deadline = Instant::now() + timeout;
        while !done() && Instant::now() < deadline {
            sink.process_state();
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn matching_format_passes_through() {
        let output = Arc::new(MemorySink::new());
        let sink = ResamplerSink::new(output.clone(), config(16_000));
        let played = Arc::new(AtomicU32::new(0));
        let played_cb = played.clone();
        sink.add_playback_callback(Arc::new(move |frames, _| {
            played_cb.fetch_add(frames, Ordering::Relaxed);
        }));

        sink.set_stream_format(StreamFormat::new(16, 1, 16_000));
        sink.start();
        sink.process_state();
        assert!(sink.is_running());

        let data = sine(1_000, 16_000);
        assert_eq!(sink.play(&data, Duration::from_millis(20)), data.len());
        assert_eq!(output.captured(), data);
        assert_eq!(played.load(Ordering::Relaxed), 1_000);
        assert!(sink.worker.lock().unwrap().is_none());
    }

    #[test]
    fn upsamples_and_reports_source_frames() {
        let output = Arc::new(MemorySink::new());
        let sink = ResamplerSink::new(output.clone(), config(48_000));
        let played = Arc::new(AtomicU32::new(0));
        let played_cb = played.clone();
        sink.add_playback_callback(Arc::new(move |frames, _| {
            played_cb.fetch_add(frames, Ordering::Relaxed);
        }));

        sink.set_stream_format(StreamFormat::new(16, 1, 16_000));
        sink.start();
        sink.process_state();
        assert_eq!(output.stream_format(), StreamFormat::new(16, 1, 48_000));

        let data = sine(1_600, 16_000);
        let mut written = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while written < data.len() && Instant::now() < deadline {
            written += sink.play(&data[written..], Duration::from_millis(20));
            sink.process_state();
        }
        assert_eq!(written, data.len());

        sink.finish();
        run_until(&sink, Duration::from_secs(5), || sink.is_stopped());
        assert!(sink.is_stopped());

        let frames = (output.captured_len() / 2) as u32;
        // Three times the input plus at most the 192 frame delay of a 128 tap filter.
        assert!((4_800..=5_000).contains(&frames), "{frames} frames");
        assert_eq!(played.load(Ordering::Relaxed), frames / 3);
        assert!(played.load(Ordering::Relaxed) <= 1_600 + 64);
        assert!(sink.drift_ms().abs() <= 5, "drift {} ms", sink.drift_ms());
    }

    #[test]
    fn stop_ends_the_worker() {
        let output = Arc::new(MemorySink::new());
        let sink = ResamplerSink::new(output.clone(), config(44_100));
        sink.set_stream_format(StreamFormat::new(16, 2, 48_000));
        sink.start();
        sink.process_state();
        run_until(&sink, Duration::from_secs(2), || sink.ring.lock().unwrap().is_some());

        sink.stop();
        run_until(&sink, Duration::from_secs(2), || {
            sink.is_stopped() && sink.worker.lock().unwrap().is_none()
        });
        assert!(sink.is_stopped());
        assert!(sink.worker.lock().unwrap().is_none());
        assert_eq!(output.stop_calls(), 1);
    }
}
