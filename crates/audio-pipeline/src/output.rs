//! Hardware output sink on top of CPAL.
//!
//! `cpal::Stream` is not `Send`, so a dedicated thread owns it and rebuilds it on every
//! start. Producers only touch a byte ring; the device callback drains that ring,
//! converts 16-bit PCM to the device sample format and fills underruns with silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::config::OutputConfig;
use crate::device::{self, DeviceChoice};
use crate::format::StreamFormat;
use crate::ring_buffer::RingBuffer;
use crate::sink::{AtomicSinkState, AtomicVolume, AudioSink, PlaybackCallback, SinkState};

/// How often the output thread checks whether a finishing stream has drained.
const DRAIN_POLL: Duration = Duration::from_millis(10);

enum OutputCommand {
    Start(StreamFormat),
    Stop,
    Shutdown,
}

/// State shared between the sink, its output thread and the device callback.
struct OutputShared {
    ring: RingBuffer,
    state: AtomicSinkState,
    format: Mutex<StreamFormat>,
    volume: AtomicVolume,
    muted: AtomicBool,
    paused: AtomicBool,
    finishing: AtomicBool,
    callbacks: Mutex<Vec<PlaybackCallback>>,
}

impl OutputShared {
    fn new(ring_bytes: usize) -> Self {
        Self {
            ring: RingBuffer::new(ring_bytes),
            state: AtomicSinkState::new(SinkState::Stopped),
            format: Mutex::new(StreamFormat::new(16, 2, 48_000)),
            volume: AtomicVolume::new(1.0),
            muted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Device callback body: fill `data` from the ring, silence for anything missing.
    fn fill<T>(&self, data: &mut [T], channels: usize, scratch: &mut Vec<u8>)
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let wanted = data.len() * 2;
        if scratch.len() < wanted {
            scratch.resize(wanted, 0);
        }
        let read = if self.paused.load(Ordering::Relaxed) {
            0
        } else {
            self.ring.read(&mut scratch[..wanted], Duration::ZERO)
        };
        let gain = if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume.load()
        };

        let samples = read / 2;
        for (i, out) in data.iter_mut().enumerate() {
            let s = if i < samples {
                i16::from_le_bytes([scratch[2 * i], scratch[2 * i + 1]]) as f32 / 32_768.0 * gain
            } else {
                0.0
            };
            *out = <T as cpal::Sample>::from_sample::<f32>(s);
        }

        let frames = (samples / channels.max(1)) as u32;
        if frames > 0 {
            let now = Instant::now();
            for callback in self.callbacks.lock().unwrap().iter() {
                callback(frames, now);
            }
        }
    }
}

/// An [`AudioSink`] that plays 16-bit PCM on a CPAL output device.
pub struct CpalSink {
    shared: Arc<OutputShared>,
    commands: Sender<OutputCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
    device_name: String,
    sample_rate: u32,
}

impl CpalSink {
    /// Open the configured device and start its output thread. No stream is built until
    /// the sink is started.
    pub fn open(config: &OutputConfig) -> Result<Arc<Self>> {
        let host = cpal::default_host();
        let choice = device::choose_output(&host, config.device.as_deref(), config.sample_rate)?;
        let sample_rate = choice.config.sample_rate();
        let device_name = choice.name.clone();
        tracing::info!(
            device = %device_name,
            rate_hz = sample_rate,
            sample_format = ?choice.config.sample_format(),
            "opened output device"
        );

        let ring_bytes = StreamFormat::new(16, 2, sample_rate).ms_to_bytes(config.buffer_ms);
        let shared = Arc::new(OutputShared::new(ring_bytes));
        let (commands, rx) = unbounded();
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || output_thread(choice, thread_shared, rx))
            .context("failed to spawn output thread")?;

        Ok(Arc::new(Self {
            shared,
            commands,
            thread: Mutex::new(Some(handle)),
            device_name,
            sample_rate,
        }))
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Sample rate the device was opened at; upstream stages should produce this rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn send(&self, command: OutputCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!("output thread is gone");
        }
    }
}

impl AudioSink for CpalSink {
    fn play(&self, data: &[u8], timeout: Duration) -> usize {
        if self.is_stopped() {
            self.start();
        }
        self.shared.ring.write_without_replacement(data, timeout)
    }

    fn set_stream_format(&self, format: StreamFormat) {
        *self.shared.format.lock().unwrap() = format;
    }

    fn stream_format(&self) -> StreamFormat {
        *self.shared.format.lock().unwrap()
    }

    fn start(&self) {
        if matches!(self.state(), SinkState::Running | SinkState::Starting) {
            return;
        }
        self.shared.finishing.store(false, Ordering::Relaxed);
        self.shared.state.store(SinkState::Starting);
        self.send(OutputCommand::Start(self.stream_format()));
    }

    fn stop(&self) {
        self.shared.finishing.store(false, Ordering::Relaxed);
        self.shared.state.store(SinkState::Stopped);
        self.shared.ring.reset();
        self.send(OutputCommand::Stop);
    }

    fn finish(&self) {
        if !self.is_stopped() {
            self.shared.finishing.store(true, Ordering::Relaxed);
        }
    }

    fn state(&self) -> SinkState {
        self.shared.state.load()
    }

    fn has_buffered_data(&self) -> bool {
        self.shared.ring.available() > 0
    }

    fn set_pause_state(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    fn pause_state(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    fn set_volume(&self, volume: f32) {
        self.shared.volume.store(volume);
    }

    fn volume(&self) -> f32 {
        self.shared.volume.load()
    }

    fn set_mute_state(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    fn mute_state(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    fn add_playback_callback(&self, callback: PlaybackCallback) {
        self.shared.callbacks.lock().unwrap().push(callback);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.send(OutputCommand::Shutdown);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::error!("output thread panicked");
            }
        }
    }
}

fn output_thread(choice: DeviceChoice, shared: Arc<OutputShared>, commands: Receiver<OutputCommand>) {
    let mut stream: Option<cpal::Stream> = None;
    loop {
        match commands.recv_timeout(DRAIN_POLL) {
            Ok(OutputCommand::Start(format)) => {
                stream = None;
                match build_output_stream(&choice, format, &shared) {
                    Ok(s) => {
                        stream = Some(s);
                        shared.state.store(SinkState::Running);
                        tracing::debug!(
                            channels = format.channels(),
                            rate_hz = format.sample_rate(),
                            "output stream started"
                        );
                    }
                    Err(e) => {
                        tracing::error!("failed to start output stream: {e:#}");
                        shared.state.store(SinkState::Stopped);
                    }
                }
            }
            Ok(OutputCommand::Stop) => {
                stream = None;
                shared.ring.reset();
            }
            Ok(OutputCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if stream.is_some() && shared.finishing.load(Ordering::Relaxed) && shared.ring.available() == 0 {
            stream = None;
            shared.finishing.store(false, Ordering::Relaxed);
            shared.state.store(SinkState::Stopped);
            tracing::debug!("output drained");
        }
    }
}

fn build_output_stream(choice: &DeviceChoice, format: StreamFormat, shared: &Arc<OutputShared>) -> Result<cpal::Stream> {
    if format.bits_per_sample() != 16 {
        return Err(anyhow!("output expects 16-bit PCM, got {} bits", format.bits_per_sample()));
    }
    let mut stream_config: cpal::StreamConfig = choice.config.clone().into();
    stream_config.channels = format.channels() as u16;
    stream_config.sample_rate = format.sample_rate();
    if let Some(buf) = device::pick_buffer_size(&choice.config) {
        stream_config.buffer_size = buf;
    }

    let stream = match choice.config.sample_format() {
        cpal::SampleFormat::I16 => build_stream::<i16>(&choice.device, &stream_config, shared),
        cpal::SampleFormat::F32 => build_stream::<f32>(&choice.device, &stream_config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(&choice.device, &stream_config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(&choice.device, &stream_config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }?;
    stream.play().context("failed to play output stream")?;
    Ok(stream)
}

fn build_stream<T>(device: &cpal::Device, config: &cpal::StreamConfig, shared: &Arc<OutputShared>) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let shared = shared.clone();
    let mut scratch = Vec::new();
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| shared.fill(data, channels, &mut scratch),
        err_fn,
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn fill_converts_and_pads_with_silence() {
        let shared = OutputShared::new(64);
        shared.ring.write(&pcm(&[16_384, -16_384]));
        let mut out = [1.0f32; 4];
        let mut scratch = Vec::new();
        shared.fill(&mut out, 2, &mut scratch);
        assert_eq!(out, [0.5, -0.5, 0.0, 0.0]);
    }

    #[test]
    fn fill_applies_volume_and_mute() {
        let shared = OutputShared::new(64);
        shared.volume.store(0.5);
        shared.ring.write(&pcm(&[16_384, 16_384]));
        let mut out = [0.0f32; 2];
        let mut scratch = Vec::new();
        shared.fill(&mut out, 1, &mut scratch);
        assert_eq!(out, [0.25, 0.25]);

        shared.muted.store(true, Ordering::Relaxed);
        shared.ring.write(&pcm(&[16_384, 16_384]));
        shared.fill(&mut out, 1, &mut scratch);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn paused_output_keeps_buffered_audio() {
        let shared = OutputShared::new(64);
        shared.paused.store(true, Ordering::Relaxed);
        shared.ring.write(&pcm(&[100, 200]));
        let mut out = [7i16; 2];
        let mut scratch = Vec::new();
        shared.fill(&mut out, 2, &mut scratch);
        assert_eq!(out, [0, 0]);
        assert_eq!(shared.ring.available(), 4);
    }

    #[test]
    fn callbacks_see_played_frames() {
        let shared = OutputShared::new(64);
        let frames = Arc::new(AtomicU32::new(0));
        let frames_cb = frames.clone();
        shared.callbacks.lock().unwrap().push(Arc::new(move |n, _| {
            frames_cb.fetch_add(n, Ordering::Relaxed);
        }));
        shared.ring.write(&pcm(&[1, 2, 3, 4, 5, 6]));
        let mut out = [0i16; 8];
        let mut scratch = Vec::new();
        shared.fill(&mut out, 2, &mut scratch);
        assert_eq!(frames.load(Ordering::Relaxed), 3);
    }
}
