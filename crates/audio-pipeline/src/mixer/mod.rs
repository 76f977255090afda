//! Multi-source mixer.
//!
//! Each [`MixerSource`] is an [`AudioSink`] with its own ring buffer and ducking ramp. A
//! single worker drains every source and either forwards the first source with data
//! (queue mode, or when only one source is active) or sums all active sources with
//! 16-bit saturation (blend mode).

mod ducking;
mod source;

pub use self::source::MixerSource;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::MixerConfig;
use crate::error::PipelineError;
use crate::events::EventGroup;
use crate::format::StreamFormat;
use crate::sink::AudioSink;
use crate::transfer::{SinkTransferWindow, SourceTransferWindow};

const TRANSFER_BUFFER_DURATION_MS: u32 = 50;
const TASK_DELAY: Duration = Duration::from_millis(25);

const COMMAND_STOP: u32 = 1 << 0;
const STATE_STARTING: u32 = 1 << 10;
const STATE_RUNNING: u32 = 1 << 11;
const STATE_STOPPING: u32 = 1 << 12;
const STATE_STOPPED: u32 = 1 << 13;
const ALL_BITS: u32 = 0x00FF_FFFF;

/// Mixes a fixed number of sources into one output sink.
pub struct Mixer {
    this: Weak<Mixer>,
    output: Arc<dyn AudioSink>,
    output_channels: u8,
    queue_mode: bool,
    sources: Vec<Arc<MixerSource>>,
    /// Format of the mixed output, fixed by the first source to start.
    format: Mutex<Option<StreamFormat>>,
    events: EventGroup,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Mixer {
    pub fn new(output: Arc<dyn AudioSink>, config: MixerConfig, source_count: usize) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Mixer>| {
            let sources = (0..source_count)
                .map(|index| {
                    let source = Arc::new(MixerSource::new(index, this.clone(), &config));
                    let weak = Arc::downgrade(&source);
                    output.add_playback_callback(Arc::new(move |frames, timestamp| {
                        if let Some(source) = weak.upgrade() {
                            source.on_output_played(frames, timestamp);
                        }
                    }));
                    source
                })
                .collect();

            Self {
                this: this.clone(),
                output,
                output_channels: config.output_channels,
                queue_mode: config.queue_mode,
                sources,
                format: Mutex::new(None),
                events: EventGroup::new(),
                worker: Mutex::new(None),
            }
        })
    }

    pub fn source(&self, index: usize) -> Option<Arc<MixerSource>> {
        self.sources.get(index).cloned()
    }

    pub fn sources(&self) -> &[Arc<MixerSource>] {
        &self.sources
    }

    pub fn output(&self) -> &Arc<dyn AudioSink> {
        &self.output
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Register a source starting with `format`, starting the worker if needed.
    ///
    /// Only 16-bit audio can be mixed. Outside queue mode every source must share the
    /// output's sample rate.
    pub fn start(&self, format: StreamFormat) -> Result<(), PipelineError> {
        {
            let mut current = self.format.lock().unwrap();
            match *current {
                None => {
                    if format.bits_per_sample() != 16 {
                        return Err(PipelineError::NotSupported);
                    }
                    let output_format =
                        StreamFormat::new(16, self.output_channels, format.sample_rate());
                    self.output.set_stream_format(output_format);
                    *current = Some(output_format);
                }
                Some(output_format) => {
                    if !self.queue_mode && format.sample_rate() != output_format.sample_rate() {
                        return Err(PipelineError::InvalidArgument);
                    }
                }
            }
        }
        self.start_worker()
    }

    pub fn stop(&self) {
        self.events.set(COMMAND_STOP);
    }

    /// Advance every source, log worker transitions, and stop once all sources are stopped.
    pub fn process_state(&self) {
        for source in &self.sources {
            source.process_state();
        }

        let bits = self.events.get();
        if bits & STATE_STARTING != 0 {
            tracing::debug!("starting speaker mixer");
            self.events.clear(STATE_STARTING);
        }
        if bits & STATE_RUNNING != 0 {
            tracing::debug!("started speaker mixer");
            self.events.clear(STATE_RUNNING);
        }
        if bits & STATE_STOPPING != 0 {
            tracing::debug!("stopping speaker mixer");
            self.events.clear(STATE_STOPPING);
        }
        if bits & STATE_STOPPED != 0 {
            let handle = self.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("mixer worker panicked");
                }
            }
            self.events.clear(ALL_BITS);
            if self.all_sources_stopped() {
                *self.format.lock().unwrap() = None;
            } else if let Err(e) = self.start_worker() {
                // A source started while the worker was winding down.
                tracing::error!("failed to restart mixer: {e}");
            }
        }

        if self.is_running() && self.all_sources_stopped() {
            self.stop();
        }
    }

    fn all_sources_stopped(&self) -> bool {
        self.sources.iter().all(|source| source.is_stopped())
    }

    fn start_worker(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Ok(());
        }
        let mixer = self.this.upgrade().ok_or(PipelineError::InvalidState)?;
        let handle = thread::Builder::new()
            .name("mixer".into())
            .spawn(move || mixer.run())
            .map_err(|_| PipelineError::InvalidState)?;
        *worker = Some(handle);
        Ok(())
    }

    fn output_format(&self) -> Option<StreamFormat> {
        *self.format.lock().unwrap()
    }

    fn run(&self) {
        self.events.set(STATE_STARTING);
        let Some(format) = self.output_format() else {
            self.events.set(STATE_STOPPED);
            return;
        };
        let mut output = SinkTransferWindow::new(format.ms_to_bytes(TRANSFER_BUFFER_DURATION_MS));
        output.set_sink(self.output.clone());
        self.events.set(STATE_RUNNING);

        let mut sent_finished = false;
        while self.events.get() & COMMAND_STOP == 0 {
            // Never shift the output window; the sink drains it in place.
            output.transfer_to_sink(TASK_DELAY, false);
            let Some(output_format) = self.output_format() else {
                break;
            };
            if !self.mix_once(&mut output, output_format, &mut sent_finished) {
                thread::sleep(TASK_DELAY);
            }
        }

        self.events.set(STATE_STOPPING);
        // Hand over what was already mixed.
        output.transfer_to_sink(TASK_DELAY, false);
        self.events.set(STATE_STOPPED);
    }

    /// One mixing cycle. Returns `false` when no source had audio.
    fn mix_once(
        &self,
        output: &mut SinkTransferWindow,
        output_format: StreamFormat,
        sent_finished: &mut bool,
    ) -> bool {
        let mut guards: Vec<(&MixerSource, MutexGuard<'_, Option<SourceTransferWindow>>)> =
            Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let mut window = source.window.lock().unwrap();
            let Some(w) = window.as_mut() else {
                continue;
            };
            source.process_data_from_source(w);
            if w.available() > 0 && !source.pause_state() {
                guards.push((source, window));
            }
        }
        let mut active: Vec<(&MixerSource, &mut SourceTransferWindow)> = guards
            .iter_mut()
            .filter_map(|(source, window)| (**window).as_mut().map(|w| (*source, w)))
            .collect();
        if active.is_empty() {
            return false;
        }

        let mut frames_to_mix = output_format.bytes_to_frames(output.free());

        if active.len() == 1 || self.queue_mode {
            let (source, window) = &mut active[0];
            let format = source.stream_format();

            if format.sample_rate() == self.output.stream_format().sample_rate() {
                frames_to_mix = frames_to_mix.min(format.bytes_to_frames(window.available()));
                copy_frames(
                    window.data(),
                    format.channels(),
                    output.tail_mut(),
                    output_format.channels(),
                    frames_to_mix as usize,
                );
                window.decrease_length(format.frames_to_bytes(frames_to_mix));
                source.add_pending_frames(frames_to_mix);
                output.increase_length(output_format.frames_to_bytes(frames_to_mix));
            } else if !self.output.is_stopped() {
                // A source with a new rate; let the output drain before reconfiguring it.
                if !*sent_finished {
                    self.output.finish();
                    *sent_finished = true;
                }
            } else {
                let new_format =
                    StreamFormat::new(format.bits_per_sample(), self.output_channels, format.sample_rate());
                tracing::info!(
                    sample_rate = new_format.sample_rate(),
                    "reconfiguring mixer output"
                );
                *self.format.lock().unwrap() = Some(new_format);
                self.output.set_stream_format(new_format);
                self.output.start();
                *sent_finished = false;
            }
        } else {
            for (source, window) in &active {
                let format = source.stream_format();
                frames_to_mix = frames_to_mix.min(format.bytes_to_frames(window.available()));
            }
            let inputs: Vec<(&[u8], u8)> = active
                .iter()
                .map(|(source, window)| (window.data(), source.stream_format().channels()))
                .collect();
            mix_frames(&inputs, output.tail_mut(), output_format.channels(), frames_to_mix as usize);

            for (source, window) in &mut active {
                let format = source.stream_format();
                window.decrease_length(format.frames_to_bytes(frames_to_mix));
                source.add_pending_frames(frames_to_mix);
            }
            output.increase_length(output_format.frames_to_bytes(frames_to_mix));
        }
        true
    }
}

fn sample_at(data: &[u8], index: usize) -> i16 {
    i16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

/// Copy 16-bit frames, duplicating or dropping channels to fit the output.
pub(crate) fn copy_frames(input: &[u8], in_channels: u8, output: &mut [u8], out_channels: u8, frames: usize) {
    let (in_channels, out_channels) = (in_channels as usize, out_channels as usize);
    if in_channels == out_channels {
        let bytes = frames * in_channels * 2;
        output[..bytes].copy_from_slice(&input[..bytes]);
        return;
    }
    for frame in 0..frames {
        for ch in 0..out_channels {
            let s = sample_at(input, frame * in_channels + ch.min(in_channels - 1));
            let o = (frame * out_channels + ch) * 2;
            output[o..o + 2].copy_from_slice(&s.to_le_bytes());
        }
    }
}

/// Sum 16-bit frames of every input, saturating after each addition.
pub(crate) fn mix_frames(inputs: &[(&[u8], u8)], output: &mut [u8], out_channels: u8, frames: usize) {
    let out_channels = out_channels as usize;
    for frame in 0..frames {
        for ch in 0..out_channels {
            let mut acc: i32 = 0;
            for &(data, channels) in inputs {
                let channels = channels as usize;
                let s = sample_at(data, frame * channels + ch.min(channels - 1)) as i32;
                acc = (acc + s).clamp(i16::MIN as i32, i16::MAX as i32);
            }
            let o = (frame * out_channels + ch) * 2;
            output[o..o + 2].copy_from_slice(&(acc as i16).to_le_bytes());
        }
    }
}
