//! Sample rate and bit depth conversion stage.
//!
//! [`RateConverter`] moves PCM from a source ring buffer to a sink, converting it on the
//! way. Rate changes go through Rubato's asynchronous sinc resampler; equal rates with
//! different bit depths are repacked sample by sample; identical formats are copied.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::PipelineError;
use crate::format::{StreamFormat, pack_q31, unpack_q31};
use crate::ring_buffer::RingBuffer;
use crate::sink::AudioSink;
use crate::transfer::{SinkTransferWindow, SourceTransferWindow};

const READ_WRITE_TIMEOUT: Duration = Duration::from_millis(20);
/// Roughly -3 dB, to leave headroom for filter overshoot.
const RESAMPLE_GAIN: f32 = 0.707_945_8;
const Q31_SCALE: f32 = 2_147_483_648.0;

/// Result of one [`RateConverter::resample`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResamplerState {
    Resampling,
    Finished,
    Failed,
}

/// Sinc resampler plus its interleaved scratch buffers.
struct SincResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    ratio: f64,
    /// Frames fed in and handed out since start, used to trim the final flush.
    frames_in: u64,
    frames_out: u64,
    input: Vec<f32>,
    output: Vec<f32>,
    indexing: Indexing,
}

impl SincResampler {
    fn new(
        input: StreamFormat,
        output: StreamFormat,
        taps: usize,
        filters: usize,
        chunk_frames: usize,
    ) -> Result<Self, PipelineError> {
        let channels = input.channels() as usize;
        let ratio = output.sample_rate() as f64 / input.sample_rate() as f64;

        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len: taps,
            f_cutoff: calculate_cutoff(taps, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: filters,
            window,
        };
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames.max(1),
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| {
            tracing::error!("resampler init error: {e:#}");
            PipelineError::NotSupported
        })?;

        let output_len = resampler.output_frames_max() * channels;
        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            ratio,
            frames_in: 0,
            frames_out: 0,
            input: vec![0.0; chunk_frames.max(1) * channels],
            output: vec![0.0; output_len],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    fn input_frames_next(&self) -> usize {
        self.resampler.input_frames_next()
    }

    fn output_frames_max(&self) -> usize {
        self.resampler.output_frames_max()
    }

    /// Resample `frames` input frames already loaded into `self.input`.
    ///
    /// With `partial` the chunk is shorter than the resampler wants and is zero padded.
    /// Rubato still returns a whole chunk of output then, so only the frames that carry
    /// real input plus the filter delay are kept. Returns the number of output frames
    /// written to `self.output`.
    fn process(&mut self, frames: usize, partial: bool) -> Result<usize, PipelineError> {
        let chunk = self.input.len() / self.channels;
        if partial {
            self.input[frames * self.channels..].fill(0.0);
        }
        let input = InterleavedSlice::new(&self.input, self.channels, chunk).map_err(|e| {
            tracing::error!("interleaved slice (input) error: {e:#}");
            PipelineError::Failed(e.to_string())
        })?;
        let out_frames = self.output.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.output, self.channels, out_frames)
            .map_err(|e| {
                tracing::error!("interleaved slice (output) error: {e:#}");
                PipelineError::Failed(e.to_string())
            })?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial.then_some(frames);

        let (_used, generated) = self
            .resampler
            .process_into_buffer(&input, &mut output, Some(&self.indexing))
            .map_err(|e| {
                tracing::error!("resampler process error: {e:#}");
                PipelineError::Failed(e.to_string())
            })?;

        self.frames_in += frames as u64;
        let generated = if partial {
            let expected = (self.frames_in as f64 * self.ratio).ceil() as u64
                + self.resampler.output_delay() as u64;
            generated.min(expected.saturating_sub(self.frames_out) as usize)
        } else {
            generated
        };
        self.frames_out += generated as u64;
        Ok(generated)
    }
}

enum Conversion {
    Copy,
    BitDepth,
    Resample(Box<SincResampler>),
}

/// Converts PCM between two [`StreamFormat`]s with the same channel count.
pub struct RateConverter {
    input: SourceTransferWindow,
    output: SinkTransferWindow,
    input_format: StreamFormat,
    output_format: StreamFormat,
    conversion: Conversion,
    chunk_frames: usize,
    pause_output: bool,
    accumulated_frames_used: u32,
    accumulated_frames_generated: u32,
}

impl RateConverter {
    pub fn new(input_capacity: usize, output_capacity: usize) -> Self {
        Self {
            input: SourceTransferWindow::new(input_capacity),
            output: SinkTransferWindow::new(output_capacity),
            input_format: StreamFormat::default(),
            output_format: StreamFormat::default(),
            conversion: Conversion::Copy,
            chunk_frames: 256,
            pause_output: false,
            accumulated_frames_used: 0,
            accumulated_frames_generated: 0,
        }
    }

    /// Input frames per resampler call; takes effect on the next [`start`](Self::start).
    pub fn set_chunk_frames(&mut self, frames: usize) {
        self.chunk_frames = frames.max(1);
    }

    pub fn add_source(&mut self, ring: &Arc<RingBuffer>) {
        self.input.set_source(ring);
    }

    pub fn add_sink_ring(&mut self, ring: &Arc<RingBuffer>) {
        self.output.set_sink_ring(ring);
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.output.set_sink(sink);
    }

    pub fn set_pause_output_state(&mut self, paused: bool) {
        self.pause_output = paused;
    }

    /// Configure the conversion from `input` to `output`.
    ///
    /// `taps` is the sinc filter length and `filters` the number of interpolated
    /// sub-filters; both only matter when the sample rates differ.
    pub fn start(
        &mut self,
        input: StreamFormat,
        output: StreamFormat,
        taps: usize,
        filters: usize,
    ) -> Result<(), PipelineError> {
        if input.bits_per_sample() > 32
            || output.bits_per_sample() > 32
            || input.channels() != output.channels()
        {
            return Err(PipelineError::NotSupported);
        }
        self.input_format = input;
        self.output_format = output;
        self.accumulated_frames_used = 0;
        self.accumulated_frames_generated = 0;

        self.conversion = if input.sample_rate() != output.sample_rate() {
            // Rubato scales the sinc cutoff by the ratio below 1, which low-passes the
            // input under the new Nyquist before decimating.
            let pre_filter = output.sample_rate() < input.sample_rate();
            tracing::debug!(
                from = input.sample_rate(),
                to = output.sample_rate(),
                pre_filter,
                taps,
                filters,
                "configuring sinc resampler"
            );
            let sinc = SincResampler::new(input, output, taps, filters, self.chunk_frames)?;
            let min_output = output.frames_to_bytes(sinc.output_frames_max() as u32);
            if self.output.capacity() < min_output && !self.output.reallocate(min_output) {
                return Err(PipelineError::NoMemory);
            }
            let min_input = input.frames_to_bytes(sinc.input_frames_next() as u32);
            if self.input.capacity() < min_input && !self.input.reallocate(min_input) {
                return Err(PipelineError::NoMemory);
            }
            Conversion::Resample(Box::new(sinc))
        } else if input.bits_per_sample() != output.bits_per_sample() {
            Conversion::BitDepth
        } else {
            Conversion::Copy
        };
        Ok(())
    }

    /// Convert as much buffered input as fits in the output.
    ///
    /// `ms_differential` receives the drift, in milliseconds, between input consumed and
    /// output produced by this call.
    pub fn resample(&mut self, stop_gracefully: bool, ms_differential: &mut i32) -> ResamplerState {
        *ms_differential = 0;
        if stop_gracefully && !self.input.has_buffered_data() && self.output.available() == 0 {
            return ResamplerState::Finished;
        }

        if !self.pause_output {
            self.output.transfer_to_sink(READ_WRITE_TIMEOUT, false);
        } else {
            thread::sleep(READ_WRITE_TIMEOUT);
        }

        self.input.transfer_from_source(READ_WRITE_TIMEOUT, true);
        if self.input.available() == 0 {
            return ResamplerState::Resampling;
        }

        let frames_free = self.output_format.bytes_to_frames(self.output.free()) as usize;
        let frames_available = self.input_format.bytes_to_frames(self.input.available()) as usize;

        match &mut self.conversion {
            Conversion::Copy => {
                let n = self
                    .output_format
                    .frames_to_bytes(frames_free.min(frames_available) as u32);
                let (tail, data) = (self.output.tail_mut(), self.input.data());
                tail[..n].copy_from_slice(&data[..n]);
                self.input.decrease_length(n);
                self.output.increase_length(n);
            }
            Conversion::BitDepth => {
                let frames = frames_free.min(frames_available);
                let samples = frames * self.input_format.channels() as usize;
                let in_bytes = self.input_format.bytes_per_sample();
                let out_bytes = self.output_format.bytes_per_sample();
                let data = self.input.data();
                let tail = self.output.tail_mut();
                for (src, dst) in data
                    .chunks_exact(in_bytes)
                    .zip(tail.chunks_exact_mut(out_bytes))
                    .take(samples)
                {
                    pack_q31(unpack_q31(src), dst);
                }
                self.input.decrease_length(samples * in_bytes);
                self.output.increase_length(samples * out_bytes);
            }
            Conversion::Resample(sinc) => {
                let (used, generated) = match Self::run_sinc(
                    sinc,
                    &mut self.input,
                    &mut self.output,
                    self.input_format,
                    self.output_format,
                    stop_gracefully,
                ) {
                    Ok(counts) => counts,
                    Err(_) => return ResamplerState::Failed,
                };

                self.accumulated_frames_used += used;
                self.accumulated_frames_generated += generated;
                let used_ms = self
                    .input_format
                    .frames_to_milliseconds_with_remainder(&mut self.accumulated_frames_used);
                let generated_ms = self
                    .output_format
                    .frames_to_milliseconds_with_remainder(&mut self.accumulated_frames_generated);
                *ms_differential = used_ms as i32 - generated_ms as i32;
            }
        }
        ResamplerState::Resampling
    }

    /// Feed whole chunks through the sinc resampler while input and output space allow.
    ///
    /// Once the source has ended a final short chunk is flushed as well. Returns frames
    /// consumed and produced.
    fn run_sinc(
        sinc: &mut SincResampler,
        input: &mut SourceTransferWindow,
        output: &mut SinkTransferWindow,
        input_format: StreamFormat,
        output_format: StreamFormat,
        stop_gracefully: bool,
    ) -> Result<(u32, u32), PipelineError> {
        let in_bytes = input_format.bytes_per_sample();
        let out_bytes = output_format.bytes_per_sample();
        let mut used_total = 0u32;
        let mut generated_total = 0u32;

        loop {
            let frames_available = input_format.bytes_to_frames(input.available()) as usize;
            let frames_free = output_format.bytes_to_frames(output.free()) as usize;
            let needed = sinc.input_frames_next();
            if frames_available == 0 || frames_free < sinc.output_frames_max() {
                break;
            }
            let partial = frames_available < needed;
            if partial && !stop_gracefully {
                break;
            }
            let frames = frames_available.min(needed);
            let samples = frames * sinc.channels;

            for (dst, src) in sinc.input[..samples]
                .iter_mut()
                .zip(input.data().chunks_exact(in_bytes))
            {
                *dst = unpack_q31(src) as f32 / Q31_SCALE;
            }
            let generated = sinc.process(frames, partial)?;
            input.decrease_length(input_format.frames_to_bytes(frames as u32));

            let out_samples = generated * sinc.channels;
            for (src, dst) in sinc.output[..out_samples]
                .iter()
                .zip(output.tail_mut().chunks_exact_mut(out_bytes))
            {
                pack_q31((src * RESAMPLE_GAIN * Q31_SCALE) as i32, dst);
            }
            output.increase_length(out_samples * out_bytes);

            used_total += frames as u32;
            generated_total += generated as u32;
            if partial {
                break;
            }
        }
        Ok((used_total, generated_total))
    }
}
