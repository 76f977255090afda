//! Container decoding stage.
//!
//! [`FormatDecoder`] pulls encoded bytes from a ring buffer, runs one container-specific
//! step at a time and pushes PCM to a ring buffer or an [`AudioSink`]. Each call to
//! [`FormatDecoder::decode`] works for a bounded time so the owning worker stays
//! responsive to stop requests.

mod flac;
mod mp3;
mod wav;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::format::{AudioFileType, StreamFormat};
use crate::ring_buffer::RingBuffer;
use crate::sink::AudioSink;
use crate::transfer::{SinkTransferWindow, SourceTransferWindow, TransferWindow};

use self::flac::FlacDecoder;
use self::mp3::Mp3Decoder;
use self::wav::WavDecoder;

/// A single [`decode`](FormatDecoder::decode) call yields after this long.
const DECODING_TIMEOUT: Duration = Duration::from_millis(50);
const READ_WRITE_TIMEOUT: Duration = Duration::from_millis(20);
const MAX_POTENTIALLY_FAILED_COUNT: u32 = 10;

/// Result of one [`FormatDecoder::decode`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Decoding,
    Finished,
    Failed,
}

/// Outcome of a single container step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FileDecoderState {
    /// Progress was made; keep going.
    MoreToProcess,
    /// Nothing to do until more input arrives.
    Idle,
    /// No progress; may succeed with more input.
    PotentiallyFailed,
    Failed,
    EndOfFile,
}

/// Buffers and stream state handed to a container step.
pub(crate) struct StepContext<'a> {
    pub input: &'a mut TransferWindow,
    pub output: &'a mut TransferWindow,
    pub stream_format: &'a mut Option<StreamFormat>,
    /// Minimum free output space before another step may run.
    pub free_required: &'a mut usize,
    /// The source has ended; whatever is buffered is all there is.
    pub input_ended: bool,
}

enum Codec {
    Wav(WavDecoder),
    Mp3(Mp3Decoder),
    Flac(Box<FlacDecoder>),
}

impl Codec {
    fn step(&mut self, ctx: &mut StepContext<'_>) -> FileDecoderState {
        match self {
            Codec::Wav(d) => d.step(ctx),
            Codec::Mp3(d) => d.step(ctx),
            Codec::Flac(d) => d.step(ctx),
        }
    }
}

/// Decodes one WAV, MP3 or FLAC stream into PCM.
pub struct FormatDecoder {
    input: SourceTransferWindow,
    output: SinkTransferWindow,
    codec: Option<Codec>,
    stream_format: Option<StreamFormat>,
    free_required: usize,
    potentially_failed_count: u32,
    end_of_file: bool,
    pause_output: bool,
    accumulated_frames_written: u32,
    playback_ms: u32,
}

impl FormatDecoder {
    pub fn new(input_capacity: usize, output_capacity: usize) -> Self {
        Self {
            input: SourceTransferWindow::new(input_capacity),
            output: SinkTransferWindow::new(output_capacity),
            codec: None,
            stream_format: None,
            free_required: 0,
            potentially_failed_count: 0,
            end_of_file: false,
            pause_output: false,
            accumulated_frames_written: 0,
            playback_ms: 0,
        }
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

    /// Prepare for a stream of `file_type`, resetting all per-stream state.
    pub fn start(&mut self, file_type: AudioFileType) -> Result<(), PipelineError> {
        self.potentially_failed_count = 0;
        self.end_of_file = false;
        self.stream_format = None;
        self.accumulated_frames_written = 0;
        self.playback_ms = 0;

        let codec = match file_type {
            AudioFileType::Wav => {
                self.free_required = wav::MIN_FREE_OUTPUT;
                if self.output.capacity() < self.free_required
                    && !self.output.reallocate(self.free_required)
                {
                    return Err(PipelineError::NoMemory);
                }
                Codec::Wav(WavDecoder::new())
            }
            AudioFileType::Mp3 => {
                self.free_required = mp3::MIN_FREE_OUTPUT;
                if !self.output.reallocate(self.free_required) {
                    return Err(PipelineError::NoMemory);
                }
                let decoder = Mp3Decoder::new().map_err(|e| {
                    tracing::error!("mp3 decoder unavailable: {e}");
                    PipelineError::NotSupported
                })?;
                Codec::Mp3(decoder)
            }
            AudioFileType::Flac => {
                // Adjusted once STREAMINFO is known.
                self.free_required = self.output.capacity();
                Codec::Flac(Box::new(FlacDecoder::new()))
            }
            AudioFileType::None => return Err(PipelineError::NotSupported),
        };
        self.codec = Some(codec);
        Ok(())
    }

    /// Format of the decoded PCM, once the container header has been parsed.
    pub fn stream_format(&self) -> Option<StreamFormat> {
        self.stream_format
    }

    /// Milliseconds of PCM handed to the sink so far.
    pub fn playback_ms(&self) -> u32 {
        self.playback_ms
    }

    /// While paused, decoded audio is kept instead of being handed to the sink.
    pub fn set_pause_output_state(&mut self, paused: bool) {
        self.pause_output = paused;
    }

    /// Decode for up to [`DECODING_TIMEOUT`].
    ///
    /// `stop_gracefully` means the source has ended: running out of input then counts as
    /// completion rather than failure.
    pub fn decode(&mut self, stop_gracefully: bool) -> DecoderState {
        if stop_gracefully && self.output.available() == 0 {
            if self.end_of_file || !self.input.has_buffered_data() {
                return DecoderState::Finished;
            }
        }

        if self.potentially_failed_count > MAX_POTENTIALLY_FAILED_COUNT {
            if stop_gracefully {
                return DecoderState::Finished;
            }
            return DecoderState::Failed;
        }

        let Some(codec) = self.codec.as_mut() else {
            return DecoderState::Failed;
        };

        let decoding_start = Instant::now();
        let mut state = FileDecoderState::MoreToProcess;
        let mut first_iteration = true;
        let mut bytes_processed = 0;

        while state == FileDecoderState::MoreToProcess {
            if !self.pause_output {
                // The sink is drained in place; shifting here would only cost memory moves.
                let written = self.output.transfer_to_sink(READ_WRITE_TIMEOUT, false);
                if let Some(format) = self.stream_format {
                    self.accumulated_frames_written += format.bytes_to_frames(written);
                    self.playback_ms += format
                        .frames_to_milliseconds_with_remainder(&mut self.accumulated_frames_written);
                }
            } else {
                thread::sleep(READ_WRITE_TIMEOUT);
            }

            if self.output.free() < self.free_required
                || decoding_start.elapsed() > DECODING_TIMEOUT
            {
                return DecoderState::Decoding;
            }

            let bytes_read = self.input.transfer_from_source(READ_WRITE_TIMEOUT, first_iteration);

            if !first_iteration && self.input.available() < bytes_processed {
                // Likely an incomplete unit; wait for the next call to shift and refill.
                break;
            }

            let available_before = self.input.available();

            state = if self.potentially_failed_count > 0 && bytes_read == 0 {
                if self.input.free() == 0 && first_iteration {
                    // Full input that already failed to decode can never recover.
                    FileDecoderState::Failed
                } else {
                    FileDecoderState::Idle
                }
            } else if self.input.available() == 0 {
                FileDecoderState::Idle
            } else {
                let mut ctx = StepContext {
                    input: &mut self.input,
                    output: &mut self.output,
                    stream_format: &mut self.stream_format,
                    free_required: &mut self.free_required,
                    input_ended: stop_gracefully,
                };
                codec.step(&mut ctx)
            };

            first_iteration = false;
            bytes_processed = available_before.saturating_sub(self.input.available());

            match state {
                FileDecoderState::PotentiallyFailed => self.potentially_failed_count += 1,
                FileDecoderState::EndOfFile => self.end_of_file = true,
                FileDecoderState::Failed => return DecoderState::Failed,
                FileDecoderState::MoreToProcess => self.potentially_failed_count = 0,
                FileDecoderState::Idle => {}
            }
        }
        DecoderState::Decoding
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sink::MemorySink;

    /// Canonical 44-byte PCM WAV header.
    pub(crate) fn wav_header(bits: u16, channels: u16, rate: u32, data_len: u32) -> Vec<u8> {
        let block_align = channels * bits.div_ceil(8);
        let mut h = Vec::with_capacity(44);
        h.extend_from_slice(b"RIFF");
        h.extend_from_slice(&(36 + data_len).to_le_bytes());
        h.extend_from_slice(b"WAVE");
        h.extend_from_slice(b"fmt ");
        h.extend_from_slice(&16u32.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes());
        h.extend_from_slice(&channels.to_le_bytes());
        h.extend_from_slice(&rate.to_le_bytes());
        h.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        h.extend_from_slice(&block_align.to_le_bytes());
        h.extend_from_slice(&bits.to_le_bytes());
        h.extend_from_slice(b"data");
        h.extend_from_slice(&data_len.to_le_bytes());
        h
    }

    fn run_to_completion(decoder: &mut FormatDecoder) -> DecoderState {
        for _ in 0..200 {
            match decoder.decode(true) {
                DecoderState::Decoding => continue,
                other => return other,
            }
        }
        DecoderState::Decoding
    }

    #[test]
    fn wav_stream_decodes_every_payload_byte() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let mut file = wav_header(16, 2, 44_100, payload.len() as u32);
        file.extend_from_slice(&payload);

        let ring = Arc::new(RingBuffer::new(file.len()));
        ring.write(&file);
        let sink = Arc::new(MemorySink::new());

        let mut decoder = FormatDecoder::new(1024, 1024);
        decoder.add_source(&ring);
        decoder.add_sink(sink.clone());
        decoder.start(AudioFileType::Wav).unwrap();

        assert_eq!(run_to_completion(&mut decoder), DecoderState::Finished);
        assert_eq!(decoder.stream_format(), Some(StreamFormat::new(16, 2, 44_100)));
        assert_eq!(sink.captured(), payload);
        // 1000 frames at 44.1 kHz; only whole 441-frame units are counted.
        assert_eq!(decoder.playback_ms(), 20);
    }

    #[test]
    fn paused_output_holds_decoded_audio() {
        let mut file = wav_header(16, 1, 16_000, 64);
        file.extend_from_slice(&[1u8; 64]);
        let ring = Arc::new(RingBuffer::new(256));
        ring.write(&file);
        let sink = Arc::new(MemorySink::new());

        let mut decoder = FormatDecoder::new(256, 1024);
        decoder.add_source(&ring);
        decoder.add_sink(sink.clone());
        decoder.start(AudioFileType::Wav).unwrap();
        decoder.set_pause_output_state(true);

        assert_eq!(decoder.decode(false), DecoderState::Decoding);
        assert_eq!(sink.captured_len(), 0);

        decoder.set_pause_output_state(false);
        assert_eq!(run_to_completion(&mut decoder), DecoderState::Finished);
        assert_eq!(sink.captured_len(), 64);
    }

    #[test]
    fn unknown_container_is_rejected() {
        let mut decoder = FormatDecoder::new(64, 64);
        assert_eq!(decoder.start(AudioFileType::None), Err(PipelineError::NotSupported));
    }

    #[test]
    fn garbage_escalates_to_failure_without_graceful_stop() {
        let ring = Arc::new(RingBuffer::new(64));
        ring.write(&[0x55; 64]);
        let mut decoder = FormatDecoder::new(64, 64);
        decoder.add_source(&ring);
        decoder.start(AudioFileType::Wav).unwrap();

        let mut state = DecoderState::Decoding;
        for _ in 0..50 {
            state = decoder.decode(false);
            if state != DecoderState::Decoding {
                break;
            }
        }
        assert_eq!(state, DecoderState::Failed);
    }
}
