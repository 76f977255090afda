//! Reader/decoder pipeline for one media item at a time.
//!
//! Two worker threads share a ring buffer: the read worker fills it from a file or URL,
//! the decode worker drains it into the sink. The owner drives everything through
//! [`Pipeline::process_state`], which must be polled regularly.

mod workers;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::EventGroup;
use crate::format::{AudioFile, AudioFileType, StreamFormat};
use crate::ring_buffer::RingBuffer;
use crate::sink::AudioSink;

const INFO_ERROR_QUEUE_COUNT: usize = 5;
const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 24 * 1024;

// Event bits shared by the pipeline and its workers.
pub(crate) const COMMAND_STOP: u32 = 1 << 0;
pub(crate) const COMMAND_SHUTDOWN: u32 = 1 << 1;
pub(crate) const READER_COMMAND_INIT_HTTP: u32 = 1 << 4;
pub(crate) const READER_COMMAND_INIT_FILE: u32 = 1 << 5;
pub(crate) const READER_MESSAGE_LOADED_MEDIA_TYPE: u32 = 1 << 6;
pub(crate) const READER_MESSAGE_FINISHED: u32 = 1 << 7;
pub(crate) const READER_MESSAGE_ERROR: u32 = 1 << 8;
pub(crate) const DECODER_MESSAGE_FINISHED: u32 = 1 << 12;
pub(crate) const DECODER_MESSAGE_ERROR: u32 = 1 << 13;

/// State reported by [`Pipeline::process_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Stopping,
    Stopped,
    Paused,
    ErrorReading,
    ErrorDecoding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoErrorSource {
    Reader,
    Decoder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodingError {
    FailedHeader,
    IncompatibleBitsPerSample,
    IncompatibleChannels,
}

/// Status message from a worker, logged by [`Pipeline::process_state`].
#[derive(Clone, Debug, PartialEq)]
pub struct InfoErrorEvent {
    pub source: InfoErrorSource,
    pub err: Option<PipelineError>,
    pub file_type: Option<AudioFileType>,
    pub stream_format: Option<StreamFormat>,
    pub decoding_err: Option<DecodingError>,
}

impl InfoErrorEvent {
    pub(crate) fn new(source: InfoErrorSource) -> Self {
        Self {
            source,
            err: None,
            file_type: None,
            stream_format: None,
            decoding_err: None,
        }
    }
}

/// The item the workers are told to play next.
#[derive(Debug, Default)]
pub(crate) struct CurrentItem {
    pub uri: String,
    pub file: Option<AudioFile>,
    pub file_type: AudioFileType,
}

/// State shared with the worker threads.
pub(crate) struct Shared {
    pub events: EventGroup,
    pub sink: Arc<dyn AudioSink>,
    pub buffer_size: usize,
    pub transfer_buffer_size: usize,
    pub initial_buffer_ms: u32,
    pub current: Mutex<CurrentItem>,
    /// Encoded bytes between the workers; alive while either worker holds it.
    pub raw_ring: Mutex<Weak<RingBuffer>>,
    pub pause_state: AtomicBool,
    pub playback_ms: AtomicU32,
    pub info_tx: Sender<InfoErrorEvent>,
}

impl Shared {
    pub(crate) fn send_info(&self, event: InfoErrorEvent) {
        if self.info_tx.try_send(event).is_err() {
            tracing::warn!("pipeline info queue full; dropping event");
        }
    }
}

/// Plays media items from files or URLs into one [`AudioSink`].
pub struct Pipeline {
    name: String,
    shared: Arc<Shared>,
    info_rx: Receiver<InfoErrorEvent>,
    read_worker: Option<JoinHandle<()>>,
    decode_worker: Option<JoinHandle<()>>,
    pending_url: bool,
    pending_file: bool,
    is_playing: bool,
    hard_stop: bool,
}

impl Pipeline {
    /// `name` prefixes the worker thread names.
    pub fn new(sink: Arc<dyn AudioSink>, config: &PipelineConfig, name: &str) -> Self {
        let (info_tx, info_rx) = bounded(INFO_ERROR_QUEUE_COUNT);
        let shared = Arc::new(Shared {
            events: EventGroup::new(),
            sink,
            buffer_size: config.buffer_size,
            transfer_buffer_size: (config.buffer_size / 4).min(DEFAULT_TRANSFER_BUFFER_SIZE),
            initial_buffer_ms: config.initial_buffer_ms,
            current: Mutex::new(CurrentItem::default()),
            raw_ring: Mutex::new(Weak::new()),
            pause_state: AtomicBool::new(false),
            playback_ms: AtomicU32::new(0),
            info_tx,
        });
        Self {
            name: name.to_string(),
            shared,
            info_rx,
            read_worker: None,
            decode_worker: None,
            pending_url: false,
            pending_file: false,
            is_playing: false,
            hard_stop: false,
        }
    }

    /// Queue `uri` for playback. A playing item is stopped first.
    pub fn start_url(&mut self, uri: &str) {
        if self.is_playing {
            self.shared.events.set(COMMAND_STOP);
        }
        {
            let mut current = self.shared.current.lock().unwrap();
            current.uri = uri.to_string();
            current.file = None;
            current.file_type = AudioFileType::None;
        }
        self.pending_url = true;
    }

    /// Queue an in-memory file for playback. A playing item is stopped first.
    pub fn start_file(&mut self, file: AudioFile) {
        if self.is_playing {
            self.shared.events.set(COMMAND_STOP);
        }
        {
            let mut current = self.shared.current.lock().unwrap();
            current.file_type = file.file_type;
            current.file = Some(file);
            current.uri.clear();
        }
        self.pending_file = true;
    }

    /// Ask the workers to stop. Completion is reported by [`process_state`](Self::process_state).
    pub fn stop(&mut self) {
        self.shared.events.set(COMMAND_STOP);
    }

    pub fn set_pause_state(&mut self, paused: bool) {
        self.shared.sink.set_pause_state(paused);
        self.shared.pause_state.store(paused, Ordering::Relaxed);
    }

    pub fn pause_state(&self) -> bool {
        self.shared.pause_state.load(Ordering::Relaxed)
    }

    /// Milliseconds of the current item handed to the sink.
    pub fn playback_ms(&self) -> u32 {
        self.shared.playback_ms.load(Ordering::Relaxed)
    }

    /// Log worker messages and derive the current state.
    ///
    /// Starts pending items once any previous item has fully stopped, and tears the
    /// workers down after they have been idle for two consecutive calls.
    pub fn process_state(&mut self) -> PipelineState {
        while let Ok(event) = self.info_rx.try_recv() {
            log_info_event(&event);
        }

        let bits = self.shared.events.get();

        if (self.pending_url || self.pending_file) && bits & COMMAND_STOP == 0 {
            if self.read_worker.is_none() || self.decode_worker.is_none() {
                if let Err(e) = self.start_workers() {
                    tracing::error!(pipeline = %self.name, "failed to start workers: {e}");
                }
            }
            if self.pending_url {
                self.shared.events.set(READER_COMMAND_INIT_HTTP);
                self.pending_url = false;
            } else {
                self.shared.events.set(READER_COMMAND_INIT_FILE);
                self.pending_file = false;
            }
            // Idle workers must not report a finished item before they see the new one.
            self.shared
                .events
                .clear(READER_MESSAGE_FINISHED | DECODER_MESSAGE_FINISHED);
            self.shared.playback_ms.store(0, Ordering::Relaxed);
            self.is_playing = true;
            return PipelineState::Playing;
        }

        if bits & READER_MESSAGE_ERROR != 0 {
            self.shared.events.clear(READER_MESSAGE_ERROR);
            return PipelineState::ErrorReading;
        }

        if bits & DECODER_MESSAGE_ERROR != 0 {
            self.shared.events.clear(DECODER_MESSAGE_ERROR);
            return PipelineState::ErrorDecoding;
        }

        if bits & READER_MESSAGE_FINISHED != 0
            && bits & READER_MESSAGE_LOADED_MEDIA_TYPE == 0
            && bits & DECODER_MESSAGE_FINISHED != 0
        {
            if bits & COMMAND_STOP != 0 {
                self.shared.events.clear(COMMAND_STOP);
                self.hard_stop = true;
            }

            if !self.is_playing && (self.read_worker.is_some() || self.decode_worker.is_some()) {
                self.delete_workers();
                if self.hard_stop {
                    self.shared.sink.stop();
                    self.hard_stop = false;
                } else {
                    self.shared.sink.finish();
                }
            }
            self.is_playing = false;
            return PipelineState::Stopped;
        }

        if self.pause_state() {
            return PipelineState::Paused;
        }

        if self.read_worker.is_none() && self.decode_worker.is_none() {
            self.shared.events.clear(COMMAND_STOP);
            return PipelineState::Stopped;
        }

        self.is_playing = true;
        PipelineState::Playing
    }

    /// Stop any playback and join the workers.
    pub fn shutdown(&mut self) {
        self.pending_url = false;
        self.pending_file = false;
        self.shared.events.set(COMMAND_STOP);
        self.delete_workers();
        self.shared.events.clear(COMMAND_STOP);
        self.is_playing = false;
    }

    fn start_workers(&mut self) -> Result<(), PipelineError> {
        if self.read_worker.is_none() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-read", self.name))
                .spawn(move || workers::read_worker(&shared))
                .map_err(|_| PipelineError::InvalidState)?;
            self.read_worker = Some(handle);
        }
        if self.decode_worker.is_none() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-decode", self.name))
                .spawn(move || workers::decode_worker(&shared))
                .map_err(|_| PipelineError::InvalidState)?;
            self.decode_worker = Some(handle);
        }
        tracing::debug!(pipeline = %self.name, "workers started");
        Ok(())
    }

    fn delete_workers(&mut self) {
        self.shared.events.set(COMMAND_SHUTDOWN);
        for handle in [self.read_worker.take(), self.decode_worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::error!(pipeline = %self.name, "pipeline worker panicked");
            }
        }
        self.shared.events.clear(COMMAND_SHUTDOWN);
        tracing::debug!(pipeline = %self.name, "workers stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.read_worker.is_some() || self.decode_worker.is_some() {
            self.shutdown();
        }
    }
}

fn log_info_event(event: &InfoErrorEvent) {
    match event.source {
        InfoErrorSource::Reader => {
            if let Some(err) = &event.err {
                tracing::error!("media reader encountered an error: {err}");
            } else if let Some(file_type) = event.file_type {
                tracing::debug!(%file_type, "reading media");
            }
        }
        InfoErrorSource::Decoder => {
            if let Some(err) = &event.err {
                tracing::error!("decoder encountered an error: {err}");
            }
            if let Some(format) = event.stream_format {
                tracing::debug!(
                    channels = format.channels(),
                    sample_rate = format.sample_rate(),
                    bits = format.bits_per_sample(),
                    "decoded audio format"
                );
            }
            match event.decoding_err {
                Some(DecodingError::FailedHeader) => {
                    tracing::error!("failed to parse the file's header")
                }
                Some(DecodingError::IncompatibleBitsPerSample) => {
                    tracing::error!("incompatible bits per sample; only 16 bits per sample is supported")
                }
                Some(DecodingError::IncompatibleChannels) => {
                    tracing::error!("incompatible channel count; only mono and stereo are supported")
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::decode::tests::wav_header;
    use crate::sink::MemorySink;

    fn wav_file(bits: u16, channels: u16, rate: u32, ms: u32) -> AudioFile {
        let frame = channels as u32 * bits.div_ceil(8) as u32;
        let len = rate * ms / 1000 * frame;
        let mut data = wav_header(bits, channels, rate, len);
        data.extend((0..len).map(|i| (i % 200) as u8));
        AudioFile::new(data, AudioFileType::Wav)
    }

    fn poll_until(
        pipeline: &mut Pipeline,
        timeout: Duration,
        mut done: impl FnMut(PipelineState) -> bool,
    ) -> PipelineState {
        let deadline = Instant::now() + timeout;
        loop {
            let state = pipeline.process_state();
            if done(state) || Instant::now() > deadline {
                return state;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn plays_wav_file_to_completion() {
        let sink = Arc::new(MemorySink::new());
        let config = PipelineConfig {
            buffer_size: 64 * 1024,
            ..PipelineConfig::default()
        };
        let mut pipeline = Pipeline::new(sink.clone(), &config, "test");
        pipeline.start_file(wav_file(16, 2, 16_000, 500));

        assert_eq!(pipeline.process_state(), PipelineState::Playing);
        let state = poll_until(&mut pipeline, Duration::from_secs(10), |s| s == PipelineState::Stopped);
        assert_eq!(state, PipelineState::Stopped);

        assert_eq!(sink.captured_len(), 16_000 / 2 * 4);
        assert_eq!(sink.stream_format(), StreamFormat::new(16, 2, 16_000));
        assert!(pipeline.playback_ms().abs_diff(500) <= 1, "{} ms", pipeline.playback_ms());

        // The next poll tears the workers down and lets the sink drain.
        assert_eq!(pipeline.process_state(), PipelineState::Stopped);
        assert_eq!(sink.finish_calls(), 1);
        assert_eq!(sink.stop_calls(), 0);
    }

    #[test]
    fn rejects_24_bit_audio() {
        let sink = Arc::new(MemorySink::new());
        let mut pipeline = Pipeline::new(sink.clone(), &PipelineConfig::default(), "test");
        pipeline.start_file(wav_file(24, 2, 16_000, 100));

        let state = poll_until(&mut pipeline, Duration::from_secs(10), |s| {
            s == PipelineState::ErrorDecoding
        });
        assert_eq!(state, PipelineState::ErrorDecoding);
        let state = poll_until(&mut pipeline, Duration::from_secs(10), |s| s == PipelineState::Stopped);
        assert_eq!(state, PipelineState::Stopped);
        assert_eq!(sink.captured_len(), 0);
    }

    #[test]
    fn unknown_container_is_a_decode_error() {
        let sink = Arc::new(MemorySink::new());
        let mut pipeline = Pipeline::new(sink, &PipelineConfig::default(), "test");
        pipeline.start_file(AudioFile::new(vec![0u8; 128], AudioFileType::None));

        let state = poll_until(&mut pipeline, Duration::from_secs(10), |s| {
            s == PipelineState::ErrorDecoding
        });
        assert_eq!(state, PipelineState::ErrorDecoding);
    }

    #[test]
    fn new_item_waits_for_previous_to_stop() {
        let sink = Arc::new(MemorySink::new());
        let mut pipeline = Pipeline::new(sink.clone(), &PipelineConfig::default(), "test");
        pipeline.start_file(wav_file(16, 1, 16_000, 3000));
        assert_eq!(pipeline.process_state(), PipelineState::Playing);

        pipeline.start_file(wav_file(16, 1, 16_000, 100));
        // The stop must be observed before the new item is started.
        let state = poll_until(&mut pipeline, Duration::from_secs(10), |s| s == PipelineState::Stopped);
        assert_eq!(state, PipelineState::Stopped);
        assert_eq!(pipeline.process_state(), PipelineState::Playing);
        let state = poll_until(&mut pipeline, Duration::from_secs(10), |s| s == PipelineState::Stopped);
        assert_eq!(state, PipelineState::Stopped);
        assert!(pipeline.playback_ms().abs_diff(100) <= 1);
    }
}
