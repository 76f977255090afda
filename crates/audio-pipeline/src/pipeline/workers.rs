use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{
    COMMAND_SHUTDOWN, COMMAND_STOP, DECODER_MESSAGE_ERROR, DECODER_MESSAGE_FINISHED, DecodingError,
    InfoErrorEvent, InfoErrorSource, READER_COMMAND_INIT_FILE, READER_COMMAND_INIT_HTTP,
    READER_MESSAGE_ERROR, READER_MESSAGE_FINISHED, READER_MESSAGE_LOADED_MEDIA_TYPE, Shared,
};
use crate::decode::{DecoderState, FormatDecoder};
use crate::error::PipelineError;
use crate::format::{AudioFileType, StreamFormat};
use crate::reader::{ReaderState, SourceReader};
use crate::ring_buffer::RingBuffer;

const IDLE_POLL: Duration = Duration::from_millis(10);
const READER_INIT: u32 = READER_COMMAND_INIT_FILE | READER_COMMAND_INIT_HTTP;

pub(super) fn read_worker(shared: &Shared) {
    loop {
        shared.events.set_unless(READER_MESSAGE_FINISHED, READER_INIT);
        let bits = shared.events.wait_any(READER_INIT | COMMAND_SHUTDOWN, None);
        if bits & COMMAND_SHUTDOWN != 0 {
            return;
        }
        shared.events.clear(READER_INIT | READER_MESSAGE_FINISHED);
        if bits & COMMAND_STOP != 0 {
            continue;
        }
        read_item(shared, bits & READER_COMMAND_INIT_HTTP != 0);
    }
}

fn read_item(shared: &Shared, from_url: bool) {
    let ring = raw_ring(shared);
    let mut reader = SourceReader::new(shared.transfer_buffer_size);
    reader.add_sink(&ring);

    let started = if from_url {
        let uri = shared.current.lock().unwrap().uri.clone();
        tracing::info!(%uri, "opening stream");
        reader.start_url(&uri)
    } else {
        let file = shared.current.lock().unwrap().file.clone();
        file.map(|file| reader.start_file(file))
            .ok_or(PipelineError::InvalidState)
    };

    match started {
        Ok(file_type) => {
            shared.current.lock().unwrap().file_type = file_type;
            let mut event = InfoErrorEvent::new(InfoErrorSource::Reader);
            event.file_type = Some(file_type);
            shared.send_info(event);
            shared.events.set(READER_MESSAGE_LOADED_MEDIA_TYPE);
        }
        Err(e) => {
            let mut event = InfoErrorEvent::new(InfoErrorSource::Reader);
            event.err = Some(e);
            shared.send_info(event);
            shared.events.set(READER_MESSAGE_ERROR | COMMAND_STOP);
            return;
        }
    }

    while shared.events.get() & (COMMAND_STOP | COMMAND_SHUTDOWN) == 0 {
        match reader.read() {
            ReaderState::Reading => {}
            ReaderState::Finished => break,
            ReaderState::Failed => {
                let mut event = InfoErrorEvent::new(InfoErrorSource::Reader);
                event.err = Some(PipelineError::Failed("media source failed".into()));
                shared.send_info(event);
                shared.events.set(READER_MESSAGE_ERROR | COMMAND_STOP);
                break;
            }
        }
    }
    reader.close();

    // The ring lives only as long as someone holds it; wait for the decoder to take it.
    loop {
        let bits = shared.events.get();
        if bits & READER_MESSAGE_LOADED_MEDIA_TYPE == 0 || bits & (COMMAND_STOP | COMMAND_SHUTDOWN) != 0 {
            break;
        }
        thread::sleep(IDLE_POLL);
    }
}

/// The ring between reader and decoder, reused while the decoder still holds it.
fn raw_ring(shared: &Shared) -> Arc<RingBuffer> {
    let mut slot = shared.raw_ring.lock().unwrap();
    if let Some(ring) = slot.upgrade() {
        ring.reset();
        return ring;
    }
    let ring = Arc::new(RingBuffer::new(shared.buffer_size));
    *slot = Arc::downgrade(&ring);
    ring
}

pub(super) fn decode_worker(shared: &Shared) {
    loop {
        shared
            .events
            .set_unless(DECODER_MESSAGE_FINISHED, READER_INIT | READER_MESSAGE_LOADED_MEDIA_TYPE);
        let bits = shared
            .events
            .wait_any(READER_MESSAGE_LOADED_MEDIA_TYPE | COMMAND_SHUTDOWN, Some(IDLE_POLL));
        if bits & COMMAND_SHUTDOWN != 0 {
            return;
        }
        if bits & READER_MESSAGE_LOADED_MEDIA_TYPE == 0 {
            continue;
        }

        // Take the ring before releasing the reader.
        let ring = shared.raw_ring.lock().unwrap().upgrade();
        let file_type = shared.current.lock().unwrap().file_type;
        shared
            .events
            .clear(DECODER_MESSAGE_FINISHED | READER_MESSAGE_LOADED_MEDIA_TYPE);

        if shared.events.get() & COMMAND_STOP != 0 {
            continue;
        }
        match ring {
            Some(ring) => decode_item(shared, &ring, file_type),
            None => decoder_failed(shared, Some(PipelineError::InvalidState), None),
        }
    }
}

fn decode_item(shared: &Shared, ring: &Arc<RingBuffer>, file_type: AudioFileType) {
    let mut decoder = FormatDecoder::new(shared.transfer_buffer_size, shared.transfer_buffer_size);
    if let Err(e) = decoder.start(file_type) {
        decoder_failed(shared, Some(e), None);
        return;
    }
    decoder.add_source(ring);

    let mut started_playback = false;
    let mut initial_bytes = usize::MAX;

    loop {
        let bits = shared.events.get();
        if bits & (COMMAND_STOP | COMMAND_SHUTDOWN) != 0 {
            break;
        }

        let reader_finished = bits & READER_MESSAGE_FINISHED != 0;
        if !started_playback {
            // Hold output until enough input is buffered, or the whole item is in.
            if reader_finished {
                started_playback = true;
            }
            decoder.set_pause_output_state(!started_playback);
        } else {
            decoder.set_pause_output_state(shared.pause_state.load(Ordering::Relaxed));
        }

        let state = decoder.decode(reader_finished);
        if state != DecoderState::Failed {
            shared
                .playback_ms
                .store(decoder.playback_ms(), Ordering::Relaxed);
        }
        match state {
            DecoderState::Decoding => {}
            DecoderState::Finished => break,
            DecoderState::Failed => {
                let header = decoder.stream_format().is_none().then_some(DecodingError::FailedHeader);
                decoder_failed(shared, None, header);
                break;
            }
        }

        if initial_bytes == usize::MAX {
            if let Some(format) = decoder.stream_format() {
                let mut event = InfoErrorEvent::new(InfoErrorSource::Decoder);
                event.stream_format = Some(format);
                shared.send_info(event);

                if let Some(err) = incompatible(format) {
                    decoder_failed(shared, None, Some(err));
                    break;
                }
                shared.sink.set_stream_format(format);
                decoder.add_sink(shared.sink.clone());
                initial_bytes = initial_buffer_bytes(shared, format, file_type);
            }
        }

        if !started_playback && ring.available() >= initial_bytes {
            started_playback = true;
        }
    }
}

fn incompatible(format: StreamFormat) -> Option<DecodingError> {
    if format.bits_per_sample() != 16 {
        Some(DecodingError::IncompatibleBitsPerSample)
    } else if format.channels() > 2 {
        Some(DecodingError::IncompatibleChannels)
    } else {
        None
    }
}

/// Encoded bytes to buffer before playback starts. Compressed formats need fewer bytes
/// for the same duration.
fn initial_buffer_bytes(shared: &Shared, format: StreamFormat, file_type: AudioFileType) -> usize {
    let pcm = format
        .ms_to_bytes(shared.initial_buffer_ms)
        .min(shared.buffer_size * 3 / 4);
    match file_type {
        AudioFileType::Mp3 => pcm / 8,
        AudioFileType::Flac => pcm / 2,
        _ => pcm,
    }
}

fn decoder_failed(shared: &Shared, err: Option<PipelineError>, decoding_err: Option<DecodingError>) {
    let mut event = InfoErrorEvent::new(InfoErrorSource::Decoder);
    event.err = err;
    event.decoding_err = decoding_err;
    shared.send_info(event);
    shared.events.set(DECODER_MESSAGE_ERROR | COMMAND_STOP);
}
