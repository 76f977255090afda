//! Source reader: moves encoded bytes from an in-memory file or an HTTP stream into the
//! pipeline's ring buffer.

use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::error::PipelineError;
use crate::format::{AudioFile, AudioFileType};
use crate::http_stream::{HttpConnection, READ_WRITE_TIMEOUT, stall_limit};
use crate::ring_buffer::RingBuffer;
use crate::transfer::SinkTransferWindow;

/// Result of one [`SourceReader::read`] step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Reading,
    Finished,
    Failed,
}

enum Source {
    File { file: AudioFile, position: usize },
    Http { conn: HttpConnection, last_data: Instant },
}

/// Reads one media item into a ring buffer, a little at a time.
pub struct SourceReader {
    buffer_size: usize,
    sink: Option<Weak<RingBuffer>>,
    window: SinkTransferWindow,
    source: Option<Source>,
}

impl SourceReader {
    /// `buffer_size` sizes the staging window used for network reads.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            sink: None,
            window: SinkTransferWindow::default(),
            source: None,
        }
    }

    /// Set the ring buffer that receives the encoded bytes.
    pub fn add_sink(&mut self, ring: &Arc<RingBuffer>) {
        self.sink = Some(Arc::downgrade(ring));
        self.window.set_sink_ring(ring);
    }

    /// Begin reading an in-memory file. The container type comes from the file itself.
    pub fn start_file(&mut self, file: AudioFile) -> AudioFileType {
        let file_type = file.file_type;
        tracing::debug!(bytes = file.len(), %file_type, "reader opened file");
        self.source = Some(Source::File { file, position: 0 });
        file_type
    }

    /// Connect to `url` and begin streaming its body.
    pub fn start_url(&mut self, url: &str) -> Result<AudioFileType, PipelineError> {
        self.source = None;
        if self.window.capacity() == 0 && !self.window.reallocate(self.buffer_size) {
            return Err(PipelineError::NoMemory);
        }
        self.window.clear();

        let conn = HttpConnection::open(url, self.buffer_size)?;
        let file_type = conn.file_type();
        self.source = Some(Source::Http {
            conn,
            last_data: Instant::now(),
        });
        Ok(file_type)
    }

    /// Move some bytes towards the sink ring. Blocks for at most a few tens of milliseconds.
    pub fn read(&mut self) -> ReaderState {
        let Some(source) = self.source.as_mut() else {
            return ReaderState::Failed;
        };
        match source {
            Source::File { file, position } => {
                let Some(ring) = self.sink.as_ref().and_then(Weak::upgrade) else {
                    return ReaderState::Failed;
                };
                let remaining = &file.data[*position..];
                if remaining.is_empty() {
                    return ReaderState::Finished;
                }
                *position += ring.write_without_replacement(remaining, READ_WRITE_TIMEOUT);
                ReaderState::Reading
            }
            Source::Http { conn, last_data } => {
                self.window.transfer_to_sink(READ_WRITE_TIMEOUT, true);

                if conn.is_complete() && self.window.available() == 0 {
                    return ReaderState::Finished;
                }

                if self.window.free() > 0 {
                    let n = conn.read(self.window.tail_mut(), READ_WRITE_TIMEOUT);
                    if n > 0 {
                        self.window.increase_length(n);
                        *last_data = Instant::now();
                    } else if conn.has_failed() {
                        tracing::warn!("http stream failed");
                        return ReaderState::Failed;
                    } else if last_data.elapsed() > stall_limit() {
                        tracing::warn!(
                            stalled_ms = last_data.elapsed().as_millis() as u64,
                            "http stream stalled"
                        );
                        return ReaderState::Failed;
                    }
                }
                ReaderState::Reading
            }
        }
    }

    /// Close the current source and drop any staged bytes.
    pub fn close(&mut self) {
        self.source = None;
        self.window.clear();
    }
}
