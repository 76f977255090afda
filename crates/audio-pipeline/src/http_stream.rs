//! HTTP connection used by the network reader.
//!
//! `ureq` only offers blocking body reads, so the body is pumped by a background thread
//! into a [`RingBuffer`]. The reader then pulls from that ring with the same short
//! timeouts it uses everywhere else.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ureq::Agent;
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::{
    Buffers, ConnectionDetails, Connector, DefaultConnector, NextTimeout, Transport,
};

use crate::error::PipelineError;
use crate::format::AudioFileType;
use crate::ring_buffer::RingBuffer;

pub(crate) const READ_WRITE_TIMEOUT: Duration = Duration::from_millis(20);
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_millis(5000);
pub(crate) const MAX_FETCHING_HEADER_ATTEMPTS: u32 = 6;
const HTTP_CHUNK_SIZE: usize = 2048;
const MAX_REDIRECTIONS: u32 = 5;
/// Longest a single body read may block before the pump checks for cancellation.
const BODY_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a stream may go without delivering a byte before it counts as failed.
pub(crate) fn stall_limit() -> Duration {
    CONNECTION_TIMEOUT * MAX_FETCHING_HEADER_ATTEMPTS
}

/// Connector stage that bounds every otherwise unbounded socket wait.
///
/// ureq only offers a total budget for the body, which would cut off long streams.
#[derive(Debug)]
struct ReadTimeoutConnector {
    limit: Duration,
}

impl Connector<Box<dyn Transport>> for ReadTimeoutConnector {
    type Out = ReadTimeoutTransport;

    fn connect(
        &self,
        _details: &ConnectionDetails,
        chained: Option<Box<dyn Transport>>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        Ok(chained.map(|inner| ReadTimeoutTransport {
            inner,
            limit: self.limit,
        }))
    }
}

#[derive(Debug)]
struct ReadTimeoutTransport {
    inner: Box<dyn Transport>,
    limit: Duration,
}

impl Transport for ReadTimeoutTransport {
    fn buffers(&mut self) -> &mut dyn Buffers {
        self.inner.buffers()
    }

    fn transmit_output(&mut self, amount: usize, timeout: NextTimeout) -> Result<(), ureq::Error> {
        self.inner.transmit_output(amount, timeout)
    }

    fn await_input(&mut self, timeout: NextTimeout) -> Result<bool, ureq::Error> {
        let timeout = if timeout.after.is_not_happening() {
            NextTimeout {
                after: self.limit.into(),
                reason: timeout.reason,
            }
        } else {
            timeout
        };
        self.inner.await_input(timeout)
    }

    fn is_open(&mut self) -> bool {
        self.inner.is_open()
    }

    fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }
}

fn agent() -> Agent {
    let config = Agent::config_builder()
        .timeout_connect(Some(CONNECTION_TIMEOUT))
        .timeout_recv_response(Some(CONNECTION_TIMEOUT))
        .max_redirects(MAX_REDIRECTIONS)
        .http_status_as_error(false)
        .build();
    let connector = DefaultConnector::new().chain(ReadTimeoutConnector {
        limit: BODY_READ_TIMEOUT,
    });
    Agent::with_parts(config, connector, DefaultResolver::default())
}

/// Flags shared with the body pump thread.
#[derive(Debug, Default)]
struct BodyState {
    complete: AtomicBool,
    failed: AtomicBool,
    cancel: AtomicBool,
}

/// An open HTTP response whose body is streamed into a ring buffer.
pub(crate) struct HttpConnection {
    body: Arc<RingBuffer>,
    state: Arc<BodyState>,
    file_type: AudioFileType,
}

impl HttpConnection {
    /// Connect to `url`, following redirects, and start pumping the body.
    ///
    /// The container type comes from the `Content-Type` header, falling back to the URL
    /// extension when the header is missing or unrecognised.
    pub(crate) fn open(url: &str, body_buffer_size: usize) -> Result<Self, PipelineError> {
        let agent = agent();
        let mut attempt = 0;
        let resp = loop {
            attempt += 1;
            match agent.get(url).call() {
                Ok(resp) => break resp,
                Err(ureq::Error::Timeout(which)) if attempt < MAX_FETCHING_HEADER_ATTEMPTS => {
                    tracing::debug!(attempt, timeout = ?which, "http headers not available yet");
                }
                Err(e) => return Err(PipelineError::Network(e.to_string())),
            }
        };

        let status = resp.status().as_u16();
        if !(200..=308).contains(&status) {
            return Err(PipelineError::HttpStatus(status));
        }

        let content_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let mut file_type = content_type
            .as_deref()
            .map(file_type_from_content_type)
            .unwrap_or_default();
        if file_type == AudioFileType::None {
            file_type = AudioFileType::from_extension(url);
        }
        if file_type == AudioFileType::None {
            tracing::warn!(content_type = ?content_type, url, "unable to determine container type");
            return Err(PipelineError::NotSupported);
        }
        tracing::debug!(status, content_type = ?content_type, %file_type, "http stream opened");

        let body = Arc::new(RingBuffer::new(body_buffer_size.max(HTTP_CHUNK_SIZE)));
        let state = Arc::new(BodyState::default());

        let (_, resp_body) = resp.into_parts();
        let reader = resp_body.into_reader();
        let body_thread = body.clone();
        let state_thread = state.clone();
        thread::Builder::new()
            .name("http-body".to_string())
            .spawn(move || pump_body(reader, &body_thread, &state_thread, stall_limit()))
            .map_err(|_| PipelineError::InvalidState)?;

        Ok(Self {
            body,
            state,
            file_type,
        })
    }

    pub(crate) fn file_type(&self) -> AudioFileType {
        self.file_type
    }

    /// Read body bytes, waiting up to `timeout` for some to arrive.
    pub(crate) fn read(&self, out: &mut [u8], timeout: Duration) -> usize {
        self.body.read(out, timeout)
    }

    /// The whole body has been received and handed to [`read`](Self::read).
    pub(crate) fn is_complete(&self) -> bool {
        self.state.complete.load(Ordering::Acquire) && self.body.available() == 0
    }

    /// The connection failed with a non-transient error or stalled.
    pub(crate) fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::Acquire) && self.body.available() == 0
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.state.cancel.store(true, Ordering::Release);
        self.body.reset();
    }
}

/// Body pump: copies the response into `ring` until EOF, failure or cancel.
///
/// Read timeouts are retried until nothing has arrived for `stall_limit`.
fn pump_body(mut reader: impl Read, ring: &RingBuffer, state: &BodyState, stall_limit: Duration) {
    let mut chunk = [0u8; HTTP_CHUNK_SIZE];
    let mut last_data = Instant::now();
    loop {
        if state.cancel.load(Ordering::Acquire) {
            return;
        }
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                state.complete.store(true, Ordering::Release);
                return;
            }
            Ok(n) => n,
            Err(e) if is_transient(&e) => {
                if last_data.elapsed() > stall_limit {
                    tracing::warn!(
                        stalled_ms = last_data.elapsed().as_millis() as u64,
                        "http body stalled"
                    );
                    state.failed.store(true, Ordering::Release);
                    return;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!("http body read failed: {e}");
                state.failed.store(true, Ordering::Release);
                return;
            }
        };
        last_data = Instant::now();

        let mut offset = 0;
        while offset < n {
            if state.cancel.load(Ordering::Acquire) {
                return;
            }
            offset += ring.write_without_replacement(&chunk[offset..n], READ_WRITE_TIMEOUT);
        }
    }
}

/// ureq reports its own timeouts wrapped in an `Other` error.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) || e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ureq::Error>())
        .is_some_and(|inner| matches!(inner, ureq::Error::Timeout(_)))
}

/// Map a `Content-Type` header value to a container type.
pub(crate) fn file_type_from_content_type(content_type: &str) -> AudioFileType {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "mp3" | "audio/mp3" | "audio/mpeg" => AudioFileType::Mp3,
        "audio/wav" => AudioFileType::Wav,
        "audio/flac" | "audio/x-flac" => AudioFileType::Flac,
        _ => AudioFileType::None,
    }
}

/// One-shot local HTTP server for network tests.
#[cfg(test)]
pub(crate) mod test_server {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    /// A `200 OK` head announcing `content_length` bytes, followed by `body`.
    pub(crate) fn response(content_type: &str, content_length: usize, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Accept one connection, answer with `response`, keep the socket open for `hold`,
    /// then close it. Returns the base URL.
    pub(crate) fn serve_once(response: Vec<u8>, hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(&response);
            let _ = stream.flush();
            thread::sleep(hold);
        });
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_server::{response, serve_once};

    const NO_STALL_LIMIT: Duration = Duration::from_secs(3600);

    #[test]
    fn content_type_mapping() {
        assert_eq!(file_type_from_content_type("audio/mpeg"), AudioFileType::Mp3);
        assert_eq!(file_type_from_content_type("MP3"), AudioFileType::Mp3);
        assert_eq!(file_type_from_content_type("Audio/X-FLAC"), AudioFileType::Flac);
        assert_eq!(file_type_from_content_type("audio/wav; charset=binary"), AudioFileType::Wav);
        assert_eq!(file_type_from_content_type("text/html"), AudioFileType::None);
    }

    #[test]
    fn pump_copies_body_and_marks_complete() {
        let ring = RingBuffer::new(16);
        let state = BodyState::default();
        pump_body(io::Cursor::new(vec![7u8; 10]), &ring, &state, NO_STALL_LIMIT);
        assert!(state.complete.load(Ordering::Acquire));
        assert_eq!(ring.available(), 10);
    }

    #[test]
    fn pump_flags_hard_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
        }
        let ring = RingBuffer::new(16);
        let state = BodyState::default();
        pump_body(Broken, &ring, &state, NO_STALL_LIMIT);
        assert!(state.failed.load(Ordering::Acquire));
        assert!(!state.complete.load(Ordering::Acquire));
    }

    #[test]
    fn pump_retries_timeouts() {
        struct Flaky {
            calls: u32,
        }
        impl Read for Flaky {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.calls += 1;
                match self.calls {
                    1 => Err(io::Error::other(ureq::Error::Timeout(ureq::Timeout::RecvBody))),
                    2 => Err(io::Error::new(io::ErrorKind::TimedOut, "slow")),
                    3 => {
                        buf[..4].copy_from_slice(&[1, 2, 3, 4]);
                        Ok(4)
                    }
                    _ => Ok(0),
                }
            }
        }
        let ring = RingBuffer::new(16);
        let state = BodyState::default();
        pump_body(Flaky { calls: 0 }, &ring, &state, NO_STALL_LIMIT);
        assert!(state.complete.load(Ordering::Acquire));
        assert!(!state.failed.load(Ordering::Acquire));
        assert_eq!(ring.available(), 4);
    }

    #[test]
    fn pump_fails_once_the_body_stalls() {
        struct Silent;
        impl Read for Silent {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                thread::sleep(Duration::from_millis(5));
                Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
            }
        }
        let ring = RingBuffer::new(16);
        let state = BodyState::default();
        pump_body(Silent, &ring, &state, Duration::from_millis(50));
        assert!(state.failed.load(Ordering::Acquire));
    }

    #[test]
    fn pump_stops_when_cancelled() {
        struct Silent;
        impl Read for Silent {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                thread::sleep(Duration::from_millis(5));
                Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
            }
        }
        let ring = RingBuffer::new(16);
        let state = BodyState::default();
        state.cancel.store(true, Ordering::Release);
        pump_body(Silent, &ring, &state, NO_STALL_LIMIT);
        assert!(!state.failed.load(Ordering::Acquire));
        assert!(!state.complete.load(Ordering::Acquire));
    }

    #[test]
    fn dropping_a_stalled_connection_ends_the_pump() {
        // Three bytes of a much longer body, then the server goes quiet.
        let url = serve_once(response("audio/mpeg", 100_000, &[1, 2, 3]), Duration::from_secs(10));
        let conn = HttpConnection::open(&format!("{url}/stream"), 4096).expect("open stream");
        assert_eq!(conn.file_type(), AudioFileType::Mp3);

        let mut out = [0u8; 16];
        let mut received = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while received < 3 && Instant::now() < deadline {
            received += conn.read(&mut out[received..], READ_WRITE_TIMEOUT);
        }
        assert_eq!(&out[..received], &[1, 2, 3]);

        let body = conn.body.clone();
        drop(conn);
        let deadline = Instant::now() + BODY_READ_TIMEOUT * 3;
        while Arc::strong_count(&body) > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(Arc::strong_count(&body), 1, "body pump still running");
    }
}
