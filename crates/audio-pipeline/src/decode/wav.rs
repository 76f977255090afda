//! RIFF/WAVE container: header parsing, then PCM passthrough.

use super::{FileDecoderState, StepContext};
use crate::format::StreamFormat;

/// PCM needs no minimum block size; this just keeps copies reasonably sized.
pub(crate) const MIN_FREE_OUTPUT: usize = 1024;

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderState {
    Riff,
    ChunkHeader,
    Fmt { len: usize },
    Skip { remaining: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WavHeader {
    pub format: StreamFormat,
    /// Declared `data` chunk length; `None` for streams written without one.
    pub data_len: Option<usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeaderStatus {
    NeedMore,
    InData(WavHeader),
    Invalid(&'static str),
}

/// Incremental RIFF parser. Chunks before `data` may span many input windows.
#[derive(Debug)]
pub(crate) struct WavHeaderParser {
    state: HeaderState,
    format: Option<StreamFormat>,
}

impl WavHeaderParser {
    pub(crate) fn new() -> Self {
        Self {
            state: HeaderState::Riff,
            format: None,
        }
    }

    /// Consume header bytes from `data`. Returns bytes consumed and the parse status.
    pub(crate) fn parse(&mut self, data: &[u8]) -> (usize, HeaderStatus) {
        let mut pos = 0;
        loop {
            let rest = &data[pos..];
            match self.state {
                HeaderState::Riff => {
                    if rest.len() < 12 {
                        return (pos, HeaderStatus::NeedMore);
                    }
                    if &rest[0..4] != b"RIFF" || &rest[8..12] != b"WAVE" {
                        return (pos, HeaderStatus::Invalid("not a RIFF/WAVE stream"));
                    }
                    pos += 12;
                    self.state = HeaderState::ChunkHeader;
                }
                HeaderState::ChunkHeader => {
                    if rest.len() < 8 {
                        return (pos, HeaderStatus::NeedMore);
                    }
                    let id = &rest[0..4];
                    let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
                    pos += 8;
                    match id {
                        b"fmt " => self.state = HeaderState::Fmt { len: len as usize },
                        b"data" => {
                            let Some(format) = self.format else {
                                return (pos, HeaderStatus::Invalid("data chunk before fmt chunk"));
                            };
                            let data_len = match len {
                                0 | u32::MAX => None,
                                n => Some(n as usize),
                            };
                            return (pos, HeaderStatus::InData(WavHeader { format, data_len }));
                        }
                        // Chunks are word aligned.
                        _ => {
                            self.state = HeaderState::Skip {
                                remaining: len as usize + (len as usize & 1),
                            }
                        }
                    }
                }
                HeaderState::Fmt { len } => {
                    if len < 16 {
                        return (pos, HeaderStatus::Invalid("fmt chunk too short"));
                    }
                    if rest.len() < len {
                        return (pos, HeaderStatus::NeedMore);
                    }
                    let tag = u16::from_le_bytes([rest[0], rest[1]]);
                    if tag != WAVE_FORMAT_PCM && tag != WAVE_FORMAT_EXTENSIBLE {
                        return (pos, HeaderStatus::Invalid("only integer PCM is supported"));
                    }
                    let channels = u16::from_le_bytes([rest[2], rest[3]]);
                    let rate = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
                    let bits = u16::from_le_bytes([rest[14], rest[15]]);
                    if channels == 0 || channels > 8 || rate == 0 || !matches!(bits, 8 | 16 | 24 | 32) {
                        return (pos, HeaderStatus::Invalid("unsupported PCM layout"));
                    }
                    self.format = Some(StreamFormat::new(bits as u8, channels as u8, rate));
                    self.state = HeaderState::Skip {
                        remaining: len & 1,
                    };
                    pos += len;
                }
                HeaderState::Skip { remaining } => {
                    let n = remaining.min(rest.len());
                    pos += n;
                    if n < remaining {
                        self.state = HeaderState::Skip {
                            remaining: remaining - n,
                        };
                        return (pos, HeaderStatus::NeedMore);
                    }
                    self.state = HeaderState::ChunkHeader;
                }
            }
        }
    }
}

pub(crate) struct WavDecoder {
    header: WavHeaderParser,
    bytes_left: usize,
    has_known_end: bool,
}

impl WavDecoder {
    pub(crate) fn new() -> Self {
        Self {
            header: WavHeaderParser::new(),
            bytes_left: 0,
            has_known_end: false,
        }
    }

    pub(crate) fn step(&mut self, ctx: &mut StepContext<'_>) -> FileDecoderState {
        if ctx.stream_format.is_none() {
            let (consumed, status) = self.header.parse(ctx.input.data());
            ctx.input.decrease_length(consumed);
            return match status {
                HeaderStatus::InData(header) => {
                    *ctx.stream_format = Some(header.format);
                    self.bytes_left = header.data_len.unwrap_or(0);
                    self.has_known_end = header.data_len.is_some();
                    FileDecoderState::MoreToProcess
                }
                HeaderStatus::NeedMore if consumed > 0 => FileDecoderState::MoreToProcess,
                HeaderStatus::NeedMore => FileDecoderState::PotentiallyFailed,
                HeaderStatus::Invalid(reason) => {
                    tracing::warn!(reason, "invalid WAV header");
                    FileDecoderState::Failed
                }
            };
        }

        if self.has_known_end && self.bytes_left == 0 {
            return FileDecoderState::EndOfFile;
        }

        let mut n = ctx.input.available().min(ctx.output.free());
        if self.has_known_end {
            n = n.min(self.bytes_left);
        }
        if n > 0 {
            ctx.output.tail_mut()[..n].copy_from_slice(&ctx.input.data()[..n]);
            ctx.input.decrease_length(n);
            ctx.output.increase_length(n);
            if self.has_known_end {
                self.bytes_left -= n;
            }
        }
        FileDecoderState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::wav_header;

    #[test]
    fn parses_canonical_header() {
        let mut p = WavHeaderParser::new();
        let h = wav_header(16, 2, 44_100, 4000);
        let (consumed, status) = p.parse(&h);
        assert_eq!(consumed, 44);
        assert_eq!(
            status,
            HeaderStatus::InData(WavHeader {
                format: StreamFormat::new(16, 2, 44_100),
                data_len: Some(4000),
            })
        );
    }

    #[test]
    fn header_split_across_calls() {
        let mut p = WavHeaderParser::new();
        let h = wav_header(24, 1, 48_000, 0);
        let (first, status) = p.parse(&h[..20]);
        assert_eq!(status, HeaderStatus::NeedMore);
        assert_eq!(first, 20);
        let (second, status) = p.parse(&h[first..]);
        assert_eq!(first + second, 44);
        match status {
            HeaderStatus::InData(header) => {
                assert_eq!(header.format, StreamFormat::new(24, 1, 48_000));
                assert_eq!(header.data_len, None);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn skips_unknown_chunks() {
        let h = wav_header(16, 1, 8_000, 10);
        let mut file = h[..36].to_vec();
        file.extend_from_slice(b"LIST");
        file.extend_from_slice(&3u32.to_le_bytes());
        file.extend_from_slice(&[0xAA; 4]); // 3 bytes plus pad
        file.extend_from_slice(&h[36..]);

        let mut p = WavHeaderParser::new();
        let (consumed, status) = p.parse(&file);
        assert_eq!(consumed, file.len());
        assert!(matches!(status, HeaderStatus::InData(_)));
    }

    #[test]
    fn rejects_non_riff() {
        let mut p = WavHeaderParser::new();
        let (_, status) = p.parse(b"OggS\0\0\0\0\0\0\0\0");
        assert!(matches!(status, HeaderStatus::Invalid(_)));
    }
}
