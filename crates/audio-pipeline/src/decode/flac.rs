//! FLAC: metadata parsing, frame delimiting and per-frame decoding through Symphonia.
//!
//! Frames carry no length field, so a frame ends where the next valid frame header
//! starts. Headers are validated against STREAMINFO and their CRC-8 before being
//! trusted as a boundary.

use std::io;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_FLAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use super::{FileDecoderState, StepContext};
use crate::format::{StreamFormat, pack_q31};

const FLAC_MAGIC: &[u8; 4] = b"fLaC";
const STREAMINFO_LEN: usize = 34;
const BLOCK_TYPE_STREAMINFO: u8 = 0;
/// Boundary candidates tried before a frame is declared corrupt.
const MAX_BOUNDARY_CANDIDATES: usize = 4;

/// Decoded STREAMINFO block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StreamInfo {
    pub max_block_size: u16,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    /// Total samples per channel; `0` when unknown.
    pub total_samples: u64,
    raw: [u8; STREAMINFO_LEN],
}

impl StreamInfo {
    fn parse(raw: &[u8]) -> Option<Self> {
        let raw: [u8; STREAMINFO_LEN] = raw.get(..STREAMINFO_LEN)?.try_into().ok()?;
        let max_block_size = u16::from_be_bytes([raw[2], raw[3]]);
        let mut packed = [0u8; 8];
        packed.copy_from_slice(&raw[10..18]);
        let v = u64::from_be_bytes(packed);
        let info = Self {
            max_block_size,
            sample_rate: (v >> 44) as u32,
            channels: ((v >> 41) & 0x07) as u8 + 1,
            bits_per_sample: ((v >> 36) & 0x1F) as u8 + 1,
            total_samples: v & 0x0F_FFFF_FFFF,
            raw,
        };
        if info.sample_rate == 0 || info.max_block_size < 16 {
            return None;
        }
        Some(info)
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat::new(self.bits_per_sample, self.channels, self.sample_rate)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderState {
    Magic,
    BlockHeader,
    StreamInfo { len: usize, last: bool },
    Skip { remaining: usize, last: bool },
    Done,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeaderStatus {
    NeedMore,
    Complete(StreamInfo),
    Invalid(&'static str),
}

/// Incremental parser for the `fLaC` marker and the metadata blocks after it.
#[derive(Debug)]
pub(crate) struct FlacHeaderParser {
    state: HeaderState,
    info: Option<StreamInfo>,
}

impl FlacHeaderParser {
    pub(crate) fn new() -> Self {
        Self {
            state: HeaderState::Magic,
            info: None,
        }
    }

    /// Consume metadata bytes from `data`. Returns bytes consumed and the parse status.
    pub(crate) fn parse(&mut self, data: &[u8]) -> (usize, HeaderStatus) {
        let mut pos = 0;
        loop {
            let rest = &data[pos..];
            match self.state {
                HeaderState::Magic => {
                    if rest.len() < FLAC_MAGIC.len() {
                        return (pos, HeaderStatus::NeedMore);
                    }
                    if &rest[..4] != FLAC_MAGIC {
                        return (pos, HeaderStatus::Invalid("missing fLaC marker"));
                    }
                    pos += 4;
                    self.state = HeaderState::BlockHeader;
                }
                HeaderState::BlockHeader => {
                    if rest.len() < 4 {
                        return (pos, HeaderStatus::NeedMore);
                    }
                    let last = rest[0] & 0x80 != 0;
                    let block_type = rest[0] & 0x7F;
                    let len = u32::from_be_bytes([0, rest[1], rest[2], rest[3]]) as usize;
                    pos += 4;
                    self.state = if block_type == BLOCK_TYPE_STREAMINFO {
                        HeaderState::StreamInfo { len, last }
                    } else {
                        HeaderState::Skip {
                            remaining: len,
                            last,
                        }
                    };
                }
                HeaderState::StreamInfo { len, last } => {
                    if len < STREAMINFO_LEN {
                        return (pos, HeaderStatus::Invalid("STREAMINFO block too short"));
                    }
                    if rest.len() < len {
                        return (pos, HeaderStatus::NeedMore);
                    }
                    let Some(info) = StreamInfo::parse(rest) else {
                        return (pos, HeaderStatus::Invalid("malformed STREAMINFO"));
                    };
                    self.info = Some(info);
                    pos += len;
                    self.state = if last { HeaderState::Done } else { HeaderState::BlockHeader };
                }
                HeaderState::Skip { remaining, last } => {
                    let n = remaining.min(rest.len());
                    pos += n;
                    if n < remaining {
                        self.state = HeaderState::Skip {
                            remaining: remaining - n,
                            last,
                        };
                        return (pos, HeaderStatus::NeedMore);
                    }
                    self.state = if last { HeaderState::Done } else { HeaderState::BlockHeader };
                }
                HeaderState::Done => {
                    return match self.info.take() {
                        Some(info) => (pos, HeaderStatus::Complete(info)),
                        None => (pos, HeaderStatus::Invalid("no STREAMINFO block")),
                    };
                }
            }
        }
    }
}

/// CRC-8 with polynomial 0x07, as used by frame headers.
pub(crate) fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

/// Parse and validate a frame header at the start of `data`, returning its block size.
pub(crate) fn parse_frame_header(data: &[u8], info: &StreamInfo) -> Option<u32> {
    if data.len() < 6 || data[0] != 0xFF || data[1] & 0xFE != 0xF8 {
        return None;
    }
    let block_code = data[2] >> 4;
    let rate_code = data[2] & 0x0F;
    let channel_code = data[3] >> 4;
    let size_code = (data[3] >> 1) & 0x07;
    if block_code == 0 || rate_code == 0x0F || channel_code > 10 || size_code == 3 || data[3] & 0x01 != 0 {
        return None;
    }
    let channels = if channel_code < 8 { channel_code + 1 } else { 2 };
    if channels != info.channels {
        return None;
    }

    // UTF-8 style coded frame or sample number.
    let lead = data[4].leading_ones() as usize;
    let coded_len = match lead {
        0 => 1,
        2..=7 => lead,
        _ => return None,
    };
    let mut pos = 4 + coded_len;
    if data.len() < pos || !data[5..pos].iter().all(|b| b & 0xC0 == 0x80) {
        return None;
    }

    let block_size = match block_code {
        1 => 192,
        2..=5 => 576 << (block_code - 2),
        6 => {
            let v = *data.get(pos)? as u32 + 1;
            pos += 1;
            v
        }
        7 => {
            let v = u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]) as u32 + 1;
            pos += 2;
            v
        }
        _ => 256 << (block_code - 8),
    };
    pos += match rate_code {
        12 => 1,
        13 | 14 => 2,
        _ => 0,
    };

    let crc = *data.get(pos)?;
    if crc8(&data[..pos]) != crc || block_size > info.max_block_size as u32 {
        return None;
    }
    Some(block_size)
}

fn find_frame_header(data: &[u8], from: usize, info: &StreamInfo) -> Option<usize> {
    (from..data.len()).find(|&i| parse_frame_header(&data[i..], info).is_some())
}

pub(crate) struct FlacDecoder {
    header: FlacHeaderParser,
    info: Option<StreamInfo>,
    codec: Option<Box<dyn Decoder>>,
    samples_decoded: u64,
}

impl FlacDecoder {
    pub(crate) fn new() -> Self {
        Self {
            header: FlacHeaderParser::new(),
            info: None,
            codec: None,
            samples_decoded: 0,
        }
    }

    pub(crate) fn step(&mut self, ctx: &mut StepContext<'_>) -> FileDecoderState {
        match (self.info.clone(), self.codec.is_some()) {
            (Some(info), true) => self.decode_frame(ctx, &info),
            _ => self.read_header(ctx),
        }
    }

    fn read_header(&mut self, ctx: &mut StepContext<'_>) -> FileDecoderState {
        let (consumed, status) = self.header.parse(ctx.input.data());
        ctx.input.decrease_length(consumed);
        let info = match status {
            HeaderStatus::Complete(info) => info,
            HeaderStatus::NeedMore if consumed > 0 => return FileDecoderState::MoreToProcess,
            HeaderStatus::NeedMore => return FileDecoderState::PotentiallyFailed,
            HeaderStatus::Invalid(reason) => {
                tracing::warn!(reason, "invalid FLAC header");
                return FileDecoderState::Failed;
            }
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_FLAC)
            .with_sample_rate(info.sample_rate)
            .with_bits_per_sample(info.bits_per_sample as u32)
            .with_max_frames_per_packet(info.max_block_size as u64)
            .with_extra_data(Box::from(&info.raw[..]));
        if info.total_samples > 0 {
            params.with_n_frames(info.total_samples);
        }
        let codec = match symphonia::default::get_codecs().make(&params, &DecoderOptions::default()) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!("FLAC decoder rejected stream: {e}");
                return FileDecoderState::Failed;
            }
        };

        let format = info.stream_format();
        *ctx.free_required = info.max_block_size as usize * format.frame_size();
        if !ctx.output.reallocate(*ctx.free_required) {
            return FileDecoderState::Failed;
        }
        tracing::debug!(
            bits = info.bits_per_sample,
            channels = info.channels,
            rate = info.sample_rate,
            total_samples = info.total_samples,
            "parsed FLAC STREAMINFO"
        );
        *ctx.stream_format = Some(format);
        self.codec = Some(codec);
        self.info = Some(info);
        FileDecoderState::MoreToProcess
    }

    fn decode_frame(&mut self, ctx: &mut StepContext<'_>, info: &StreamInfo) -> FileDecoderState {
        let data = ctx.input.data();
        let Some(block_size) = parse_frame_header(data, info) else {
            // Lost sync: drop everything up to the next plausible frame.
            let skip = find_frame_header(data, 1, info).unwrap_or(data.len());
            tracing::debug!(bytes = skip, "skipped bytes while searching for FLAC frame");
            ctx.input.decrease_length(skip);
            return FileDecoderState::PotentiallyFailed;
        };

        let is_last_frame = info.total_samples > 0
            && self.samples_decoded + block_size as u64 >= info.total_samples;

        let mut boundary = find_frame_header(data, 2, info);
        let first_boundary = boundary;
        for _ in 0..MAX_BOUNDARY_CANDIDATES {
            let end = match boundary {
                Some(end) => end,
                None if ctx.input_ended || is_last_frame => data.len(),
                None => return FileDecoderState::PotentiallyFailed,
            };

            match self.decode_packet(&data[..end], info) {
                Ok(pcm) => {
                    let bytes = info.stream_format().bytes_per_sample();
                    let tail = ctx.output.tail_mut();
                    let n = pcm.len().min(tail.len() / bytes);
                    for (dst, &s) in tail.chunks_exact_mut(bytes).zip(&pcm[..n]) {
                        pack_q31(s, dst);
                    }
                    ctx.output.increase_length(n * bytes);
                    ctx.input.decrease_length(end);

                    self.samples_decoded += (n / info.channels as usize) as u64;
                    if info.total_samples > 0 && self.samples_decoded >= info.total_samples {
                        return FileDecoderState::EndOfFile;
                    }
                    if boundary.is_none() {
                        return FileDecoderState::EndOfFile;
                    }
                    return FileDecoderState::MoreToProcess;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    if boundary.is_none() && !ctx.input_ended {
                        return FileDecoderState::PotentiallyFailed;
                    }
                    // Truncated frame or a false boundary; try the next one.
                }
                Err(e) => tracing::trace!("FLAC frame candidate rejected: {e}"),
            }
            match boundary {
                Some(end) => boundary = find_frame_header(data, end + 1, info),
                None => break,
            }
        }

        // Corrupt frame: drop it and resync at the first plausible header.
        ctx.input.decrease_length(first_boundary.unwrap_or(data.len()));
        FileDecoderState::PotentiallyFailed
    }

    fn decode_packet(&mut self, frame: &[u8], info: &StreamInfo) -> Result<Vec<i32>, SymphoniaError> {
        let Some(codec) = self.codec.as_mut() else {
            return Err(SymphoniaError::Unsupported("FLAC decoder not initialised"));
        };
        let packet = Packet::new_from_slice(0, self.samples_decoded, info.max_block_size as u64, frame);
        let decoded = codec.decode(&packet)?;
        let mut samples = SampleBuffer::<i32>::new(decoded.frames() as u64, *decoded.spec());
        samples.copy_interleaved_ref(decoded);
        Ok(samples.samples().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::decode::{DecoderState, FormatDecoder};
    use crate::format::AudioFileType;
    use crate::ring_buffer::RingBuffer;
    use crate::sink::MemorySink;

    fn crc16(data: &[u8]) -> u16 {
        let mut crc = 0u16;
        for &b in data {
            crc ^= (b as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
            }
        }
        crc
    }

    fn streaminfo(block: u16, rate: u32, channels: u8, bits: u8, total: u64) -> Vec<u8> {
        let mut raw = Vec::with_capacity(STREAMINFO_LEN);
        raw.extend_from_slice(&block.to_be_bytes());
        raw.extend_from_slice(&block.to_be_bytes());
        raw.extend_from_slice(&[0; 6]);
        let packed = ((rate as u64) << 44)
            | (((channels - 1) as u64) << 41)
            | (((bits - 1) as u64) << 36)
            | total;
        raw.extend_from_slice(&packed.to_be_bytes());
        raw.extend_from_slice(&[0; 16]);
        raw
    }

    /// Mono 16-bit frame of `block` samples holding one constant value.
    fn constant_frame(number: u8, block: u8, value: i16) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xF8, 0x60, 0x08, number, block - 1];
        frame.push(crc8(&frame));
        frame.push(0x00); // CONSTANT subframe, no wasted bits
        frame.extend_from_slice(&value.to_be_bytes());
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame
    }

    fn stream(frames: &[Vec<u8>], total: u64) -> Vec<u8> {
        let mut data = FLAC_MAGIC.to_vec();
        // APPLICATION block first, to exercise skipping.
        data.extend_from_slice(&[0x02, 0x00, 0x00, 0x04, b't', b'e', b's', b't']);
        data.extend_from_slice(&[0x80, 0x00, 0x00, STREAMINFO_LEN as u8]);
        data.extend_from_slice(&streaminfo(16, 8_000, 1, 16, total));
        for f in frames {
            data.extend_from_slice(f);
        }
        data
    }

    #[test]
    fn crc8_reference_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn metadata_parses_incrementally() {
        let data = stream(&[], 32);
        let mut p = FlacHeaderParser::new();
        let (first, status) = p.parse(&data[..10]);
        assert_eq!(status, HeaderStatus::NeedMore);
        let (second, status) = p.parse(&data[first..]);
        assert_eq!(first + second, data.len());
        match status {
            HeaderStatus::Complete(info) => {
                assert_eq!(info.sample_rate, 8_000);
                assert_eq!(info.channels, 1);
                assert_eq!(info.bits_per_sample, 16);
                assert_eq!(info.total_samples, 32);
                assert_eq!(info.max_block_size, 16);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn frame_header_validation() {
        let info = StreamInfo::parse(&streaminfo(16, 8_000, 1, 16, 0)).unwrap();
        let frame = constant_frame(0, 16, 7);
        assert_eq!(parse_frame_header(&frame, &info), Some(16));

        let mut corrupted = frame.clone();
        corrupted[4] = 0x05;
        assert_eq!(parse_frame_header(&corrupted, &info), None);

        let stereo = StreamInfo::parse(&streaminfo(16, 8_000, 2, 16, 0)).unwrap();
        assert_eq!(parse_frame_header(&frame, &stereo), None);
    }

    #[test]
    fn decodes_frames_until_total_samples() {
        let data = stream(&[constant_frame(0, 16, 0x1234), constant_frame(1, 16, -2)], 32);
        let ring = Arc::new(RingBuffer::new(1024));
        ring.write(&data);
        let sink = Arc::new(MemorySink::new());

        let mut decoder = FormatDecoder::new(512, 512);
        decoder.add_source(&ring);
        decoder.add_sink(sink.clone());
        decoder.start(AudioFileType::Flac).unwrap();

        let mut state = DecoderState::Decoding;
        for _ in 0..5 {
            state = decoder.decode(false);
            if state != DecoderState::Decoding {
                break;
            }
        }
        // End of file is reached without the source having to finish.
        assert_eq!(state, DecoderState::Decoding);
        for _ in 0..50 {
            state = decoder.decode(true);
            if state != DecoderState::Decoding {
                break;
            }
        }
        assert_eq!(state, DecoderState::Finished);
        assert_eq!(decoder.stream_format(), Some(StreamFormat::new(16, 1, 8_000)));

        let pcm = sink.captured();
        assert_eq!(pcm.len(), 64);
        assert_eq!(&pcm[..2], &0x1234i16.to_le_bytes());
        assert_eq!(&pcm[62..], &(-2i16).to_le_bytes());
    }
}
