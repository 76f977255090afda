//! MPEG audio Layer III: frame sync, then one frame per step through Symphonia.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_MP3, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use super::{FileDecoderState, StepContext};
use crate::format::StreamFormat;

const SAMPLES_PER_FRAME: usize = 1152;
/// One stereo MPEG-1 frame of 16-bit samples.
pub(crate) const MIN_FREE_OUTPUT: usize = SAMPLES_PER_FRAME * 2 * 2;
const HEADER_LEN: usize = 4;

const BITRATES_V1: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];
const SAMPLE_RATES: [[u32; 3]; 3] = [[44_100, 48_000, 32_000], [22_050, 24_000, 16_000], [11_025, 12_000, 8_000]];

/// Fields of a validated Layer III frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_len: usize,
    pub samples_per_channel: usize,
}

/// Parse a 4-byte frame header, rejecting reserved and free-format values.
pub(crate) fn parse_header(b: &[u8]) -> Option<FrameHeader> {
    if b.len() < HEADER_LEN || b[0] != 0xFF || b[1] & 0xE0 != 0xE0 {
        return None;
    }
    // 0 = MPEG 2.5, 2 = MPEG 2, 3 = MPEG 1
    let version = (b[1] >> 3) & 0x03;
    let layer = (b[1] >> 1) & 0x03;
    if version == 1 || layer != 1 {
        return None;
    }
    let bitrate_index = (b[2] >> 4) as usize;
    let rate_index = ((b[2] >> 2) & 0x03) as usize;
    if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }
    let padding = ((b[2] >> 1) & 0x01) as usize;
    let channels = if b[3] >> 6 == 3 { 1 } else { 2 };

    let (bitrate_kbps, rates, coefficient, samples_per_channel) = match version {
        3 => (BITRATES_V1[bitrate_index], SAMPLE_RATES[0], 144, SAMPLES_PER_FRAME),
        2 => (BITRATES_V2[bitrate_index], SAMPLE_RATES[1], 72, SAMPLES_PER_FRAME / 2),
        _ => (BITRATES_V2[bitrate_index], SAMPLE_RATES[2], 72, SAMPLES_PER_FRAME / 2),
    };
    let sample_rate = rates[rate_index];
    let frame_len = coefficient * bitrate_kbps as usize * 1000 / sample_rate as usize + padding;

    Some(FrameHeader {
        sample_rate,
        channels,
        frame_len,
        samples_per_channel,
    })
}

/// Offset of the first valid frame header in `data`.
pub(crate) fn find_sync(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(HEADER_LEN - 1)).find(|&i| parse_header(&data[i..]).is_some())
}

pub(crate) struct Mp3Decoder {
    codec: Box<dyn Decoder>,
    frames_decoded: u64,
}

impl Mp3Decoder {
    pub(crate) fn new() -> Result<Self, SymphoniaError> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        let codec = symphonia::default::get_codecs().make(&params, &DecoderOptions::default())?;
        Ok(Self {
            codec,
            frames_decoded: 0,
        })
    }

    pub(crate) fn step(&mut self, ctx: &mut StepContext<'_>) -> FileDecoderState {
        let Some(offset) = find_sync(ctx.input.data()) else {
            // A header may straddle the window end; keep its possible first bytes.
            let garbage = ctx.input.available().saturating_sub(HEADER_LEN - 1);
            ctx.input.decrease_length(garbage);
            return FileDecoderState::PotentiallyFailed;
        };
        if offset > 0 {
            tracing::trace!(bytes = offset, "skipped bytes before mp3 frame sync");
        }
        ctx.input.decrease_length(offset);

        let Some(header) = parse_header(ctx.input.data()) else {
            return FileDecoderState::PotentiallyFailed;
        };
        if ctx.input.available() < header.frame_len {
            return FileDecoderState::PotentiallyFailed;
        }

        let frame_ts = self.frames_decoded * header.samples_per_channel as u64;
        let packet = Packet::new_from_slice(
            0,
            frame_ts,
            header.samples_per_channel as u64,
            &ctx.input.data()[..header.frame_len],
        );
        let result = self.codec.decode(&packet).map(|decoded| {
            let mut samples = SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
            samples.copy_interleaved_ref(decoded);
            samples
        });
        ctx.input.decrease_length(header.frame_len);

        let samples = match result {
            Ok(samples) => samples,
            Err(e) => {
                // Usually a starved bit reservoir; the next frame normally decodes.
                tracing::debug!("skipping undecodable mp3 frame: {e}");
                return FileDecoderState::PotentiallyFailed;
            }
        };
        self.frames_decoded += 1;

        let pcm = samples.samples();
        if !pcm.is_empty() {
            let tail = ctx.output.tail_mut();
            let n = pcm.len().min(tail.len() / 2);
            for (dst, s) in tail.chunks_exact_mut(2).zip(&pcm[..n]) {
                dst.copy_from_slice(&s.to_le_bytes());
            }
            ctx.output.increase_length(n * 2);

            if ctx.stream_format.is_none() {
                *ctx.stream_format = Some(StreamFormat::new(16, header.channels, header.sample_rate));
            }
        }
        FileDecoderState::MoreToProcess
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::decode::{DecoderState, FormatDecoder};
    use crate::format::AudioFileType;
    use crate::ring_buffer::RingBuffer;
    use crate::sink::MemorySink;

    /// A silent MPEG-1 Layer III frame: 128 kbit/s, 44.1 kHz, stereo, no CRC.
    pub(crate) fn silent_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 417];
        frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        frame
    }

    #[test]
    fn header_fields() {
        let h = parse_header(&[0xFF, 0xFB, 0x90, 0x00]).unwrap();
        assert_eq!(h.sample_rate, 44_100);
        assert_eq!(h.channels, 2);
        assert_eq!(h.frame_len, 417);
        assert_eq!(h.samples_per_channel, 1152);

        // Padded mono MPEG-2 frame: 64 kbit/s at 22.05 kHz.
        let h = parse_header(&[0xFF, 0xF3, 0x82, 0xC0]).unwrap();
        assert_eq!(h.sample_rate, 22_050);
        assert_eq!(h.channels, 1);
        assert_eq!(h.frame_len, 72 * 64_000 / 22_050 + 1);
    }

    #[test]
    fn rejects_reserved_values() {
        assert!(parse_header(&[0xFF, 0xFB, 0xF0, 0x00]).is_none()); // bad bitrate
        assert!(parse_header(&[0xFF, 0xFB, 0x9C, 0x00]).is_none()); // reserved rate
        assert!(parse_header(&[0xFF, 0xFD, 0x90, 0x00]).is_none()); // layer II
        assert!(parse_header(&[0xFF, 0xEB, 0x90, 0x00]).is_none()); // reserved version
    }

    #[test]
    fn sync_skips_false_starts() {
        let mut data = vec![0x00, 0xFF, 0xFF, 0x12, 0x34];
        data.extend_from_slice(&silent_frame());
        assert_eq!(find_sync(&data), Some(5));
        assert_eq!(find_sync(&[0xFF, 0xFB, 0x90]), None);
    }

    #[test]
    fn garbage_before_frame_is_discarded() {
        let garbage = [0x12u8, 0x00, 0xFF, 0x07, 0x42, 0x99, 0x00];
        let mut stream = garbage.to_vec();
        stream.extend_from_slice(&silent_frame());

        let ring = Arc::new(RingBuffer::new(4096));
        ring.write(&stream);
        let sink = Arc::new(MemorySink::new());

        let mut decoder = FormatDecoder::new(2048, 8192);
        decoder.add_source(&ring);
        decoder.add_sink(sink.clone());
        decoder.start(AudioFileType::Mp3).unwrap();

        let mut state = DecoderState::Decoding;
        for _ in 0..50 {
            state = decoder.decode(true);
            if state != DecoderState::Decoding {
                break;
            }
        }
        assert_eq!(state, DecoderState::Finished);
        assert_eq!(decoder.stream_format(), Some(StreamFormat::new(16, 2, 44_100)));
        // Exactly one frame of output: every garbage byte was dropped, none of the frame.
        assert_eq!(sink.captured_len(), 1152 * 2 * 2);
    }
}
