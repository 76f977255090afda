//! Stream format descriptor and unit conversions.
//!
//! Every stage describes PCM with a [`StreamFormat`]. Conversions between bytes,
//! frames, samples and durations are integer-only; the duration helpers carry a
//! frame remainder so callers can accumulate playback time without drift.

use std::fmt;
use std::sync::Arc;

/// Immutable PCM descriptor: bits per sample, channel count and sample rate.
#[derive(Clone, Copy, Debug)]
pub struct StreamFormat {
    bits_per_sample: u8,
    channels: u8,
    sample_rate: u32,
    bytes_per_sample: usize,
    ms_sample_rate_gcd: u32,
}

impl StreamFormat {
    pub fn new(bits_per_sample: u8, channels: u8, sample_rate: u32) -> Self {
        Self {
            bits_per_sample,
            channels,
            sample_rate,
            bytes_per_sample: (bits_per_sample as usize).div_ceil(8),
            ms_sample_rate_gcd: gcd(1000, sample_rate),
        }
    }

    pub fn bits_per_sample(&self) -> u8 {
        self.bits_per_sample
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    /// Bytes in one frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample * self.channels as usize
    }

    /// Duration in milliseconds of `bytes` of audio, truncated.
    pub fn bytes_to_ms(&self, bytes: usize) -> u32 {
        let denom = self.sample_rate as u64 * self.frame_size() as u64;
        if denom == 0 {
            return 0;
        }
        (bytes as u64 * 1000 / denom) as u32
    }

    pub fn bytes_to_frames(&self, bytes: usize) -> u32 {
        match self.frame_size() {
            0 => 0,
            size => (bytes / size) as u32,
        }
    }

    pub fn bytes_to_samples(&self, bytes: usize) -> u32 {
        match self.bytes_per_sample {
            0 => 0,
            size => (bytes / size) as u32,
        }
    }

    pub fn frames_to_bytes(&self, frames: u32) -> usize {
        frames as usize * self.frame_size()
    }

    pub fn samples_to_bytes(&self, samples: u32) -> usize {
        samples as usize * self.bytes_per_sample
    }

    pub fn ms_to_frames(&self, ms: u32) -> u32 {
        (ms as u64 * self.sample_rate as u64 / 1000) as u32
    }

    pub fn ms_to_samples(&self, ms: u32) -> u32 {
        (ms as u64 * self.channels as u64 * self.sample_rate as u64 / 1000) as u32
    }

    pub fn ms_to_bytes(&self, ms: u32) -> usize {
        (ms as u64 * self.frame_size() as u64 * self.sample_rate as u64 / 1000) as usize
    }

    /// Duration of `frames` in microseconds, rounded to the nearest microsecond.
    pub fn frames_to_microseconds(&self, frames: u32) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        let rate = self.sample_rate as u64;
        ((frames as u64 * 1_000_000 + rate / 2) / rate) as u32
    }

    /// Convert the evenly divisible part of `frames` into whole milliseconds.
    ///
    /// Frames that do not add up to a whole millisecond (in units of
    /// `rate / gcd(1000, rate)`) are written back into `frames`. Add new frames to the
    /// returned remainder on the next call to keep the running total exact.
    pub fn frames_to_milliseconds_with_remainder(&self, frames: &mut u32) -> u32 {
        if self.sample_rate == 0 {
            return 0;
        }
        let frames_per_unit = self.sample_rate / self.ms_sample_rate_gcd;
        let unprocessable = *frames % frames_per_unit;
        let processable = *frames - unprocessable;
        let ms = (processable as u64 * 1000 / self.sample_rate as u64) as u32;
        *frames = unprocessable;
        ms
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(16, 1, 16_000)
    }
}

impl PartialEq for StreamFormat {
    fn eq(&self, other: &Self) -> bool {
        self.bits_per_sample == other.bits_per_sample
            && self.channels == other.channels
            && self.sample_rate == other.sample_rate
    }
}

impl Eq for StreamFormat {}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {} bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Container type of an encoded stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AudioFileType {
    #[default]
    None,
    Flac,
    Mp3,
    Wav,
}

impl fmt::Display for AudioFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFileType::Flac => "FLAC",
            AudioFileType::Mp3 => "MP3",
            AudioFileType::Wav => "WAV",
            AudioFileType::None => "unknown",
        };
        f.write_str(name)
    }
}

impl AudioFileType {
    /// Guess the container from a file name or URL path extension.
    pub fn from_extension(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".wav") {
            AudioFileType::Wav
        } else if lower.ends_with(".mp3") {
            AudioFileType::Mp3
        } else if lower.ends_with(".flac") {
            AudioFileType::Flac
        } else {
            AudioFileType::None
        }
    }
}

/// An encoded file held in memory.
///
/// The blob is shared, so a playlist can hand the same file to a pipeline many times
/// without copying it.
#[derive(Clone, Debug)]
pub struct AudioFile {
    pub data: Arc<[u8]>,
    pub file_type: AudioFileType,
}

impl AudioFile {
    pub fn new(data: impl Into<Arc<[u8]>>, file_type: AudioFileType) -> Self {
        Self {
            data: data.into(),
            file_type,
        }
    }

    /// Wrap a blob embedded in the binary, e.g. with `include_bytes!`.
    pub fn from_static(data: &'static [u8], file_type: AudioFileType) -> Self {
        Self::new(data, file_type)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One entry of a playlist: either a remote URL or an in-memory file.
#[derive(Clone, Debug)]
pub enum PlaylistItem {
    Url(String),
    File(AudioFile),
}

/// Scale signed 16-bit samples in place by a Q15 factor.
pub fn scale_audio_samples(samples: &mut [i16], scale_factor: i16) {
    for s in samples.iter_mut() {
        *s = ((*s as i32 * scale_factor as i32) >> 15) as i16;
    }
}

/// Scale little-endian 16-bit PCM bytes in place by a Q15 factor.
///
/// A trailing odd byte is left untouched.
pub fn scale_audio_bytes(bytes: &mut [u8], scale_factor: i16) {
    for chunk in bytes.chunks_exact_mut(2) {
        let s = i16::from_le_bytes([chunk[0], chunk[1]]);
        let scaled = ((s as i32 * scale_factor as i32) >> 15) as i16;
        chunk.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Read one little-endian sample of `bytes.len()` (1..=4) bytes into the top bits of an `i32`.
///
/// 8-bit samples are treated as unsigned, like WAV.
pub fn unpack_q31(bytes: &[u8]) -> i32 {
    match bytes.len() {
        1 => ((bytes[0] as i32) - 128) << 24,
        2 => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
        3 => i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]),
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => 0,
    }
}

/// Write the top `out.len()` (1..=4) bytes of a Q31 sample as little-endian.
pub fn pack_q31(sample: i32, out: &mut [u8]) {
    let le = sample.to_le_bytes();
    match out.len() {
        1 => out[0] = ((sample >> 24) + 128) as u8,
        2 => out.copy_from_slice(&le[2..4]),
        3 => out.copy_from_slice(&le[1..4]),
        4 => out.copy_from_slice(&le),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_bytes_round_trip() {
        for &(bits, ch, rate) in &[(8u8, 1u8, 8_000u32), (16, 2, 44_100), (24, 2, 48_000), (32, 1, 22_050)] {
            let f = StreamFormat::new(bits, ch, rate);
            for n in [0u32, 1, 7, 441, 48_000, 123_457] {
                assert_eq!(f.bytes_to_frames(f.frames_to_bytes(n)), n);
            }
        }
    }

    #[test]
    fn derived_sizes() {
        let f = StreamFormat::new(24, 2, 48_000);
        assert_eq!(f.bytes_per_sample(), 3);
        assert_eq!(f.frame_size(), 6);
        assert_eq!(f.ms_to_bytes(10), 2_880);
        assert_eq!(f.ms_to_frames(10), 480);
        assert_eq!(f.ms_to_samples(10), 960);
        assert_eq!(f.bytes_to_ms(288_000), 1000);
    }

    #[test]
    fn default_format_is_16k_mono() {
        assert_eq!(StreamFormat::default(), StreamFormat::new(16, 1, 16_000));
    }

    #[test]
    fn microseconds_round_to_nearest() {
        let f = StreamFormat::new(16, 2, 44_100);
        // 1 frame = 22.675..us
        assert_eq!(f.frames_to_microseconds(1), 23);
        assert_eq!(f.frames_to_microseconds(44_100), 1_000_000);
    }

    #[test]
    fn milliseconds_with_remainder_keeps_leftover() {
        let f = StreamFormat::new(16, 2, 44_100);
        // gcd(1000, 44100) = 100, so whole ms come in units of 441 frames = 10 ms
        let mut frames = 1000;
        let ms = f.frames_to_milliseconds_with_remainder(&mut frames);
        assert_eq!(ms, 20);
        assert_eq!(frames, 1000 - 882);
    }

    #[test]
    fn remainder_accumulation_does_not_drift() {
        let f = StreamFormat::new(16, 2, 44_100);
        let mut remainder = 0u32;
        let mut total_ms = 0u64;
        let mut total_frames = 0u64;
        for step in 0..10_000u32 {
            let new_frames = 37 + (step % 113);
            total_frames += new_frames as u64;
            remainder += new_frames;
            total_ms += f.frames_to_milliseconds_with_remainder(&mut remainder) as u64;
            assert!(remainder < 441);
        }
        let exact_ms = total_frames * 1000 / 44_100;
        // Never more than one gcd unit (10 ms at 44.1 kHz) behind the exact total.
        assert!(exact_ms - total_ms <= 10);
        assert_eq!(total_ms + (remainder as u64 * 1000 / 44_100), exact_ms);
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(StreamFormat::new(16, 2, 48_000), StreamFormat::new(16, 2, 48_000));
        assert_ne!(StreamFormat::new(16, 2, 48_000), StreamFormat::new(16, 1, 48_000));
    }

    #[test]
    fn file_type_names_and_extensions() {
        assert_eq!(AudioFileType::Flac.to_string(), "FLAC");
        assert_eq!(AudioFileType::None.to_string(), "unknown");
        assert_eq!(AudioFileType::from_extension("http://h/a/B.MP3"), AudioFileType::Mp3);
        assert_eq!(AudioFileType::from_extension("x.wav?token=1"), AudioFileType::Wav);
        assert_eq!(AudioFileType::from_extension("x.ogg"), AudioFileType::None);
    }

    #[test]
    fn q15_scaling() {
        let mut s = [32767i16, -32768, 1000];
        scale_audio_samples(&mut s, 16384);
        assert_eq!(s, [16383, -16384, 500]);

        let mut b = 1000i16.to_le_bytes().to_vec();
        scale_audio_bytes(&mut b, 16384);
        assert_eq!(i16::from_le_bytes([b[0], b[1]]), 500);
    }

    #[test]
    fn q31_pack_unpack() {
        let mut out = [0u8; 3];
        pack_q31(unpack_q31(&[0x56, 0x34, 0x12]), &mut out);
        assert_eq!(out, [0x56, 0x34, 0x12]);

        assert_eq!(unpack_q31(&(-2i16).to_le_bytes()), -2 << 16);
        let mut out = [0u8; 1];
        pack_q31(0, &mut out);
        assert_eq!(out, [128]);
    }
}
