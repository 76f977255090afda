/// Buffer sizing for a reader/decoder [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Size in bytes of the ring buffer between the read and decode workers.
    pub buffer_size: usize,
    /// Decoded audio to accumulate before playback starts, in milliseconds.
    pub initial_buffer_ms: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            initial_buffer_ms: 1000,
        }
    }
}

/// Settings for the [`Mixer`](crate::mixer::Mixer) and its sources.
#[derive(Clone, Debug)]
pub struct MixerConfig {
    /// Channel count of the mixed output.
    pub output_channels: u8,
    /// Forward one source at a time instead of summing them.
    pub queue_mode: bool,
    /// Per-source ring buffer duration in milliseconds.
    pub source_buffer_ms: u32,
    /// Stop a running source after this long without new data.
    pub source_timeout_ms: Option<u32>,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            output_channels: 2,
            queue_mode: false,
            source_buffer_ms: 500,
            source_timeout_ms: None,
        }
    }
}

/// Settings for the [`ResamplerSink`](crate::resampler_sink::ResamplerSink) adapter.
#[derive(Clone, Debug)]
pub struct ResamplerConfig {
    pub target_bits_per_sample: u8,
    pub target_sample_rate: u32,
    /// Ring buffer duration in front of the resampler, in milliseconds.
    pub buffer_duration_ms: u32,
    /// Sinc filter length.
    pub taps: usize,
    /// Number of interpolated sub-filters.
    pub filters: usize,
    /// Input frames per resampler call.
    pub chunk_frames: usize,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            target_bits_per_sample: 16,
            target_sample_rate: 48_000,
            buffer_duration_ms: 100,
            taps: 128,
            filters: 256,
            chunk_frames: 256,
        }
    }
}

/// Playlist and volume behaviour of the [`MediaPlayer`](crate::player::MediaPlayer).
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Silence inserted between playlist items, in milliseconds.
    pub playlist_delay_ms: u32,
    /// Step used by volume up/down commands.
    pub volume_increment: f32,
    pub initial_volume: f32,
    /// Attenuation applied to media while an announcement plays; `0` disables ducking.
    pub duck_db: u8,
    pub duck_duration_ms: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            playlist_delay_ms: 0,
            volume_increment: 0.05,
            initial_volume: 0.5,
            duck_db: 20,
            duck_duration_ms: 1000,
        }
    }
}

/// Settings for the [`CpalSink`](crate::output::CpalSink).
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Substring of the output device name; the host default when unset.
    pub device: Option<String>,
    /// Preferred device sample rate; the highest supported when unset.
    pub sample_rate: Option<u32>,
    /// Audio buffered in front of the device callback, in milliseconds.
    pub buffer_ms: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: Some(48_000),
            buffer_ms: 200,
        }
    }
}
