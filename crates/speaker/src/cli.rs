use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "speaker", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Preferred output sample rate in Hz; everything is resampled to the device rate
    #[arg(long, default_value_t = 48_000)]
    pub sample_rate: u32,

    /// Encoded-audio buffer between the reader and decoder, per pipeline (KiB)
    #[arg(long, default_value_t = 1024)]
    pub buffer_kib: usize,

    /// Decoded audio to accumulate before an item starts playing (ms)
    #[arg(long, default_value_t = 1000)]
    pub initial_buffer_ms: u32,

    /// Audio buffered in front of the device callback (ms)
    #[arg(long, default_value_t = 200)]
    pub output_buffer_ms: u32,

    /// Play one mixer source at a time instead of blending them
    #[arg(long)]
    pub queue_mode: bool,

    /// Initial volume between 0.0 and 1.0
    #[arg(long, default_value_t = 0.5)]
    pub volume: f32,

    /// Silence between playlist items (ms)
    #[arg(long, default_value_t = 0)]
    pub playlist_delay_ms: u32,

    /// Attenuation of media while an announcement plays (dB, 0 disables)
    #[arg(long, default_value_t = 20)]
    pub duck_db: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play files or URLs in order
    Play {
        /// Paths or http(s) URLs (WAV, MP3 or FLAC)
        #[arg(required = true)]
        items: Vec<String>,

        /// Announcement to play over the media, ducking it
        #[arg(long)]
        announce: Vec<String>,

        /// Repeat the current media item until interrupted
        #[arg(long)]
        repeat: bool,
    },
}
