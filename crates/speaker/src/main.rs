//! Speaker: play local files and HTTP streams through the audio pipeline.
//!
//! ## Stages
//! 1. **Read/decode**: a media and an announcement pipeline, each with a read and a decode
//!    worker joined by a ring buffer.
//! 2. **Mix**: both pipelines feed a two-source mixer; media is ducked under announcements.
//! 3. **Resample**: the mix is converted to the output device's rate.
//! 4. **Output**: the CPAL callback drains the final ring without blocking.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use speaker::cli::{Args, Command};
use speaker::config::SpeakerPlayConfig;
use speaker::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,speaker=info,audio_pipeline=info")),
        )
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    match &args.cmd {
        Some(Command::Play { items, announce, repeat }) => {
            let config = SpeakerPlayConfig::from_args(&args, items.clone(), announce.clone(), *repeat);
            runtime::run_play(config)
        }
        None => {
            tracing::warn!("nothing to do; try `speaker play <PATH|URL>...` or `--list-devices`");
            Ok(())
        }
    }
}
