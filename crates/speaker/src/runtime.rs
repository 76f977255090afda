//! Speaker runtime: device listing and the playback loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};

use audio_pipeline::config::ResamplerConfig;
use audio_pipeline::device;
use audio_pipeline::format::{AudioFile, AudioFileType, PlaylistItem};
use audio_pipeline::mixer::Mixer;
use audio_pipeline::output::CpalSink;
use audio_pipeline::player::{MediaCommand, MediaPlayer, PlayerState};
use audio_pipeline::resampler_sink::ResamplerSink;
use audio_pipeline::sink::AudioSink;

use crate::config::SpeakerPlayConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Upper bound on waiting for the output to play out after the player went idle.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for name in device::output_device_names(&host)? {
        println!("{name}");
    }
    Ok(())
}

/// Play every configured item, then exit. Ctrl-C stops playback early.
pub fn run_play(config: SpeakerPlayConfig) -> Result<()> {
    let stop_requested = Arc::new(AtomicBool::new(false));
    {
        let stop_requested = stop_requested.clone();
        ctrlc::set_handler(move || {
            if stop_requested.swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let output = CpalSink::open(&config.output)?;
    let resampler = ResamplerSink::new(
        output.clone(),
        ResamplerConfig {
            target_sample_rate: output.sample_rate(),
            ..ResamplerConfig::default()
        },
    );
    let mixer = Mixer::new(resampler.clone(), config.mixer.clone(), 2);
    let media = mixer.source(0).ok_or_else(|| anyhow!("mixer has no media source"))?;
    let announcement = mixer.source(1).ok_or_else(|| anyhow!("mixer has no announcement source"))?;
    tracing::info!(
        device = %output.device_name(),
        rate_hz = output.sample_rate(),
        queue_mode = config.mixer.queue_mode,
        "output ready"
    );

    let mut player = MediaPlayer::new(media.clone(), announcement, &config.pipeline, config.player.clone())
        .with_ducking(media);
    let handle = player.handle();

    let mut commands = Vec::new();
    if config.repeat {
        commands.push(MediaCommand::RepeatOne { announce: false });
    }
    for (i, spec) in config.items.iter().enumerate() {
        commands.push(play_command(load_item(spec)?, false, i > 0));
    }
    for (i, spec) in config.announcements.iter().enumerate() {
        commands.push(play_command(load_item(spec)?, true, i > 0));
    }

    let mut started = false;
    for command in commands {
        handle.send(command);
        started |= player.loop_once() != PlayerState::Idle;
    }

    let mut stop_sent = false;
    loop {
        mixer.process_state();
        resampler.process_state();
        let state = player.loop_once();
        started |= state != PlayerState::Idle;

        if stop_requested.load(Ordering::Relaxed) && !stop_sent {
            tracing::info!("stopping");
            handle.send(MediaCommand::Stop { announce: true });
            handle.send(MediaCommand::Stop { announce: false });
            stop_sent = true;
        }
        if state == PlayerState::Idle && (started || stop_sent) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    player.shutdown();

    if stop_sent {
        output.stop();
        return Ok(());
    }

    // Let the mixer, resampler and device play out what is still buffered.
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while (mixer.is_running() || !output.is_stopped()) && Instant::now() < deadline {
        mixer.process_state();
        resampler.process_state();
        std::thread::sleep(POLL_INTERVAL);
    }
    tracing::info!("playback finished");
    Ok(())
}

fn play_command(item: PlaylistItem, announce: bool, enqueue: bool) -> MediaCommand {
    match item {
        PlaylistItem::Url(url) => MediaCommand::PlayUrl { url, announce, enqueue },
        PlaylistItem::File(file) => MediaCommand::PlayFile { file, announce, enqueue },
    }
}

fn is_url(spec: &str) -> bool {
    let lower = spec.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// URLs are streamed; local files are read into memory up front.
fn load_item(spec: &str) -> Result<PlaylistItem> {
    if is_url(spec) {
        return Ok(PlaylistItem::Url(spec.to_string()));
    }
    let file_type = AudioFileType::from_extension(spec);
    if file_type == AudioFileType::None {
        bail!("unsupported file type: {spec}");
    }
    let data = std::fs::read(spec).with_context(|| format!("read {spec}"))?;
    tracing::debug!(path = %spec, bytes = data.len(), %file_type, "loaded file");
    Ok(PlaylistItem::File(AudioFile::new(data, file_type)))
}
