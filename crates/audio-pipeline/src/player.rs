//! Media player with a media and an announcement pipeline.
//!
//! Commands arrive on a bounded queue and are applied from [`MediaPlayer::loop_once`],
//! which also polls both pipelines and advances their playlists. Announcements take
//! priority: while one plays the player reports [`PlayerState::Announcing`] and the media
//! source can be ducked.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::config::{PipelineConfig, PlayerConfig};
use crate::format::{AudioFile, PlaylistItem};
use crate::mixer::MixerSource;
use crate::pipeline::{Pipeline, PipelineState};
use crate::sink::AudioSink;

const MEDIA_COMMAND_QUEUE_LENGTH: usize = 20;
/// How long to wait for a stopped pipeline before giving up on unpausing it.
const UNPAUSE_WINDOW: Duration = Duration::from_millis(150);

/// Commands accepted by the [`MediaPlayer`].
#[derive(Clone, Debug)]
pub enum MediaCommand {
    PlayUrl { url: String, announce: bool, enqueue: bool },
    PlayFile { file: AudioFile, announce: bool, enqueue: bool },
    Play,
    Pause,
    Stop { announce: bool },
    Toggle,
    VolumeUp,
    VolumeDown,
    SetVolume(f32),
    Mute,
    Unmute,
    RepeatOne { announce: bool },
    RepeatOff { announce: bool },
    /// Drop every queued item after the one currently playing.
    ClearPlaylist { announce: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
    Announcing,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlayerState::Idle => "idle",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Announcing => "announcing",
        };
        f.write_str(s)
    }
}

/// Cloneable sender for [`MediaCommand`]s.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: Sender<MediaCommand>,
}

impl PlayerHandle {
    /// Queue a command. Volume changes are dropped when the queue is full; everything
    /// else waits for room.
    ///
    /// Returns `false` if the command was dropped or the player is gone.
    pub fn send(&self, command: MediaCommand) -> bool {
        match command {
            MediaCommand::VolumeUp | MediaCommand::VolumeDown | MediaCommand::SetVolume(_) => {
                match self.tx.try_send(command) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!("command queue full; dropping volume change");
                        false
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                }
            }
            _ => self.tx.send(command).is_ok(),
        }
    }
}

/// Per-pipeline bookkeeping: the pipeline, its playlist and its last polled state.
struct Lane {
    pipeline: Pipeline,
    playlist: VecDeque<PlaylistItem>,
    state: PipelineState,
    repeat_one: bool,
    /// End of the silence between playlist items.
    resume_at: Option<Instant>,
    /// Unpause once the pipeline reports stopped, until this deadline.
    unpause_until: Option<Instant>,
}

impl Lane {
    fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            playlist: VecDeque::new(),
            state: PipelineState::Stopped,
            repeat_one: false,
            resume_at: None,
            unpause_until: None,
        }
    }

    fn start(&mut self, item: &PlaylistItem) {
        match item {
            PlaylistItem::Url(url) => self.pipeline.start_url(url),
            PlaylistItem::File(file) => self.pipeline.start_file(file.clone()),
        }
    }

    /// Forget queued items and stop; the pipeline is unpaused once it has stopped.
    fn stop(&mut self) {
        self.resume_at = None;
        self.playlist.clear();
        self.pipeline.stop();
        self.unpause_until = Some(Instant::now() + UNPAUSE_WINDOW);
    }

    /// Advance the playlist after the pipeline stopped. Returns `true` if an item was started.
    fn advance(&mut self, previous: PipelineState, delay: Duration) -> bool {
        let mut delay_next = false;
        if previous == PipelineState::Playing {
            if !self.repeat_one {
                self.playlist.pop_front();
            }
            delay_next = !delay.is_zero();
        }
        let Some(item) = self.playlist.front().cloned() else {
            return false;
        };
        self.start(&item);
        if delay_next {
            self.pipeline.set_pause_state(true);
            self.resume_at = Some(Instant::now() + delay);
        }
        true
    }
}

/// Two-pipeline media player.
pub struct MediaPlayer {
    media: Lane,
    announcement: Lane,
    media_sink: Arc<dyn AudioSink>,
    announcement_sink: Arc<dyn AudioSink>,
    ducking: Option<Arc<MixerSource>>,
    commands: Receiver<MediaCommand>,
    handle: PlayerHandle,
    config: PlayerConfig,
    state: PlayerState,
    is_paused: bool,
    volume: f32,
    muted: bool,
}

impl MediaPlayer {
    pub fn new(
        media_sink: Arc<dyn AudioSink>,
        announcement_sink: Arc<dyn AudioSink>,
        pipeline_config: &PipelineConfig,
        config: PlayerConfig,
    ) -> Self {
        let (tx, commands) = bounded(MEDIA_COMMAND_QUEUE_LENGTH);
        let media = Pipeline::new(media_sink.clone(), pipeline_config, "med");
        let announcement = Pipeline::new(announcement_sink.clone(), pipeline_config, "ann");
        let mut player = Self {
            media: Lane::new(media),
            announcement: Lane::new(announcement),
            media_sink,
            announcement_sink,
            ducking: None,
            commands,
            handle: PlayerHandle { tx },
            state: PlayerState::Idle,
            is_paused: false,
            volume: config.initial_volume,
            muted: false,
            config,
        };
        player.set_volume(player.volume);
        tracing::info!(volume = player.volume, "media player ready");
        player
    }

    /// Duck `source` while announcements play. It should be the media sink.
    pub fn with_ducking(mut self, source: Arc<MixerSource>) -> Self {
        self.ducking = Some(source);
        self
    }

    pub fn handle(&self) -> PlayerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Milliseconds of the current media item handed to its sink.
    pub fn media_position_ms(&self) -> u32 {
        self.media.pipeline.playback_ms()
    }

    /// Apply at most one queued command, poll both pipelines and derive the player state.
    pub fn loop_once(&mut self) -> PlayerState {
        if let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        self.run_timers();

        let old_state = self.state;
        let delay = Duration::from_millis(self.config.playlist_delay_ms as u64);

        let old_media = self.media.state;
        self.media.state = self.media.pipeline.process_state();
        log_pipeline_error("media", self.media.state);

        let old_announcement = self.announcement.state;
        self.announcement.state = self.announcement.pipeline.process_state();
        log_pipeline_error("announcement", self.announcement.state);

        if self.announcement.state != PipelineState::Stopped {
            self.state = PlayerState::Announcing;
        } else if !self.announcement.playlist.is_empty() {
            // Announcements do not follow the player's pause state.
            self.announcement.advance(old_announcement, delay);
        } else if self.is_paused {
            self.state = PlayerState::Paused;
        } else if self.media.state == PipelineState::Playing {
            self.state = PlayerState::Playing;
        } else if self.media.state == PipelineState::Stopped
            && !self.media.advance(old_media, delay)
        {
            self.state = PlayerState::Idle;
        }

        if self.state != old_state {
            tracing::debug!(from = %old_state, to = %self.state, "player state changed");
            self.update_ducking(old_state);
        }
        self.state
    }

    /// Stop both pipelines and join their workers.
    pub fn shutdown(&mut self) {
        self.media.playlist.clear();
        self.announcement.playlist.clear();
        self.media.pipeline.shutdown();
        self.announcement.pipeline.shutdown();
        self.state = PlayerState::Idle;
    }

    fn apply(&mut self, command: MediaCommand) {
        tracing::debug!(?command, "media command");
        match command {
            MediaCommand::PlayUrl { url, announce, enqueue } => {
                self.play_item(PlaylistItem::Url(url), announce, enqueue)
            }
            MediaCommand::PlayFile { file, announce, enqueue } => {
                self.play_item(PlaylistItem::File(file), announce, enqueue)
            }
            MediaCommand::Play => {
                if self.is_paused {
                    self.media.pipeline.set_pause_state(false);
                }
                self.is_paused = false;
            }
            MediaCommand::Pause => {
                if !self.is_paused {
                    self.media.pipeline.set_pause_state(true);
                }
                self.is_paused = true;
            }
            MediaCommand::Toggle => {
                self.is_paused = !self.is_paused;
                self.media.pipeline.set_pause_state(self.is_paused);
            }
            // Pipelines take a few polls to stop, so unpausing waits for that; otherwise a
            // paused item would play briefly before going away.
            MediaCommand::Stop { announce } => self.lane(announce).stop(),
            MediaCommand::VolumeUp => self.set_volume((self.volume + self.config.volume_increment).min(1.0)),
            MediaCommand::VolumeDown => self.set_volume((self.volume - self.config.volume_increment).max(0.0)),
            MediaCommand::SetVolume(volume) => self.set_volume(volume),
            MediaCommand::Mute => self.set_mute_state(true),
            MediaCommand::Unmute => self.set_mute_state(false),
            MediaCommand::RepeatOne { announce } => self.lane(announce).repeat_one = true,
            MediaCommand::RepeatOff { announce } => self.lane(announce).repeat_one = false,
            MediaCommand::ClearPlaylist { announce } => self.lane(announce).playlist.truncate(1),
        }
    }

    fn lane(&mut self, announce: bool) -> &mut Lane {
        if announce {
            &mut self.announcement
        } else {
            &mut self.media
        }
    }

    fn play_item(&mut self, item: PlaylistItem, announce: bool, enqueue: bool) {
        if announce {
            if !enqueue {
                // The next queued item must not start before this one.
                self.announcement.resume_at = None;
                self.announcement.playlist.clear();
                self.announcement.start(&item);
                self.announcement.pipeline.set_pause_state(false);
            }
            self.announcement.playlist.push_back(item);
            return;
        }

        if !enqueue {
            self.media.resume_at = None;
            self.media.playlist.clear();
            if self.is_paused {
                // Stop first; the item starts from the playlist once the player is unpaused.
                self.media.pipeline.stop();
                self.media.unpause_until = Some(Instant::now() + UNPAUSE_WINDOW);
            } else {
                self.media.start(&item);
                self.media.pipeline.set_pause_state(false);
            }
        }
        self.media.playlist.push_back(item);
    }

    fn run_timers(&mut self) {
        let now = Instant::now();

        if self.announcement.resume_at.is_some_and(|t| now >= t) {
            self.announcement.resume_at = None;
            self.announcement.pipeline.set_pause_state(false);
        }
        if self.media.resume_at.is_some_and(|t| now >= t) {
            self.media.resume_at = None;
            self.media.pipeline.set_pause_state(self.is_paused);
        }

        if let Some(deadline) = self.announcement.unpause_until {
            if self.announcement.state == PipelineState::Stopped {
                self.announcement.pipeline.set_pause_state(false);
                self.announcement.unpause_until = None;
            } else if now > deadline {
                self.announcement.unpause_until = None;
            }
        }
        if let Some(deadline) = self.media.unpause_until {
            if self.media.state == PipelineState::Stopped {
                self.media.pipeline.set_pause_state(false);
                self.is_paused = false;
                self.media.unpause_until = None;
            } else if now > deadline {
                tracing::warn!("media pipeline did not stop in time; staying paused");
                self.media.unpause_until = None;
            }
        }
    }

    fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.media_sink.set_volume(volume);
        self.announcement_sink.set_volume(volume);
        self.volume = volume;
        // Effectively silent volume reads as muted.
        self.set_mute_state(volume < 0.001);
        tracing::debug!(volume, "volume changed");
    }

    fn set_mute_state(&mut self, muted: bool) {
        self.media_sink.set_mute_state(muted);
        self.announcement_sink.set_mute_state(muted);
        if self.muted != muted {
            tracing::info!(muted, "mute changed");
        }
        self.muted = muted;
    }

    fn update_ducking(&self, old_state: PlayerState) {
        let Some(source) = &self.ducking else {
            return;
        };
        if self.config.duck_db == 0 {
            return;
        }
        if self.state == PlayerState::Announcing {
            source.apply_ducking(self.config.duck_db, self.config.duck_duration_ms);
        } else if old_state == PlayerState::Announcing {
            source.apply_ducking(0, self.config.duck_duration_ms);
        }
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_pipeline_error(name: &str, state: PipelineState) {
    match state {
        PipelineState::ErrorReading => {
            tracing::error!(pipeline = name, "file reader encountered an error")
        }
        PipelineState::ErrorDecoding => {
            tracing::error!(pipeline = name, "audio decoder encountered an error")
        }
        _ => {}
    }
}
