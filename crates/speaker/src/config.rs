use audio_pipeline::config::{MixerConfig, OutputConfig, PipelineConfig, PlayerConfig};

use crate::cli::Args;

/// Everything `speaker play` needs, resolved from the command line.
#[derive(Clone, Debug)]
pub struct SpeakerPlayConfig {
    pub items: Vec<String>,
    pub announcements: Vec<String>,
    pub repeat: bool,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
    pub mixer: MixerConfig,
    pub player: PlayerConfig,
}

impl SpeakerPlayConfig {
    pub fn from_args(args: &Args, items: Vec<String>, announcements: Vec<String>, repeat: bool) -> Self {
        Self {
            items,
            announcements,
            repeat,
            output: OutputConfig {
                device: normalize_device_name(args.device.clone()),
                sample_rate: Some(args.sample_rate),
                buffer_ms: args.output_buffer_ms,
            },
            pipeline: PipelineConfig {
                buffer_size: args.buffer_kib.max(4) * 1024,
                initial_buffer_ms: args.initial_buffer_ms,
            },
            mixer: MixerConfig {
                queue_mode: args.queue_mode,
                ..MixerConfig::default()
            },
            player: PlayerConfig {
                playlist_delay_ms: args.playlist_delay_ms,
                initial_volume: args.volume.clamp(0.0, 1.0),
                duck_db: args.duck_db,
                ..PlayerConfig::default()
            },
        }
    }
}

pub fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn normalize_device_name_trims_and_drops_empty() {
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(normalize_device_name(Some("".to_string())), None);
        assert_eq!(normalize_device_name(Some("  ".to_string())), None);
        assert_eq!(
            normalize_device_name(Some("  USB DAC ".to_string())),
            Some("USB DAC".to_string())
        );
    }

    #[test]
    fn args_map_onto_stage_configs() {
        let args = Args::parse_from([
            "speaker",
            "--buffer-kib",
            "256",
            "--volume",
            "1.5",
            "--queue-mode",
            "play",
            "a.flac",
        ]);
        let config = SpeakerPlayConfig::from_args(&args, vec!["a.flac".into()], Vec::new(), false);
        assert_eq!(config.pipeline.buffer_size, 256 * 1024);
        assert_eq!(config.player.initial_volume, 1.0);
        assert!(config.mixer.queue_mode);
        assert_eq!(config.output.sample_rate, Some(48_000));
        assert_eq!(config.output.device, None);
    }
}
