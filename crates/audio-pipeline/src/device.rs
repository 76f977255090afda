//! Output device selection for the CPAL sink.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// A device together with the stream configuration chosen for it.
pub struct DeviceChoice {
    pub device: cpal::Device,
    pub name: String,
    pub config: cpal::SupportedStreamConfig,
}

/// Open the first output device whose name contains `needle` (case-insensitive), or the
/// host default, and choose a configuration close to `target_rate`.
pub fn choose_output(host: &cpal::Host, needle: Option<&str>, target_rate: Option<u32>) -> Result<DeviceChoice> {
    let device = pick_device(host, needle)?;
    let name = device_name(&device);
    let config = pick_output_config(&device, target_rate)
        .with_context(|| format!("no usable output config on {name}"))?;
    Ok(DeviceChoice { device, name, config })
}

fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };
    host.output_devices()
        .context("No output devices")?
        .find(|d| matches_device_name(&device_name(d), needle))
        .ok_or_else(|| anyhow!("No output device matched: {needle}"))
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "unknown device".to_string())
}

/// Names of every output device on `host`, in host order.
pub fn output_device_names(host: &cpal::Host) -> Result<Vec<String>> {
    Ok(host
        .output_devices()
        .context("No output devices")?
        .map(|d| device_name(&d))
        .collect())
}

/// Ranking of one supported range at the rate we would use from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    /// Not above the target rate, so the device never needs more than we produce.
    at_or_below_target: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        if self.at_or_below_target != other.at_or_below_target {
            self.at_or_below_target
        } else if self.rate != other.rate {
            self.rate > other.rate
        } else {
            self.format_rank < other.format_rank
        }
    }
}

/// Choose the supported config best suited to `target_rate` (highest rate if unset).
fn pick_output_config(device: &cpal::Device, target_rate: Option<u32>) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in device.supported_output_configs()? {
        let rate = rate_in_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            at_or_below_target: target_rate.is_none_or(|t| rate <= t),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.beats(b)) {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }
    best.map(|(_, config)| config)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Fixed buffer size for the stream, capped so latency stays bounded.
///
/// `None` lets CPAL use the device default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 4_096;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn rate_in_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

/// Lower is better. Our PCM is 16-bit, so native `i16` output avoids a conversion.
fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_match_case_insensitively() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", " USB "));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn rate_is_clamped_into_range() {
        assert_eq!(rate_in_range(44_100, 96_000, Some(48_000)), 48_000);
        assert_eq!(rate_in_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(rate_in_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(rate_in_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn candidates_prefer_target_then_rate_then_format() {
        let base = Candidate {
            at_or_below_target: true,
            rate: 48_000,
            format_rank: 1,
        };
        let above = Candidate {
            at_or_below_target: false,
            rate: 96_000,
            format_rank: 0,
        };
        assert!(base.beats(&above));
        assert!(!above.beats(&base));

        let lower_rate = Candidate { rate: 44_100, ..base };
        assert!(base.beats(&lower_rate));

        let native = Candidate { format_rank: 0, ..base };
        assert!(native.beats(&base));
    }

    #[test]
    fn i16_is_preferred_over_float() {
        assert!(sample_format_rank(cpal::SampleFormat::I16) < sample_format_rank(cpal::SampleFormat::F32));
    }
}
