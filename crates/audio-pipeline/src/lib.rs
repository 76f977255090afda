//! Streaming audio pipeline.
//!
//! Encoded audio flows from a [`reader`] through a [`decode`]r into any [`sink::AudioSink`]:
//! a [`mixer`] source, the [`resampler_sink`] adapter or the CPAL [`output`]. The
//! [`pipeline`] orchestrator runs the read and decode workers for one stream and the
//! [`player`] drives a media and an announcement pipeline with playlists.

pub mod config;
pub mod decode;
pub mod device;
pub mod error;
pub mod events;
pub mod format;
pub mod http_stream;
pub mod mixer;
pub mod output;
pub mod pipeline;
pub mod player;
pub mod reader;
pub mod resample;
pub mod resampler_sink;
pub mod ring_buffer;
pub mod sink;
pub mod transfer;
