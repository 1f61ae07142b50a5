//! Command-line interface definitions.
//!
//! This module contains the `clap`-powered CLI surface area (args +
//! defaults). It intentionally has no audio logic.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use playout_engine::spatial::SpatialModel;

#[derive(Parser, Debug)]
#[command(name = "playout", about = "Block-scheduled multi-stream audio playout")]
pub struct Args {
    /// Output endpoint id or name substring; default endpoint when unset
    #[arg(long)]
    pub device: Option<String>,

    /// Look-ahead delay in ring blocks (higher => safer, more latency)
    #[arg(long, default_value_t = 5)]
    pub lookahead: usize,

    /// 3D processing tier
    #[arg(long, value_enum, default_value_t = ModelArg::None)]
    pub model: ModelArg,

    /// Distance rolloff factor for 3D attenuation
    #[arg(long, default_value_t = 1.0)]
    pub rolloff: f32,

    /// Distance below which no attenuation applies
    #[arg(long, default_value_t = 1.0)]
    pub min_distance: f32,

    /// Distance beyond which attenuation stops increasing
    #[arg(long, default_value_t = 100.0)]
    pub max_distance: f32,

    /// Force every stream to play centered
    #[arg(long)]
    pub center: bool,

    /// Decode buffer target in seconds (per stage)
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices (previously selected endpoint first)
    ListDevices,
    /// Play one or more audio files as independent streams
    Play {
        /// Audio files (FLAC/MP3/WAV/OGG/...)
        paths: Vec<PathBuf>,

        /// Spread the streams in a circle around the listener
        #[arg(long)]
        spread: bool,
    },
    /// Play a generated test tone
    Tone {
        /// Tone frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        freq: f32,

        /// Tone duration in seconds
        #[arg(long, default_value_t = 3.0)]
        seconds: f32,
    },
}

/// CLI-facing spelling of the engine's spatial tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    None,
    Panning,
    LightHrtf,
    FullHrtf,
}

impl From<ModelArg> for SpatialModel {
    fn from(value: ModelArg) -> Self {
        match value {
            ModelArg::None => SpatialModel::None,
            ModelArg::Panning => SpatialModel::Panning,
            ModelArg::LightHrtf => SpatialModel::LightHrtf,
            ModelArg::FullHrtf => SpatialModel::FullHrtf,
        }
    }
}
