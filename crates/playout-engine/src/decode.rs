//! Streaming file decode feeding a frame source.
//!
//! Symphonia probes the container and decodes packets on a background
//! thread, pushing interleaved `f32` samples into a bounded [`SampleQueue`].
//! When the source rate differs from the engine rate, a resample stage is
//! inserted. [`FileSource`] adapts the final queue to the [`FrameSource`]
//! contract: it pops one fixed frame at a time, downmixes to mono, and
//! never blocks (the scheduler polls it from the fill path).

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use glam::Vec3;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::CodecParameters;
use symphonia::core::{
    codecs::DecoderOptions, formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions,
    probe::Hint,
};

use crate::queue::{SampleQueue, calc_max_buffered_samples};
use crate::resample::{ResampleConfig, start_resampler};
use crate::source::{FRAME_SAMPLES, FrameSource, SAMPLE_RATE};

/// Tuning for the decode/resample stages.
#[derive(Clone, Copy, Debug)]
pub struct DecodeConfig {
    /// Target buffering (seconds) per stage queue.
    pub buffer_seconds: f32,
    /// Resampler input chunk size in frames.
    pub chunk_frames: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 2.0,
            chunk_frames: 1024,
        }
    }
}

/// Open `path`, start its background decode pipeline, and return the frame
/// source adapter for it.
pub fn open_file(path: &Path, cfg: &DecodeConfig) -> Result<FileSource> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no default audio track"))?;
    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| anyhow!("unknown channel layout"))?
        .count();
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("unknown sample rate"))?;
    let codec_params: CodecParameters = track.codec_params.clone();
    let duration_ms = duration_ms_from_codec_params(&codec_params);

    let srcq = Arc::new(SampleQueue::new(
        channels,
        calc_max_buffered_samples(rate, channels, cfg.buffer_seconds),
    ));
    let srcq_thread = srcq.clone();
    thread::spawn(move || {
        if let Err(e) = decode_format_loop(format, codec_params, &srcq_thread) {
            tracing::error!("decoder thread error: {e:#}");
        }
        srcq_thread.close();
    });

    let queue = if rate == SAMPLE_RATE {
        tracing::debug!(rate_hz = rate, "resample skipped");
        srcq
    } else {
        tracing::info!(from_hz = rate, to_hz = SAMPLE_RATE, "resampling");
        start_resampler(
            srcq,
            rate,
            channels,
            SAMPLE_RATE,
            ResampleConfig {
                chunk_frames: cfg.chunk_frames,
                buffer_seconds: cfg.buffer_seconds,
            },
        )?
    };

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();

    Ok(FileSource {
        name,
        channels,
        queue,
        position: Vec3::ZERO,
        duration_ms,
    })
}

/// Decode packets from a probed `FormatReader` into `queue`.
fn decode_format_loop(
    mut format: Box<dyn symphonia::core::formats::FormatReader>,
    codec_params: CodecParameters,
    queue: &Arc<SampleQueue>,
) -> Result<()> {
    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(_) => break, // EOF
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        queue.push_blocking(sample_buf.samples());
    }

    Ok(())
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Frame source backed by a decoded (and possibly resampled) file stream.
pub struct FileSource {
    name: String,
    channels: usize,
    queue: Arc<SampleQueue>,
    position: Vec3,
    duration_ms: Option<u64>,
}

impl FileSource {
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Whether decode finished and every sample has been consumed.
    pub fn is_finished(&self) -> bool {
        self.queue.is_finished()
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self, out: &mut [i16; FRAME_SAMPLES]) -> bool {
        let Some(samples) = self.queue.try_pop_exact(FRAME_SAMPLES) else {
            return false;
        };

        let frames = samples.len() / self.channels;
        for (i, frame) in samples.chunks_exact(self.channels).enumerate() {
            let sum: f32 = frame.iter().sum();
            let v = (sum / self.channels as f32).clamp(-1.0, 1.0);
            out[i] = (v * i16::MAX as f32) as i16;
        }
        // A partial tail only shows up at end of stream; pad it out.
        for sample in out.iter_mut().skip(frames) {
            *sample = 0;
        }
        true
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn name(&self) -> &str {
        &self.name
    }
}
