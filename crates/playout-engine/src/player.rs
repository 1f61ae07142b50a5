//! Per-stream fill scheduler.
//!
//! A stream player binds one frame source to one ring buffer inside the
//! output device. Its fill routine tops the buffer up to the look-ahead
//! target, recomputing the playback boundary after every block because the
//! hardware keeps consuming while we write.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender};

use crate::backend::{Apply, OutputDevice, VoiceMode};
use crate::config::EngineTunables;
use crate::ring::BlockGeometry;
use crate::source::{FRAME_BYTES, FRAME_SAMPLES, FrameSource};
use crate::spatial::voice_is_centered;
use crate::status::EngineStats;

/// Per-dispatch inputs resolved by the engine loop.
pub(crate) struct FillContext {
    /// Device has 3D voices and a listener was created.
    pub(crate) spatial_active: bool,
    /// Upstream positional tracking is currently usable.
    pub(crate) tracking_valid: bool,
    /// Global force-centered override.
    pub(crate) center_override: bool,
}

/// Result of one fill cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FillOutcome {
    /// Stream is healthy (including the backward-playback resync case).
    Continue,
    /// Grace window ran out; the caller must remove this player.
    Exhausted,
}

pub(crate) struct StreamPlayer {
    name: String,
    source: Box<dyn FrameSource>,
    geometry: BlockGeometry,
    lookahead: usize,
    desync_window: usize,
    miss_grace: u32,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
    buffer: Option<Box<dyn crate::backend::StreamBuffer>>,
    last_written_block: usize,
    missing_frames: u32,
    playing: bool,
    /// Last decoded frame; replayed while the source stalls.
    frame: [i16; FRAME_SAMPLES],
    stats: Arc<EngineStats>,
}

impl StreamPlayer {
    pub(crate) fn new(
        source: Box<dyn FrameSource>,
        lookahead: usize,
        tunables: &EngineTunables,
        notify_tx: Sender<()>,
        notify_rx: Receiver<()>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let name = source.name().to_string();
        Self {
            name,
            source,
            geometry: BlockGeometry::new(tunables.block_count, FRAME_BYTES),
            lookahead,
            desync_window: tunables.desync_window,
            miss_grace: tunables.miss_grace,
            notify_tx,
            notify_rx,
            buffer: None,
            last_written_block: 0,
            missing_frames: 0,
            playing: false,
            frame: [0; FRAME_SAMPLES],
            stats,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Fill eligible blocks up to the look-ahead boundary.
    ///
    /// Lazily allocates and zero-fills the ring buffer on the first call,
    /// and starts looping playback once the cycle completes. Hardware-call
    /// failures on an established buffer propagate as errors; the engine
    /// treats them as unrecoverable.
    pub(crate) fn fill_ready(
        &mut self,
        device: &mut dyn OutputDevice,
        ctx: &FillContext,
    ) -> Result<FillOutcome> {
        self.stats.fills.fetch_add(1, Ordering::Relaxed);

        let mut apply = Apply::Deferred;
        if self.buffer.is_none() {
            let mut buffer = device
                .create_stream_buffer(self.geometry, ctx.spatial_active, self.notify_tx.clone())
                .with_context(|| format!("create stream buffer for {}", self.name))?;
            buffer.clear()?;
            self.last_written_block = self.geometry.initial_write_block(self.lookahead);
            tracing::info!(
                stream = %self.name,
                rate_hz = device.sample_rate(),
                bytes = self.geometry.buffer_bytes(),
                "new output buffer"
            );
            self.buffer = Some(buffer);
            // A fresh buffer applies 3D changes immediately so the first
            // audible block is not spatialized at a stale default position.
            apply = Apply::Immediate;
        }
        let Some(buffer) = self.buffer.as_mut() else {
            bail!("stream buffer missing after allocation");
        };

        let mut play_block = self
            .geometry
            .block_for_offset(buffer.positions()?.write_cursor);
        let mut no_write = self.geometry.no_write_block(play_block, self.lookahead);

        let mut block = self.geometry.next(self.last_written_block);
        while block != no_write {
            // Even high-end hardware can move the play cursor backwards in
            // 3D mode. When the no-write boundary shows up just behind the
            // write cursor, declare us in sync again instead of rewriting
            // the whole ring.
            if self
                .geometry
                .is_desynced(no_write, self.last_written_block, self.desync_window)
            {
                tracing::warn!(stream = %self.name, "play cursor moved backwards; resynchronizing");
                self.last_written_block = self.geometry.resync_target(no_write);
                self.stats.desync_resyncs.fetch_add(1, Ordering::Relaxed);
                break;
            }

            self.last_written_block = block;

            let produced = self.source.next_frame(&mut self.frame);
            if produced {
                self.missing_frames = 0;
            } else {
                self.missing_frames += 1;
                self.stats.frame_misses.fetch_add(1, Ordering::Relaxed);
                // Grace window before tearing the buffer down; constantly
                // creating and destroying buffers taxes cheap hardware more
                // than replaying one stale frame does.
                if self.missing_frames > self.miss_grace {
                    buffer.stop()?;
                    self.playing = false;
                    tracing::info!(
                        stream = %self.name,
                        misses = self.missing_frames,
                        "source exhausted; stopping stream"
                    );
                    return Ok(FillOutcome::Exhausted);
                }
            }

            if ctx.spatial_active {
                let position = self.source.position();
                if voice_is_centered(position, ctx.tracking_valid, ctx.center_override) {
                    if buffer.voice_mode() != VoiceMode::Disabled {
                        buffer.set_voice_mode(VoiceMode::Disabled, apply)?;
                    }
                } else {
                    if buffer.voice_mode() != VoiceMode::Normal {
                        buffer.set_voice_mode(VoiceMode::Normal, apply)?;
                    }
                    buffer.set_voice_position(position, apply)?;
                }
            }

            buffer.write_at(
                self.geometry.block_offset(block),
                &encode_frame(&self.frame),
            )?;
            self.stats.blocks_written.fetch_add(1, Ordering::Relaxed);

            // A notification that fired while we were writing is already
            // being handled by this very cycle.
            while self.notify_rx.try_recv().is_ok() {}

            // Playback kept advancing during the write; recompute the
            // boundary rather than trusting the snapshot from cycle start.
            play_block = self
                .geometry
                .block_for_offset(buffer.positions()?.write_cursor);
            no_write = self.geometry.no_write_block(play_block, self.lookahead);

            if !produced {
                break;
            }
            block = self.geometry.next(block);
        }

        if !self.playing {
            buffer.play_looping()?;
            self.playing = true;
        }
        Ok(FillOutcome::Continue)
    }
}

/// Serialize one frame as 16-bit little-endian PCM.
fn encode_frame(frame: &[i16; FRAME_SAMPLES]) -> [u8; FRAME_BYTES] {
    let mut out = [0u8; FRAME_BYTES];
    for (i, sample) in frame.iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
    }
    out
}
