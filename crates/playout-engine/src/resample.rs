//! Streaming resample stage.
//!
//! Uses Rubato to convert decoded interleaved `f32` audio from the source
//! rate to the engine rate. Runs in a background thread and writes into a
//! bounded [`SampleQueue`] consumed by the frame adapter.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::queue::{SampleQueue, calc_max_buffered_samples};

/// Configuration for the streaming resampler stage.
#[derive(Clone, Copy, Debug)]
pub struct ResampleConfig {
    /// Input chunk size in frames for the steady-state loop.
    pub chunk_frames: usize,
    /// Target buffering (seconds) for the output queue.
    pub buffer_seconds: f32,
}

/// Start a background resampler thread.
///
/// Reads interleaved `f32` samples from `srcq` (at `src_rate`) and produces
/// interleaved `f32` at `dst_rate` into a new queue. When `srcq` closes and
/// its buffered input drains, the output queue is closed too.
pub fn start_resampler(
    srcq: Arc<SampleQueue>,
    src_rate: u32,
    channels: usize,
    dst_rate: u32,
    cfg: ResampleConfig,
) -> Result<Arc<SampleQueue>> {
    let max_buffered_samples = calc_max_buffered_samples(dst_rate, channels, cfg.buffer_seconds);
    let dstq = Arc::new(SampleQueue::new(channels, max_buffered_samples));

    let f_ratio = dst_rate as f64 / src_rate as f64;

    let sinc_len = 128;
    let oversampling_factor = 256;
    let interpolation = SincInterpolationType::Cubic;
    let window = WindowFunction::BlackmanHarris2;
    let f_cutoff = calculate_cutoff(sinc_len, window);

    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff,
        interpolation,
        oversampling_factor,
        window,
    };

    let chunk_in_frames = cfg.chunk_frames.max(1);

    let dstq_thread = dstq.clone();
    thread::spawn(move || {
        let mut resampler: Box<dyn Resampler<f32>> = match Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_in_frames,
            channels,
            FixedAsync::Input,
        ) {
            Ok(r) => Box::new(r),
            Err(e) => {
                tracing::error!("resampler init error: {e:#}");
                dstq_thread.close();
                return;
            }
        };

        let mut out_interleaved = vec![0.0f32; channels * chunk_in_frames * 3];

        let mut indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        // Steady state: full chunks.
        while let Some(interleaved) = srcq.pop_exact_blocking(chunk_in_frames) {
            let input_adapter = match InterleavedSlice::new(&interleaved, channels, chunk_in_frames)
            {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("interleaved slice (input) error: {e:#}");
                    break;
                }
            };

            let out_capacity_frames = out_interleaved.len() / channels;
            let mut output_adapter =
                match InterleavedSlice::new_mut(&mut out_interleaved, channels, out_capacity_frames)
                {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::error!("interleaved slice (output) error: {e:#}");
                        break;
                    }
                };

            indexing.input_offset = 0;
            indexing.output_offset = 0;
            indexing.partial_len = None;

            let (_nbr_in, nbr_out) = match resampler.process_into_buffer(
                &input_adapter,
                &mut output_adapter,
                Some(&indexing),
            ) {
                Ok(x) => x,
                Err(e) => {
                    tracing::error!("resampler process error: {e:#}");
                    break;
                }
            };

            dstq_thread.push_blocking(&out_interleaved[..nbr_out * channels]);
        }

        // Drain whatever partial tail is left after the source closed.
        while let Some(tail) = srcq.pop_up_to_blocking(chunk_in_frames) {
            let tail_frames = tail.len() / channels;
            if tail_frames == 0 {
                continue;
            }

            let input_adapter = match InterleavedSlice::new(&tail, channels, tail_frames) {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("interleaved slice (tail input) error: {e:#}");
                    break;
                }
            };

            let out_capacity_frames = out_interleaved.len() / channels;
            let mut output_adapter =
                match InterleavedSlice::new_mut(&mut out_interleaved, channels, out_capacity_frames)
                {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::error!("interleaved slice (tail output) error: {e:#}");
                        break;
                    }
                };

            indexing.input_offset = 0;
            indexing.output_offset = 0;
            indexing.partial_len = Some(tail_frames);

            let (_nbr_in, nbr_out) = match resampler.process_into_buffer(
                &input_adapter,
                &mut output_adapter,
                Some(&indexing),
            ) {
                Ok(x) => x,
                Err(e) => {
                    tracing::error!("resampler tail process error: {e:#}");
                    break;
                }
            };

            if nbr_out > 0 {
                dstq_thread.push_blocking(&out_interleaved[..nbr_out * channels]);
            }
        }

        dstq_thread.close();
    });

    Ok(dstq)
}
