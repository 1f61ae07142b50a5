//! CPAL-backed output device.
//!
//! Implements the ring-buffer/notification contract on top of a CPAL output
//! stream. Each stream buffer is a software voice: a mono 16-bit byte ring
//! with an atomic play cursor. The output callback mixes every playing voice
//! into the device stream (equal-power pan plus distance rolloff for voices
//! in 3D mode), advances the cursors, and fires a voice's notification
//! channel whenever its cursor crosses a block boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use glam::Vec3;

use crate::backend::{
    Apply, BufferPositions, DeviceDescriptor, DeviceOptions, EndpointId, ListenerHandle,
    OutputBackend, OutputDevice, StreamBuffer, VoiceMode,
};
use crate::ring::BlockGeometry;
use crate::spatial::{ListenerParams, SpatialModel};

/// Gain applied to both channels of a centered voice (-3 dB).
const CENTER_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// CPAL output backend. Stateless; the host is acquired per call.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let host = cpal::default_host();
        let mut out = Vec::new();
        for device in host.output_devices().context("no output devices")? {
            let name = device.description()?.to_string();
            let id = device
                .id()
                .map(|id| id.to_string())
                .unwrap_or_else(|_| name.clone());
            out.push(DeviceDescriptor {
                id: EndpointId(id),
                name,
            });
        }
        Ok(out)
    }

    fn open(
        &self,
        endpoint: Option<&EndpointId>,
        opts: &DeviceOptions,
    ) -> Result<Box<dyn OutputDevice>> {
        let host = cpal::default_host();
        let device = resolve_device(&host, endpoint)?;
        let name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let config = pick_output_config(&device, opts.sample_rate)?;
        let stream_config: cpal::StreamConfig = config.clone().into();
        if stream_config.sample_rate != opts.sample_rate {
            tracing::warn!(
                device = %name,
                device_rate_hz = stream_config.sample_rate,
                engine_rate_hz = opts.sample_rate,
                "device does not support the engine rate; playback speed will drift"
            );
        }

        let channels = stream_config.channels;
        let spatial = opts.spatial_model.is_enabled() && channels >= 2;
        if opts.spatial_model.is_enabled() && !spatial {
            tracing::warn!(device = %name, "mono output device; 3D positioning unavailable");
        }
        if matches!(
            opts.spatial_model,
            SpatialModel::LightHrtf | SpatialModel::FullHrtf
        ) {
            tracing::debug!("HRTF tier requested; rendering with the panning path");
        }

        let shared = Arc::new(MixerShared {
            voices: Mutex::new(Vec::new()),
            listener: Mutex::new(opts.listener),
            spatial,
        });

        let stream =
            build_mixer_stream(&device, &stream_config, config.sample_format(), &shared)?;
        stream.play().context("start output stream")?;

        tracing::info!(
            device = %name,
            rate_hz = stream_config.sample_rate,
            channels,
            spatial,
            "cpal output open"
        );

        Ok(Box::new(CpalDevice {
            _stream: stream,
            shared,
            sample_rate: stream_config.sample_rate,
            spatial,
            name,
        }))
    }
}

/// Resolve an endpoint by exact id or case-insensitive name substring, or
/// fall back to the host default when no endpoint is requested.
fn resolve_device(host: &cpal::Host, endpoint: Option<&EndpointId>) -> Result<cpal::Device> {
    let Some(endpoint) = endpoint else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"));
    };

    let needle = endpoint.0.to_lowercase();
    for device in host.output_devices().context("no output devices")? {
        if let Ok(id) = device.id() {
            if id.to_string() == endpoint.0 {
                return Ok(device);
            }
        }
        if let Ok(desc) = device.description() {
            if desc.name().to_lowercase().contains(&needle) {
                return Ok(device);
            }
        }
    }
    Err(anyhow!("no output device matched: {endpoint}"))
}

/// Choose the best supported output config for the engine rate.
///
/// Preference order: a range containing the exact rate, then stereo over
/// mono over anything else, then the friendlier sample formats.
fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query output configs")?
        .collect();
    if ranges.is_empty() {
        bail!("no supported output configs");
    }

    let mut best: Option<(bool, u8, u8, cpal::SupportedStreamConfig)> = None;

    for range in ranges {
        let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let exact = rate == target_rate;
        let ch_rank = channel_rank(range.channels());
        let fmt_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_exact, b_ch, b_fmt, _)) => {
                is_better_candidate(exact, ch_rank, fmt_rank, *b_exact, *b_ch, *b_fmt)
            }
        };
        if replace {
            best = Some((exact, ch_rank, fmt_rank, range.with_sample_rate(rate)));
        }
    }

    Ok(best.map(|(_, _, _, cfg)| cfg).unwrap())
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max)
}

fn channel_rank(channels: u16) -> u8 {
    match channels {
        2 => 0,
        1 => 1,
        _ => 2,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    exact: bool,
    ch_rank: u8,
    fmt_rank: u8,
    best_exact: bool,
    best_ch: u8,
    best_fmt: u8,
) -> bool {
    if exact != best_exact {
        exact
    } else if ch_rank != best_ch {
        ch_rank < best_ch
    } else {
        fmt_rank < best_fmt
    }
}

/// State shared between the device handle, buffer handles, and the output
/// callback.
struct MixerShared {
    voices: Mutex<Vec<Arc<VoiceShared>>>,
    /// Committed listener parameters; the callback reads one copy per pass.
    listener: Mutex<ListenerParams>,
    spatial: bool,
}

/// One software voice: the byte ring plus its transport and 3D state.
struct VoiceShared {
    block_bytes: usize,
    buffer_bytes: usize,
    data: Mutex<Vec<u8>>,
    /// Byte offset of the play cursor, always even, wraps at `buffer_bytes`.
    play_pos: AtomicUsize,
    playing: AtomicBool,
    /// Set when the owning buffer handle is dropped; the callback sweeps
    /// detached voices out of the mix.
    detached: AtomicBool,
    state: Mutex<VoiceState>,
    notify: Sender<()>,
}

#[derive(Clone, Copy)]
struct VoiceState {
    mode: VoiceMode,
    position: Vec3,
    pending_mode: Option<VoiceMode>,
    pending_position: Option<Vec3>,
}

fn build_mixer_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<MixerShared>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<MixerShared>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let shared_cb = shared.clone();
    // Stereo mix bus reused across callbacks.
    let mut mix: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels;
            mix.clear();
            mix.resize(frames * 2, 0.0);

            let params = *shared_cb.listener.lock().unwrap();
            let mut voices = shared_cb.voices.lock().unwrap();
            voices.retain(|v| !v.detached.load(Ordering::Relaxed));

            for voice in voices.iter() {
                if !voice.playing.load(Ordering::Relaxed) {
                    continue;
                }
                let state = *voice.state.lock().unwrap();
                let (gl, gr) = if shared_cb.spatial && state.mode == VoiceMode::Normal {
                    spatial_gains(state.position, &params)
                } else {
                    (CENTER_GAIN, CENTER_GAIN)
                };

                let ring = voice.data.lock().unwrap();
                let start = voice.play_pos.load(Ordering::Relaxed);
                let mut pos = start;
                for frame in 0..frames {
                    let s = i16::from_le_bytes([ring[pos], ring[pos + 1]]) as f32 / 32_768.0;
                    mix[frame * 2] += s * gl;
                    mix[frame * 2 + 1] += s * gr;
                    pos = (pos + 2) % voice.buffer_bytes;
                }
                drop(ring);
                voice.play_pos.store(pos, Ordering::Relaxed);

                // A full channel means the scheduler is already on its way.
                if (start + frames * 2) / voice.block_bytes != start / voice.block_bytes {
                    let _ = voice.notify.try_send(());
                }
            }
            drop(voices);

            for (frame, out) in data.chunks_mut(channels).enumerate() {
                let l = mix[frame * 2];
                let r = mix[frame * 2 + 1];
                if channels == 1 {
                    out[0] = <T as cpal::Sample>::from_sample::<f32>(0.5 * (l + r));
                    continue;
                }
                for (ch, sample) in out.iter_mut().enumerate() {
                    let v = match ch {
                        0 => l,
                        1 => r,
                        _ => 0.0,
                    };
                    *sample = <T as cpal::Sample>::from_sample::<f32>(v);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Stereo gains for a positioned voice: equal-power pan across the
/// listener's left/right axis plus distance rolloff.
///
/// Uses the left-handed convention (front +Z, top +Y puts right at +X).
fn spatial_gains(position: Vec3, listener: &ListenerParams) -> (f32, f32) {
    let rel = position - listener.position;
    let dist = rel.length();
    if dist <= f32::EPSILON {
        return (CENTER_GAIN, CENTER_GAIN);
    }

    let right = listener.top.cross(listener.front).normalize_or_zero();
    let lateral = if right == Vec3::ZERO {
        0.0
    } else {
        (rel / dist).dot(right).clamp(-1.0, 1.0)
    };

    let theta = (lateral + 1.0) * std::f32::consts::FRAC_PI_4;
    let gain = distance_gain(dist, listener);
    (theta.cos() * gain, theta.sin() * gain)
}

/// Inverse rolloff past the minimum distance, flat beyond the maximum.
fn distance_gain(dist: f32, listener: &ListenerParams) -> f32 {
    let dist = dist.clamp(listener.min_distance, listener.max_distance);
    listener.min_distance / (listener.min_distance + listener.rolloff * (dist - listener.min_distance))
}

struct CpalDevice {
    _stream: cpal::Stream,
    shared: Arc<MixerShared>,
    sample_rate: u32,
    spatial: bool,
    name: String,
}

impl OutputDevice for CpalDevice {
    fn supports_3d(&self) -> bool {
        self.spatial
    }

    fn listener(&mut self) -> Option<Box<dyn ListenerHandle>> {
        if !self.spatial {
            return None;
        }
        let pending = self
            .shared
            .listener
            .lock()
            .map(|g| *g)
            .unwrap_or_default();
        Some(Box::new(CpalListener {
            shared: self.shared.clone(),
            pending,
        }))
    }

    fn create_stream_buffer(
        &mut self,
        geometry: BlockGeometry,
        spatial: bool,
        notify: Sender<()>,
    ) -> Result<Box<dyn StreamBuffer>> {
        if spatial && !self.spatial {
            bail!("3D buffer requested on a non-3D device");
        }
        let voice = Arc::new(VoiceShared {
            block_bytes: geometry.block_bytes,
            buffer_bytes: geometry.buffer_bytes(),
            data: Mutex::new(vec![0u8; geometry.buffer_bytes()]),
            play_pos: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            state: Mutex::new(VoiceState {
                mode: if spatial {
                    VoiceMode::Normal
                } else {
                    VoiceMode::Disabled
                },
                position: Vec3::ZERO,
                pending_mode: None,
                pending_position: None,
            }),
            notify,
        });
        self.shared.voices.lock().unwrap().push(voice.clone());
        Ok(Box::new(CpalStreamBuffer { voice }))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

struct CpalStreamBuffer {
    voice: Arc<VoiceShared>,
}

impl StreamBuffer for CpalStreamBuffer {
    fn positions(&self) -> Result<BufferPositions> {
        // No DMA lead in a software mixer: safe-write == play.
        let pos = self.voice.play_pos.load(Ordering::Relaxed);
        Ok(BufferPositions {
            play_cursor: pos,
            write_cursor: pos,
        })
    }

    fn clear(&mut self) -> Result<()> {
        self.voice.data.lock().unwrap().fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.voice.data.lock().unwrap();
        if offset >= data.len() || bytes.len() > data.len() {
            bail!(
                "write of {} bytes at {} outside buffer of {}",
                bytes.len(),
                offset,
                data.len()
            );
        }
        let first = (data.len() - offset).min(bytes.len());
        data[offset..offset + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            let rest = bytes.len() - first;
            data[..rest].copy_from_slice(&bytes[first..]);
        }
        Ok(())
    }

    fn play_looping(&mut self) -> Result<()> {
        self.voice.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.voice.playing.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn voice_mode(&self) -> VoiceMode {
        let st = self.voice.state.lock().unwrap();
        st.pending_mode.unwrap_or(st.mode)
    }

    fn set_voice_mode(&mut self, mode: VoiceMode, apply: Apply) -> Result<()> {
        let mut st = self.voice.state.lock().unwrap();
        match apply {
            Apply::Immediate => {
                st.mode = mode;
                st.pending_mode = None;
            }
            Apply::Deferred => st.pending_mode = Some(mode),
        }
        Ok(())
    }

    fn set_voice_position(&mut self, position: Vec3, apply: Apply) -> Result<()> {
        let mut st = self.voice.state.lock().unwrap();
        match apply {
            Apply::Immediate => {
                st.position = position;
                st.pending_position = None;
            }
            Apply::Deferred => st.pending_position = Some(position),
        }
        Ok(())
    }
}

impl Drop for CpalStreamBuffer {
    fn drop(&mut self) {
        self.voice.playing.store(false, Ordering::Relaxed);
        self.voice.detached.store(true, Ordering::Relaxed);
    }
}

struct CpalListener {
    shared: Arc<MixerShared>,
    pending: ListenerParams,
}

impl ListenerHandle for CpalListener {
    fn set_position(&mut self, position: Vec3) {
        self.pending.position = position;
    }

    fn set_orientation(&mut self, front: Vec3, top: Vec3) {
        self.pending.front = front;
        self.pending.top = top;
    }

    fn set_rolloff(&mut self, rolloff: f32) {
        self.pending.rolloff = rolloff;
    }

    fn set_doppler(&mut self, factor: f32) {
        self.pending.doppler = factor;
    }

    fn set_distances(&mut self, min: f32, max: f32) {
        self.pending.min_distance = min;
        self.pending.max_distance = max;
    }

    fn commit(&mut self) -> Result<()> {
        *self.shared.listener.lock().unwrap() = self.pending;
        for voice in self.shared.voices.lock().unwrap().iter() {
            let mut st = voice.state.lock().unwrap();
            if let Some(mode) = st.pending_mode.take() {
                st.mode = mode;
            }
            if let Some(position) = st.pending_position.take() {
                st.position = position;
            }
        }
        Ok(())
    }
}
