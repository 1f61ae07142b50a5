//! Scripted backend for unit tests.
//!
//! Exposes shared state handles so tests can drive the play cursor by hand
//! and assert on every write, transport call, and 3D change the scheduler
//! makes. With `auto_notify` enabled, each block write re-fires the stream's
//! notification channel so engine-level tests keep the scheduling loop
//! spinning without a real device clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use crossbeam_channel::Sender;
use glam::Vec3;

use crate::backend::{
    Apply, BufferPositions, DeviceDescriptor, DeviceOptions, EndpointId, ListenerHandle,
    OutputBackend, OutputDevice, StreamBuffer, VoiceMode,
};
use crate::ring::BlockGeometry;
use crate::spatial::ListenerParams;

#[derive(Default)]
pub(crate) struct MockControl {
    pub(crate) fail_configured_endpoint: bool,
    pub(crate) supports_3d: bool,
    pub(crate) auto_notify: bool,
    pub(crate) opened: Mutex<Vec<Option<String>>>,
    pub(crate) devices: Mutex<Vec<Arc<MockDeviceState>>>,
}

pub(crate) struct MockBackend {
    pub(crate) control: Arc<MockControl>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            control: Arc::new(MockControl::default()),
        }
    }

    pub(crate) fn with_control(control: Arc<MockControl>) -> Self {
        Self { control }
    }
}

impl OutputBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(vec![
            DeviceDescriptor {
                id: EndpointId::from("mock-default"),
                name: "Mock Default".to_string(),
            },
            DeviceDescriptor {
                id: EndpointId::from("mock-alt"),
                name: "Mock Alternate".to_string(),
            },
        ])
    }

    fn open(
        &self,
        endpoint: Option<&EndpointId>,
        _opts: &DeviceOptions,
    ) -> Result<Box<dyn OutputDevice>> {
        self.control
            .opened
            .lock()
            .unwrap()
            .push(endpoint.map(|e| e.0.clone()));
        if endpoint.is_some() && self.control.fail_configured_endpoint {
            return Err(anyhow!("endpoint unavailable"));
        }
        let (device, state) = MockDevice::new(self.control.supports_3d, self.control.auto_notify);
        self.control.devices.lock().unwrap().push(state);
        Ok(Box::new(device))
    }
}

#[derive(Default)]
pub(crate) struct MockDeviceState {
    pub(crate) buffers: Mutex<Vec<Arc<MockBufferState>>>,
    pub(crate) listener: Arc<MockListenerState>,
}

#[derive(Default)]
pub(crate) struct MockListenerState {
    pub(crate) commits: AtomicUsize,
    pub(crate) committed: Mutex<ListenerParams>,
    pub(crate) position_writes: AtomicUsize,
}

pub(crate) struct MockDevice {
    state: Arc<MockDeviceState>,
    supports_3d: bool,
    auto_notify: bool,
}

impl MockDevice {
    pub(crate) fn new(supports_3d: bool, auto_notify: bool) -> (Self, Arc<MockDeviceState>) {
        let state = Arc::new(MockDeviceState::default());
        (
            Self {
                state: state.clone(),
                supports_3d,
                auto_notify,
            },
            state,
        )
    }
}

impl OutputDevice for MockDevice {
    fn supports_3d(&self) -> bool {
        self.supports_3d
    }

    fn listener(&mut self) -> Option<Box<dyn ListenerHandle>> {
        if !self.supports_3d {
            return None;
        }
        Some(Box::new(MockListener {
            state: self.state.listener.clone(),
            pending: ListenerParams::default(),
            wrote_position: false,
        }))
    }

    fn create_stream_buffer(
        &mut self,
        geometry: BlockGeometry,
        spatial: bool,
        notify: Sender<()>,
    ) -> Result<Box<dyn StreamBuffer>> {
        if spatial && !self.supports_3d {
            bail!("3D buffer requested on a non-3D device");
        }
        let state = Arc::new(MockBufferState {
            geometry,
            data: Mutex::new(vec![0u8; geometry.buffer_bytes()]),
            play_cursor: AtomicUsize::new(0),
            playing: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            mode_changes: Mutex::new(Vec::new()),
            position_changes: Mutex::new(Vec::new()),
            notify,
            auto_notify: self.auto_notify,
        });
        self.state.buffers.lock().unwrap().push(state.clone());
        Ok(Box::new(MockBuffer { state }))
    }

    fn sample_rate(&self) -> u32 {
        crate::source::SAMPLE_RATE
    }

    fn describe(&self) -> String {
        "Mock Default".to_string()
    }
}

pub(crate) struct MockBufferState {
    pub(crate) geometry: BlockGeometry,
    pub(crate) data: Mutex<Vec<u8>>,
    pub(crate) play_cursor: AtomicUsize,
    pub(crate) playing: AtomicBool,
    pub(crate) stop_calls: AtomicUsize,
    pub(crate) clear_calls: AtomicUsize,
    /// Byte offset of every `write_at` call, in order.
    pub(crate) writes: Mutex<Vec<usize>>,
    pub(crate) mode_changes: Mutex<Vec<(VoiceMode, Apply)>>,
    pub(crate) position_changes: Mutex<Vec<(Vec3, Apply)>>,
    notify: Sender<()>,
    auto_notify: bool,
}

impl MockBufferState {
    /// Move the scripted play cursor to `block`. With `auto_notify` this
    /// fires the stream's notification, like a real block-boundary crossing.
    pub(crate) fn set_play_block(&self, block: usize) {
        self.play_cursor
            .store(self.geometry.block_offset(block), Ordering::Relaxed);
        if self.auto_notify {
            let _ = self.notify.try_send(());
        }
    }

    pub(crate) fn write_blocks(&self) -> Vec<usize> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|off| self.geometry.block_for_offset(*off))
            .collect()
    }

    /// Effective (committed-or-pending) mode after the last change.
    pub(crate) fn last_mode(&self) -> Option<VoiceMode> {
        self.mode_changes.lock().unwrap().last().map(|(m, _)| *m)
    }
}

pub(crate) struct MockBuffer {
    state: Arc<MockBufferState>,
}

impl StreamBuffer for MockBuffer {
    fn positions(&self) -> Result<BufferPositions> {
        let pos = self.state.play_cursor.load(Ordering::Relaxed);
        Ok(BufferPositions {
            play_cursor: pos,
            write_cursor: pos,
        })
    }

    fn clear(&mut self) -> Result<()> {
        self.state.clear_calls.fetch_add(1, Ordering::Relaxed);
        self.state.data.lock().unwrap().fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.state.data.lock().unwrap();
        if offset >= data.len() || bytes.len() > data.len() {
            bail!("write outside mock buffer");
        }
        let first = (data.len() - offset).min(bytes.len());
        data[offset..offset + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            let rest = bytes.len() - first;
            data[..rest].copy_from_slice(&bytes[first..]);
        }
        drop(data);
        self.state.writes.lock().unwrap().push(offset);
        if self.state.auto_notify {
            let _ = self.state.notify.try_send(());
        }
        Ok(())
    }

    fn play_looping(&mut self) -> Result<()> {
        self.state.playing.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.playing.store(false, Ordering::Relaxed);
        self.state.stop_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn voice_mode(&self) -> VoiceMode {
        self.state
            .last_mode()
            .unwrap_or(VoiceMode::Normal)
    }

    fn set_voice_mode(&mut self, mode: VoiceMode, apply: Apply) -> Result<()> {
        self.state.mode_changes.lock().unwrap().push((mode, apply));
        Ok(())
    }

    fn set_voice_position(&mut self, position: Vec3, apply: Apply) -> Result<()> {
        self.state
            .position_changes
            .lock()
            .unwrap()
            .push((position, apply));
        Ok(())
    }
}

pub(crate) struct MockListener {
    state: Arc<MockListenerState>,
    pending: ListenerParams,
    wrote_position: bool,
}

impl ListenerHandle for MockListener {
    fn set_position(&mut self, position: Vec3) {
        self.pending.position = position;
        self.wrote_position = true;
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
        *self.state.committed.lock().unwrap() = self.pending;
        self.state.commits.fetch_add(1, Ordering::Relaxed);
        if self.wrote_position {
            self.state.position_writes.fetch_add(1, Ordering::Relaxed);
            self.wrote_position = false;
        }
        Ok(())
    }
}
