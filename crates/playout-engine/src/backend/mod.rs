//! Device/platform audio contract consumed by the scheduling core.
//!
//! The engine talks to hardware exclusively through these traits: a backend
//! opens devices, a device creates per-stream ring buffers (voices), and a
//! buffer exposes cursor positions, block writes, and transport control.
//! Buffer fill progress is reported through a bounded crossbeam channel per
//! stream: the backend fires it whenever the play cursor crosses a block
//! boundary, and the capacity of one gives auto-reset event semantics.
//!
//! Backends are collected in an explicit [`BackendRegistry`] built by the
//! composition root; nothing registers itself through global state.

pub mod cpal;

#[cfg(test)]
pub(crate) mod mock;

use anyhow::Result;
use crossbeam_channel::Sender;
use glam::Vec3;

use crate::ring::BlockGeometry;
use crate::spatial::{ListenerParams, SpatialModel};

/// Stable identifier of one output endpoint within a backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(pub String);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One enumerated output endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: EndpointId,
    pub name: String,
}

/// How a voice parameter change takes effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Apply {
    /// Take effect right away (used for the very first fill of a fresh
    /// buffer, to avoid an audible default-position blip).
    Immediate,
    /// Batched with the next listener commit.
    Deferred,
}

/// Per-voice 3D processing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceMode {
    /// Voice plays centered; spatial processing bypassed.
    Disabled,
    /// Voice is positioned in 3D.
    Normal,
}

/// Cursor snapshot for one stream buffer.
///
/// `write_cursor` is the earliest byte it is safe to write at; backends
/// without a DMA lead report it equal to `play_cursor`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPositions {
    pub play_cursor: usize,
    pub write_cursor: usize,
}

/// Options handed to [`OutputBackend::open`].
#[derive(Clone, Debug)]
pub struct DeviceOptions {
    /// Sample rate every stream buffer runs at.
    pub sample_rate: u32,
    /// Requested 3D tier; [`SpatialModel::None`] disables 3D entirely.
    pub spatial_model: SpatialModel,
    /// Initial listener parameters (rolloff, distances, doppler).
    pub listener: ListenerParams,
}

/// Factory for output devices.
pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerate output endpoints in one synchronous call.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open an endpoint, or the default endpoint when `None`.
    ///
    /// Opening the *configured* endpoint may fail recoverably; falling back
    /// to the default is the caller's policy, not the backend's.
    fn open(
        &self,
        endpoint: Option<&EndpointId>,
        opts: &DeviceOptions,
    ) -> Result<Box<dyn OutputDevice>>;
}

/// One opened output device. Lives on the scheduling thread.
pub trait OutputDevice {
    /// Whether 3D voices and a listener are available on this device.
    fn supports_3d(&self) -> bool;

    /// The device's shared 3D listener, if any. All parameter writes on the
    /// handle are deferred until [`ListenerHandle::commit`].
    fn listener(&mut self) -> Option<Box<dyn ListenerHandle>>;

    /// Allocate one stream ring buffer, zero-filled.
    ///
    /// `notify` is signalled whenever playback advances across a block
    /// boundary. `spatial` requests a positionable voice; it must only be
    /// set when [`OutputDevice::supports_3d`] is true.
    fn create_stream_buffer(
        &mut self,
        geometry: BlockGeometry,
        spatial: bool,
        notify: Sender<()>,
    ) -> Result<Box<dyn StreamBuffer>>;

    /// Effective output sample rate.
    fn sample_rate(&self) -> u32;

    /// Human-readable endpoint name for logs.
    fn describe(&self) -> String;
}

/// One stream's hardware ring buffer (a voice).
///
/// Dropping the handle releases the voice; there is no separate free call.
/// Handles live inside the engine's shared player set, so they must be
/// `Send` even though all calls happen on the scheduling thread.
pub trait StreamBuffer: Send {
    /// Current cursor positions.
    fn positions(&self) -> Result<BufferPositions>;

    /// Zero the entire buffer.
    fn clear(&mut self) -> Result<()>;

    /// Write `bytes` at `offset`, wrapping across the buffer end when the
    /// region straddles it. Acquisition and release of the underlying
    /// region happen inside this one call.
    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Start looping playback.
    fn play_looping(&mut self) -> Result<()>;

    /// Stop playback.
    fn stop(&mut self) -> Result<()>;

    /// Most recently requested voice mode (pending changes included).
    fn voice_mode(&self) -> VoiceMode;

    fn set_voice_mode(&mut self, mode: VoiceMode, apply: Apply) -> Result<()>;

    fn set_voice_position(&mut self, position: Vec3, apply: Apply) -> Result<()>;
}

/// Deferred-commit handle to the device's shared 3D listener.
///
/// Setters buffer values; [`ListenerHandle::commit`] applies the batch
/// atomically, together with any deferred per-voice changes.
pub trait ListenerHandle {
    fn set_position(&mut self, position: Vec3);
    fn set_orientation(&mut self, front: Vec3, top: Vec3);
    fn set_rolloff(&mut self, rolloff: f32);
    fn set_doppler(&mut self, factor: f32);
    fn set_distances(&mut self, min: f32, max: f32);
    fn commit(&mut self) -> Result<()>;
}

/// Explicit backend registry built at startup by the composition root.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn OutputBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Box<dyn OutputBackend>) {
        self.backends.push(backend);
    }

    pub fn get(&self, name: &str) -> Option<&dyn OutputBackend> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
    }

    /// First registered backend, used when no backend name is configured.
    pub fn default_backend(&self) -> Option<&dyn OutputBackend> {
        self.backends.first().map(|b| b.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

/// Order device descriptors for selection UIs: the previously selected
/// endpoint first, everything else in enumeration order.
pub fn order_devices(
    devices: Vec<DeviceDescriptor>,
    selected: Option<&EndpointId>,
) -> Vec<DeviceDescriptor> {
    let Some(selected) = selected else {
        return devices;
    };
    let (mut chosen, rest): (Vec<_>, Vec<_>) =
        devices.into_iter().partition(|d| &d.id == selected);
    chosen.extend(rest);
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: EndpointId::from(id),
            name: id.to_uppercase(),
        }
    }

    #[test]
    fn order_devices_puts_selected_first() {
        let devices = vec![desc("a"), desc("b"), desc("c")];
        let ordered = order_devices(devices, Some(&EndpointId::from("b")));
        let ids: Vec<_> = ordered.iter().map(|d| d.id.0.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn order_devices_keeps_order_without_selection() {
        let devices = vec![desc("a"), desc("b")];
        let ordered = order_devices(devices.clone(), None);
        assert_eq!(ordered, devices);
    }

    #[test]
    fn order_devices_ignores_unknown_selection() {
        let devices = vec![desc("a"), desc("b")];
        let ordered = order_devices(devices.clone(), Some(&EndpointId::from("zzz")));
        assert_eq!(ordered, devices);
    }

    #[test]
    fn registry_lookup_by_name_and_default() {
        let mut registry = BackendRegistry::new();
        assert!(registry.default_backend().is_none());

        registry.register(Box::new(mock::MockBackend::new()));
        assert_eq!(registry.names(), vec!["mock"]);
        assert!(registry.get("mock").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.default_backend().unwrap().name(), "mock");
    }
}
