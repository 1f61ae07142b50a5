//! 3D positioning primitives shared by the fill scheduler and the listener
//! update path.

use std::sync::{Arc, Mutex};

use glam::Vec3;

/// Spatial processing tier requested for the output device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpatialModel {
    /// No 3D processing; every voice plays centered.
    #[default]
    None,
    /// Equal-power panning with distance rolloff.
    Panning,
    /// Lightweight HRTF. Backends without an HRTF path may pan instead.
    LightHrtf,
    /// Full HRTF. Backends without an HRTF path may pan instead.
    FullHrtf,
}

impl SpatialModel {
    /// Whether any 3D processing was requested at all.
    pub fn is_enabled(self) -> bool {
        !matches!(self, SpatialModel::None)
    }
}

/// Half-width of the box around the origin inside which a voice counts as
/// centered.
pub const CENTER_EPSILON: f32 = 0.1;

/// Classify whether a voice should bypass 3D processing for the next block.
///
/// A voice is centered when the override is set, when upstream positional
/// tracking is invalid, or when its position sits within [`CENTER_EPSILON`]
/// of the origin on every axis.
pub fn voice_is_centered(position: Vec3, tracking_valid: bool, center_override: bool) -> bool {
    if center_override || !tracking_valid {
        return true;
    }
    position.x.abs() < CENTER_EPSILON
        && position.y.abs() < CENTER_EPSILON
        && position.z.abs() < CENTER_EPSILON
}

/// Listener pose plus the global spatial parameters, committed as one
/// deferred batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ListenerParams {
    pub position: Vec3,
    /// Unit vector the listener faces.
    pub front: Vec3,
    /// Unit vector out of the top of the listener's head.
    pub top: Vec3,
    pub rolloff: f32,
    pub doppler: f32,
    pub min_distance: f32,
    pub max_distance: f32,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            front: Vec3::Z,
            top: Vec3::Y,
            rolloff: 1.0,
            doppler: 0.0,
            min_distance: 1.0,
            max_distance: 100.0,
        }
    }
}

/// One snapshot of upstream positional tracking.
#[derive(Clone, Copy, Debug)]
pub struct TrackedPose {
    /// Whether the tracking data below can be trusted. While false, every
    /// voice plays centered and listener pose writes are skipped.
    pub valid: bool,
    pub position: Vec3,
    pub front: Vec3,
    pub top: Vec3,
}

impl Default for TrackedPose {
    fn default() -> Self {
        Self {
            valid: false,
            position: Vec3::ZERO,
            front: Vec3::Z,
            top: Vec3::Y,
        }
    }
}

/// Shared listener tracking state, updated by the embedding application and
/// read by the engine's listener tick.
#[derive(Clone, Debug, Default)]
pub struct PoseTracker {
    inner: Arc<Mutex<TrackedPose>>,
}

impl PoseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new tracking snapshot.
    pub fn update(&self, pose: TrackedPose) {
        if let Ok(mut g) = self.inner.lock() {
            *g = pose;
        }
    }

    /// Mark the current tracking data as unusable.
    pub fn invalidate(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.valid = false;
        }
    }

    pub fn get(&self) -> TrackedPose {
        self.inner.lock().map(|g| *g).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_origin_is_centered() {
        assert!(voice_is_centered(
            Vec3::new(0.05, -0.05, 0.0),
            true,
            false
        ));
    }

    #[test]
    fn off_axis_position_is_not_centered() {
        assert!(!voice_is_centered(Vec3::new(0.2, 0.0, 0.0), true, false));
    }

    #[test]
    fn invalid_tracking_centers_any_position() {
        assert!(voice_is_centered(Vec3::new(40.0, 2.0, -7.0), false, false));
    }

    #[test]
    fn override_centers_any_position() {
        assert!(voice_is_centered(Vec3::new(40.0, 2.0, -7.0), true, true));
    }

    #[test]
    fn epsilon_is_per_axis() {
        // Each axis is just inside the box even though the norm exceeds it.
        assert!(voice_is_centered(
            Vec3::new(0.09, 0.09, 0.09),
            true,
            false
        ));
    }

    #[test]
    fn tracker_roundtrip() {
        let tracker = PoseTracker::new();
        assert!(!tracker.get().valid);

        tracker.update(TrackedPose {
            valid: true,
            position: Vec3::new(1.0, 2.0, 3.0),
            ..TrackedPose::default()
        });
        let pose = tracker.get();
        assert!(pose.valid);
        assert_eq!(pose.position, Vec3::new(1.0, 2.0, 3.0));

        tracker.invalidate();
        assert!(!tracker.get().valid);
        assert_eq!(tracker.get().position, Vec3::new(1.0, 2.0, 3.0));
    }
}
