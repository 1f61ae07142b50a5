use anyhow::{Result, bail};
use std::time::Duration;

use crate::backend::EndpointId;
use crate::spatial::SpatialModel;

/// Engine configuration supplied by the embedding application.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Backend name in the registry. `None` picks the first registered backend.
    pub backend: Option<String>,
    /// Preferred output endpoint. Falls back to the default endpoint if it
    /// cannot be opened.
    pub endpoint: Option<EndpointId>,
    /// Number of ring blocks the write cursor stays ahead of playback.
    ///
    /// Higher values buy underrun resistance at the cost of latency. Must be
    /// below `block_count - 1`.
    pub lookahead_blocks: usize,
    /// Requested 3D processing tier.
    pub spatial_model: SpatialModel,
    /// Distance rolloff factor applied beyond the minimum distance.
    pub rolloff: f32,
    /// Distance below which no attenuation is applied.
    pub min_distance: f32,
    /// Distance beyond which attenuation stops increasing.
    pub max_distance: f32,
    /// Force every voice to play centered regardless of position data.
    pub center_override: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: None,
            endpoint: None,
            lookahead_blocks: 5,
            spatial_model: SpatialModel::None,
            rolloff: 1.0,
            min_distance: 1.0,
            max_distance: 100.0,
            center_override: false,
        }
    }
}

/// Scheduling constants that are empirical rather than derived.
///
/// The defaults match the values the engine was tuned with; they are exposed
/// so deployments can adjust them without a rebuild.
#[derive(Clone, Debug)]
pub struct EngineTunables {
    /// Number of blocks in each stream's ring buffer.
    pub block_count: usize,
    /// Guard band (in blocks) used to detect a play cursor that moved
    /// backwards relative to the write cursor.
    pub desync_window: usize,
    /// Consecutive missed frames tolerated before a stream is declared
    /// finished and torn down.
    pub miss_grace: u32,
    /// Upper bound on one wait cycle; also the fallback fill cadence when no
    /// hardware notification arrives.
    pub wait_timeout: Duration,
    /// Listener commit rate in Hz.
    pub listener_hz: u32,
    /// Maximum number of notification handles one wait cycle may observe
    /// (all players plus the engine's own wake handle).
    pub max_wait_handles: usize,
}

impl Default for EngineTunables {
    fn default() -> Self {
        Self {
            block_count: 50,
            desync_window: 10,
            miss_grace: 250,
            wait_timeout: Duration::from_millis(20),
            listener_hz: 50,
            max_wait_handles: 64,
        }
    }
}

impl EngineConfig {
    /// Check the configuration against the tunables it will run with.
    pub fn validate(&self, tunables: &EngineTunables) -> Result<()> {
        if tunables.block_count < 2 {
            bail!("block_count must be at least 2");
        }
        if self.lookahead_blocks + 1 >= tunables.block_count {
            bail!(
                "lookahead of {} blocks does not fit a ring of {} blocks",
                self.lookahead_blocks,
                tunables.block_count
            );
        }
        if tunables.desync_window == 0 || tunables.desync_window >= tunables.block_count {
            bail!("desync_window must be between 1 and block_count - 1");
        }
        if tunables.max_wait_handles < 2 {
            bail!("max_wait_handles must leave room for at least one stream");
        }
        if tunables.listener_hz == 0 {
            bail!("listener_hz must be non-zero");
        }
        if !(self.rolloff > 0.0) {
            bail!("rolloff must be positive");
        }
        if !(self.min_distance > 0.0) || self.min_distance >= self.max_distance {
            bail!("3D distances must satisfy 0 < min < max");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate(&EngineTunables::default()).is_ok());
    }

    #[test]
    fn lookahead_must_fit_ring() {
        let cfg = EngineConfig {
            lookahead_blocks: 49,
            ..EngineConfig::default()
        };
        assert!(cfg.validate(&EngineTunables::default()).is_err());

        let cfg = EngineConfig {
            lookahead_blocks: 48,
            ..EngineConfig::default()
        };
        assert!(cfg.validate(&EngineTunables::default()).is_ok());
    }

    #[test]
    fn rejects_degenerate_distances() {
        let cfg = EngineConfig {
            min_distance: 10.0,
            max_distance: 10.0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate(&EngineTunables::default()).is_err());
    }

    #[test]
    fn rejects_zero_desync_window() {
        let cfg = EngineConfig::default();
        let tunables = EngineTunables {
            desync_window: 0,
            ..EngineTunables::default()
        };
        assert!(cfg.validate(&tunables).is_err());
    }
}
