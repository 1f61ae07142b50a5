//! Shared engine counters.
//!
//! Updated from the scheduling thread via relaxed atomics and snapshotted by
//! whatever UI or CLI is watching the engine.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters owned by the engine and its players.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) fills: AtomicU64,
    pub(crate) blocks_written: AtomicU64,
    pub(crate) frame_misses: AtomicU64,
    pub(crate) desync_resyncs: AtomicU64,
    pub(crate) players_added: AtomicU64,
    pub(crate) players_removed: AtomicU64,
    pub(crate) active_players: AtomicUsize,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStatus {
    /// Streams currently registered with the engine.
    pub active_players: usize,
    /// Fill cycles dispatched.
    pub fills: u64,
    /// Ring blocks written across all streams.
    pub blocks_written: u64,
    /// Frame requests the sources could not satisfy.
    pub frame_misses: u64,
    /// Backward-playback resynchronizations.
    pub desync_resyncs: u64,
    pub players_added: u64,
    pub players_removed: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatus {
        EngineStatus {
            active_players: self.active_players.load(Ordering::Relaxed),
            fills: self.fills.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            frame_misses: self.frame_misses.load(Ordering::Relaxed),
            desync_resyncs: self.desync_resyncs.load(Ordering::Relaxed),
            players_added: self.players_added.load(Ordering::Relaxed),
            players_removed: self.players_removed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = EngineStats::default();
        stats.fills.store(3, Ordering::Relaxed);
        stats.blocks_written.store(150, Ordering::Relaxed);
        stats.active_players.store(2, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.fills, 3);
        assert_eq!(snap.blocks_written, 150);
        assert_eq!(snap.active_players, 2);
        assert_eq!(snap.frame_misses, 0);
    }
}
