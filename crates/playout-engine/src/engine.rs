//! Output engine: device lifecycle, the player set, and the scheduling loop.
//!
//! One dedicated thread owns every hardware mutation. Each cycle it rebuilds
//! a wait set from the read-locked player collection plus its own wake
//! handle, blocks on "any of these signalled" with a bounded timeout,
//! dispatches the fill for whichever stream woke it, and commits listener
//! updates on a fixed cadence independent of the wake reason. Membership
//! changes (stream start, exhaustion, explicit removal) take the write lock
//! and never happen inside the wait path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, Select, Sender, bounded};

use crate::backend::{BackendRegistry, DeviceOptions, ListenerHandle, OutputDevice};
use crate::config::{EngineConfig, EngineTunables};
use crate::player::{FillContext, FillOutcome, StreamPlayer};
use crate::source::{FrameSource, SAMPLE_RATE};
use crate::spatial::{ListenerParams, PoseTracker};
use crate::status::{EngineStats, EngineStatus};

/// Identifier of one active stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(u64);

/// Details of the opened device, reported by the scheduling thread.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    /// Whether a 3D listener was created.
    pub spatial: bool,
}

struct PlayerEntry {
    id: PlayerId,
    name: String,
    notify_rx: Receiver<()>,
    player: Mutex<StreamPlayer>,
}

struct EngineShared {
    config: EngineConfig,
    tunables: EngineTunables,
    players: RwLock<Vec<Arc<PlayerEntry>>>,
    running: AtomicBool,
    stats: Arc<EngineStats>,
    tracker: PoseTracker,
    next_id: AtomicU64,
}

/// Handle to a running output engine.
///
/// Dropping the handle stops the scheduling thread and releases the device.
pub struct OutputEngine {
    shared: Arc<EngineShared>,
    wake_tx: Sender<()>,
    join: Mutex<Option<JoinHandle<()>>>,
    device_info: DeviceInfo,
}

impl std::fmt::Debug for OutputEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputEngine")
            .field("device_info", &self.device_info)
            .finish_non_exhaustive()
    }
}

impl OutputEngine {
    /// Open the output device and start the scheduling thread.
    ///
    /// The device is opened on the scheduling thread itself (stream handles
    /// are not required to move across threads); this call blocks until the
    /// open succeeds or fails. A configured endpoint that fails to open
    /// falls back to the default endpoint with a warning.
    pub fn start(
        registry: Arc<BackendRegistry>,
        config: EngineConfig,
        tunables: EngineTunables,
    ) -> Result<Self> {
        config.validate(&tunables)?;

        let shared = Arc::new(EngineShared {
            config,
            tunables,
            players: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
            stats: Arc::new(EngineStats::default()),
            tracker: PoseTracker::new(),
            next_id: AtomicU64::new(0),
        });

        let (wake_tx, wake_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);

        let thread_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("playout-engine".into())
            .spawn(move || {
                let (device, listener) =
                    match open_device(registry.as_ref(), &thread_shared.config) {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let info = DeviceInfo {
                    name: device.describe(),
                    sample_rate: device.sample_rate(),
                    spatial: listener.is_some(),
                };
                if ready_tx.send(Ok(info)).is_err() {
                    return;
                }
                run_loop(&thread_shared, wake_rx, device, listener);
            })
            .context("spawn scheduling thread")?;

        let device_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e.context("open output device"));
            }
            Err(_) => {
                let _ = join.join();
                bail!("scheduling thread exited before reporting readiness");
            }
        };

        tracing::info!(
            device = %device_info.name,
            rate_hz = device_info.sample_rate,
            spatial = device_info.spatial,
            "output engine running"
        );

        Ok(Self {
            shared,
            wake_tx,
            join: Mutex::new(Some(join)),
            device_info,
        })
    }

    /// Register a new stream. Its notification is pre-signalled so the next
    /// wait cycle performs the first fill immediately.
    pub fn add_source(&self, source: Box<dyn FrameSource>) -> Result<PlayerId> {
        if !self.shared.running.load(Ordering::Relaxed) {
            bail!("engine is stopped");
        }

        let mut players = self.shared.players.write().unwrap();
        // One slot stays reserved for the engine's own wake handle.
        if players.len() + 2 > self.shared.tunables.max_wait_handles {
            bail!(
                "wait-set limit of {} handles reached; cannot add another stream",
                self.shared.tunables.max_wait_handles
            );
        }

        let id = PlayerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (notify_tx, notify_rx) = bounded(1);
        let _ = notify_tx.try_send(());

        let player = StreamPlayer::new(
            source,
            self.shared.config.lookahead_blocks,
            &self.shared.tunables,
            notify_tx,
            notify_rx.clone(),
            self.shared.stats.clone(),
        );
        let name = player.name().to_string();
        players.push(Arc::new(PlayerEntry {
            id,
            name: name.clone(),
            notify_rx,
            player: Mutex::new(player),
        }));
        self.shared.stats.players_added.fetch_add(1, Ordering::Relaxed);
        self.shared
            .stats
            .active_players
            .store(players.len(), Ordering::Relaxed);
        drop(players);

        tracing::info!(stream = %name, id = id.0, "stream registered");
        // Nudge the loop so the new handle joins the wait set promptly.
        let _ = self.wake_tx.try_send(());
        Ok(id)
    }

    /// Remove a stream explicitly. Returns whether it was present.
    pub fn remove_source(&self, id: PlayerId) -> bool {
        let removed = remove_player(&self.shared, id);
        if removed {
            let _ = self.wake_tx.try_send(());
        }
        removed
    }

    /// Streams currently registered, in registration order.
    pub fn active_players(&self) -> Vec<PlayerId> {
        self.shared
            .players
            .read()
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.stats.snapshot()
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Tracking state feeding the listener updates and the centered-voice
    /// rule. Clone it and publish poses from wherever position data lives.
    pub fn tracker(&self) -> PoseTracker {
        self.shared.tracker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Stop the scheduling thread and release the device. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_device(
    registry: &BackendRegistry,
    config: &EngineConfig,
) -> Result<(Box<dyn OutputDevice>, Option<Box<dyn ListenerHandle>>)> {
    let backend = match config.backend.as_deref() {
        Some(name) => registry
            .get(name)
            .ok_or_else(|| anyhow!("unknown backend: {name}"))?,
        None => registry
            .default_backend()
            .ok_or_else(|| anyhow!("no output backends registered"))?,
    };

    let opts = DeviceOptions {
        sample_rate: SAMPLE_RATE,
        spatial_model: config.spatial_model,
        listener: ListenerParams {
            rolloff: config.rolloff,
            min_distance: config.min_distance,
            max_distance: config.max_distance,
            doppler: 0.0,
            ..ListenerParams::default()
        },
    };

    let mut device = match config.endpoint.as_ref() {
        Some(endpoint) => match backend.open(Some(endpoint), &opts) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    "configured endpoint failed; using default output: {e:#}"
                );
                backend
                    .open(None, &opts)
                    .context("open default output device")?
            }
        },
        None => backend
            .open(None, &opts)
            .context("open default output device")?,
    };

    let listener = if config.spatial_model.is_enabled() {
        match device.listener() {
            Some(mut listener) => {
                listener.set_rolloff(config.rolloff);
                // Doppler stays off; the scheduler carries no velocity data.
                listener.set_doppler(0.0);
                listener.set_distances(config.min_distance, config.max_distance);
                if let Err(e) = listener.commit() {
                    tracing::warn!("initial listener commit failed: {e:#}");
                }
                tracing::info!("3D output active");
                Some(listener)
            }
            None => {
                tracing::warn!("3D output requested but unavailable; continuing without it");
                None
            }
        }
    } else {
        None
    };

    Ok((device, listener))
}

fn run_loop(
    shared: &Arc<EngineShared>,
    wake_rx: Receiver<()>,
    mut device: Box<dyn OutputDevice>,
    mut listener: Option<Box<dyn ListenerHandle>>,
) {
    let tick = Duration::from_secs(1) / shared.tunables.listener_hz;
    let mut next_listener_at = Instant::now();

    while shared.running.load(Ordering::Relaxed) {
        // Snapshot the wait set under the read lock; the wait itself runs
        // without holding it so new streams can register meanwhile.
        let wait: Vec<(PlayerId, Receiver<()>)> = {
            let players = shared.players.read().unwrap();
            players.iter().map(|e| (e.id, e.notify_rx.clone())).collect()
        };

        let mut sel = Select::new();
        for (_, rx) in &wait {
            sel.recv(rx);
        }
        let wake_index = sel.recv(&wake_rx);

        let mut hit = None;
        match sel.select_timeout(shared.tunables.wait_timeout) {
            Ok(op) => {
                let index = op.index();
                if index == wake_index {
                    let _ = op.recv(&wake_rx);
                } else {
                    let _ = op.recv(&wait[index].1);
                    hit = Some(wait[index].0);
                }
            }
            // Timeout: fall through; it bounds scheduling latency and keeps
            // the listener cadence alive without hardware notifications.
            Err(_) => {}
        }

        let now = Instant::now();
        if now >= next_listener_at {
            next_listener_at = now + tick;
            commit_listener(shared, listener.as_deref_mut());
        }

        let mut dead = None;
        if let Some(id) = hit {
            let ctx = FillContext {
                spatial_active: listener.is_some(),
                tracking_valid: shared.tracker.get().valid,
                center_override: shared.config.center_override,
            };
            // Resolve under the read lock, fill after releasing it: the
            // lock guards membership only, never a hardware call.
            let entry = {
                let players = shared.players.read().unwrap();
                players.iter().find(|e| e.id == id).cloned()
            };
            if let Some(entry) = entry {
                match entry.player.lock().unwrap().fill_ready(device.as_mut(), &ctx) {
                    Ok(FillOutcome::Continue) => {}
                    Ok(FillOutcome::Exhausted) => dead = Some(id),
                    Err(e) => {
                        // Lock/unlock/position failures on an established
                        // buffer leave the ring in an unknown state;
                        // continuing risks feeding corrupt audio to the
                        // device.
                        tracing::error!("unrecoverable output device failure: {e:#}");
                        std::process::exit(70);
                    }
                }
            }
        }

        if let Some(id) = dead {
            remove_player(shared, id);
        }
    }

    // Teardown in reverse acquisition order: players (and their buffers),
    // then the listener, then the device.
    let drained: Vec<Arc<PlayerEntry>> = {
        let mut players = shared.players.write().unwrap();
        shared.stats.active_players.store(0, Ordering::Relaxed);
        players.drain(..).collect()
    };
    drop(drained);
    drop(listener.take());
    drop(device);
    tracing::debug!("scheduling loop stopped");
}

fn commit_listener(shared: &Arc<EngineShared>, listener: Option<&mut (dyn ListenerHandle + '_)>) {
    let Some(listener) = listener else {
        return;
    };
    let pose = shared.tracker.get();
    // With the override on or tracking invalid, every voice is centered and
    // 3D processing is already disabled; skip the pose write but still
    // flush any deferred per-voice values.
    if pose.valid && !shared.config.center_override {
        listener.set_position(pose.position);
        listener.set_orientation(pose.front, pose.top);
    }
    if let Err(e) = listener.commit() {
        tracing::warn!("listener commit failed: {e:#}");
    }
}

fn remove_player(shared: &Arc<EngineShared>, id: PlayerId) -> bool {
    let mut players = shared.players.write().unwrap();
    let Some(index) = players.iter().position(|e| e.id == id) else {
        return false;
    };
    let entry = players.remove(index);
    shared.stats.players_removed.fetch_add(1, Ordering::Relaxed);
    shared
        .stats
        .active_players
        .store(players.len(), Ordering::Relaxed);
    drop(players);
    tracing::info!(stream = %entry.name, id = id.0, "stream removed");
    true
}
