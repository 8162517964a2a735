//! Liveness monitor (spec §4.3): a heartbeat protocol built on the shared
//! rendezvous store that detects dead peers and broken transports, plus a
//! signal round-trip that detects main-task deadlock.
//!
//! The Watchdog runs on dedicated OS threads rather than as an async task —
//! the deadlock probe exists specifically to catch the case where the
//! cooperative scheduler itself is wedged, so it cannot depend on that
//! scheduler to run.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::WatchdogConfig;
use crate::store::RendezvousStore;
use crate::worker::Worker;
use crate::world::Rank;

/// An event pushed onto the Watchdog's input channel by
/// [`crate::manager::WorldManager`] (spec §4.1: "enqueues a
/// `WorldAnnounced(store, name, rank, size)` event on the Watchdog's input
/// channel").
pub enum WatchdogEvent {
    Announced {
        name: String,
        store: Arc<dyn RendezvousStore>,
        rank: Rank,
        size: usize,
    },
    /// Sent by `remove_world` so the heartbeat loop stops tracking a world
    /// that's already gone, rather than re-declaring it broken next sweep.
    Removed(String),
}

/// The flags shared between the Watchdog's deadlock-probe thread and the
/// application's main task.
///
/// `main_alive` is flipped to `true` by the signal handler the application
/// installs (see [`spawn_deadlock_responder`]) and read back by the probe
/// thread. `rendezvous_in_progress` is held by
/// [`crate::manager::WorldManager`] and set for the duration of
/// `init_process_group`, because a signal delivered mid-rendezvous can bring
/// the transport's bootstrap down (spec §4.3: "suspended while
/// `init_process_group` is running").
#[derive(Clone)]
pub struct DeadlockProbeFlags {
    main_alive: Arc<AtomicBool>,
    rendezvous_in_progress: Arc<AtomicBool>,
}

impl DeadlockProbeFlags {
    pub fn new() -> Self {
        Self {
            main_alive: Arc::new(AtomicBool::new(false)),
            rendezvous_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn main_alive_flag(&self) -> Arc<AtomicBool> {
        self.main_alive.clone()
    }

    pub fn rendezvous_in_progress_flag(&self) -> Arc<AtomicBool> {
        self.rendezvous_in_progress.clone()
    }
}

impl Default for DeadlockProbeFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a task that listens for `SIGUSR1` and sets `main_alive` on
/// receipt. Intended to be spawned once by the application's main task
/// (spec §6: "the main task must install a handler that sets the shared
/// flag"); the Watchdog only ever raises the signal, never handles it.
pub fn spawn_deadlock_responder(main_alive: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to install SIGUSR1 handler for deadlock probe");
                return;
            }
        };
        loop {
            if stream.recv().await.is_none() {
                return;
            }
            main_alive.store(true, Ordering::SeqCst);
        }
    })
}

/// What the deadlock probe does once it concludes the main task is wedged.
/// A plain function pointer/closure rather than a hardcoded
/// `libc::_exit` call, so the probe's timing logic can be exercised in a
/// test without killing the test process (spec §9 redesign flags call out
/// hardcoded substring matching as brittle; the same reasoning applies to
/// hardcoding the termination mechanism itself).
pub type DeadlockAction = Arc<dyn Fn() + Send + Sync>;

/// The default [`DeadlockAction`]: an abrupt `_exit`, matching
/// [`crate::manager::WorldManager::cleanup`]'s termination style. There is
/// no cooperative task left to ask for a graceful shutdown once the probe
/// concludes the main task isn't scheduling.
pub fn default_deadlock_action() -> DeadlockAction {
    Arc::new(|| unsafe { libc::_exit(1) })
}

/// Construction parameters for [`Watchdog`]. Built by
/// [`crate::manager::WorldManager::build`], which owns both ends of the
/// channels that cross the manager/watchdog boundary.
pub struct WatchdogInit {
    pub timing: WatchdogConfig,
    pub events_rx: Receiver<WatchdogEvent>,
    pub broken_tx: tokio::sync::mpsc::Sender<String>,
    pub probe_flags: DeadlockProbeFlags,
    pub cancel_rx: Receiver<()>,
    pub on_deadlock: DeadlockAction,
}

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("watchdog thread panicked: {0}")]
    ThreadPanicked(String),
}

struct TrackedWorld {
    store: Arc<dyn RendezvousStore>,
    rank: Rank,
    size: usize,
    last_seen: Vec<u64>,
    announced_at: Instant,
    broken: bool,
}

fn heartbeat_key(world: &str, rank: Rank) -> String {
    format!("watchdog/{world}/{rank}")
}

fn parse_counter(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Heartbeat-based liveness monitor plus main-task deadlock probe (spec
/// §4.3).
pub struct Watchdog {
    timing: WatchdogConfig,
    events_rx: Receiver<WatchdogEvent>,
    broken_tx: tokio::sync::mpsc::Sender<String>,
    probe_flags: DeadlockProbeFlags,
    cancel_rx: Receiver<()>,
    on_deadlock: DeadlockAction,
    probe_trigger_tx: Sender<()>,
    probe_trigger_rx: Option<Receiver<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
    probe_handle: Option<JoinHandle<()>>,
}

impl Worker for Watchdog {
    type Config = WatchdogInit;
    type Error = WatchdogError;

    fn new(init: WatchdogInit) -> Result<Self, WatchdogError> {
        let (probe_trigger_tx, probe_trigger_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            timing: init.timing,
            events_rx: init.events_rx,
            broken_tx: init.broken_tx,
            probe_flags: init.probe_flags,
            cancel_rx: init.cancel_rx,
            on_deadlock: init.on_deadlock,
            probe_trigger_tx,
            probe_trigger_rx: Some(probe_trigger_rx),
            heartbeat_handle: None,
            probe_handle: None,
        })
    }

    fn name() -> &'static str {
        "watchdog"
    }

    fn is_recoverable(&self) -> bool {
        // A dead watchdog means no more liveness detection; restarting it
        // without re-announcing every active world would silently stop
        // monitoring them. Treated as fatal to the process, matching the
        // teacher's convention of escalating an unrecoverable worker.
        false
    }

    fn start(&mut self) -> Result<(), WatchdogError> {
        let timing = self.timing;
        let events_rx = self.events_rx.clone();
        let broken_tx = self.broken_tx.clone();
        let cancel_rx = self.cancel_rx.clone();
        let probe_trigger_tx = self.probe_trigger_tx.clone();

        let heartbeat_handle = std::thread::Builder::new()
            .name("watchdog-heartbeat".to_string())
            .spawn(move || heartbeat_loop(timing, events_rx, broken_tx, cancel_rx, probe_trigger_tx))
            .map_err(|err| WatchdogError::ThreadPanicked(err.to_string()))?;

        let probe_trigger_rx = self
            .probe_trigger_rx
            .take()
            .expect("Watchdog::start called twice");
        let probe_flags = self.probe_flags.clone();
        let probe_cancel_rx = self.cancel_rx.clone();
        let on_deadlock = self.on_deadlock.clone();
        let probe_handle = std::thread::Builder::new()
            .name("watchdog-deadlock-probe".to_string())
            .spawn(move || deadlock_probe_loop(timing, probe_flags, probe_trigger_rx, probe_cancel_rx, on_deadlock))
            .map_err(|err| WatchdogError::ThreadPanicked(err.to_string()))?;

        self.heartbeat_handle = Some(heartbeat_handle);
        self.probe_handle = Some(probe_handle);
        Ok(())
    }

    fn join(mut self) -> Result<(), WatchdogError> {
        if let Some(handle) = self.heartbeat_handle.take() {
            handle
                .join()
                .map_err(|_| WatchdogError::ThreadPanicked("heartbeat thread panicked".into()))?;
        }
        if let Some(handle) = self.probe_handle.take() {
            handle
                .join()
                .map_err(|_| WatchdogError::ThreadPanicked("deadlock probe thread panicked".into()))?;
        }
        Ok(())
    }
}

fn heartbeat_loop(
    timing: WatchdogConfig,
    events_rx: Receiver<WatchdogEvent>,
    broken_tx: tokio::sync::mpsc::Sender<String>,
    cancel_rx: Receiver<()>,
    probe_trigger_tx: Sender<()>,
) {
    let mut tracked: HashMap<String, TrackedWorld> = HashMap::new();
    let mut ticks_since_check: u32 = 0;
    let tick = crossbeam_channel::tick(timing.update_period);

    loop {
        select! {
            recv(cancel_rx) -> _ => return,
            recv(events_rx) -> event => {
                match event {
                    Ok(WatchdogEvent::Announced { name, store, rank, size }) => {
                        debug!(world = %name, rank, size, "watchdog tracking new world");
                        tracked.insert(
                            name,
                            TrackedWorld {
                                store,
                                rank,
                                size,
                                last_seen: vec![0; size],
                                announced_at: Instant::now(),
                                broken: false,
                            },
                        );
                    }
                    Ok(WatchdogEvent::Removed(name)) => {
                        tracked.remove(&name);
                    }
                    Err(_) => return,
                }
            }
            recv(tick) -> _ => {
                for (name, world) in tracked.iter_mut() {
                    if world.broken {
                        continue;
                    }
                    if let Err(err) = world.store.add(&heartbeat_key(name, world.rank), 1) {
                        warn!(world = %name, error = %err, "watchdog heartbeat publish failed");
                        world.broken = true;
                        let _ = broken_tx.blocking_send(name.clone());
                        let _ = probe_trigger_tx.send(());
                    }
                }

                ticks_since_check += 1;
                if ticks_since_check >= timing.updates_per_check {
                    ticks_since_check = 0;
                    for (name, world) in tracked.iter_mut() {
                        if world.broken {
                            continue;
                        }
                        if let Some(reason) = check_peers(name, world, timing) {
                            warn!(world = %name, reason = %reason, "watchdog declared world broken");
                            world.broken = true;
                            let _ = broken_tx.blocking_send(name.clone());
                            let _ = probe_trigger_tx.send(());
                        }
                    }
                }
            }
        }
    }
}

/// Checks every peer's heartbeat counter against what was observed at the
/// last sweep. Returns `Some(reason)` the first time a peer looks dead or
/// the store is unreachable.
fn check_peers(name: &str, world: &mut TrackedWorld, timing: WatchdogConfig) -> Option<String> {
    for peer in 0..world.size {
        let key = heartbeat_key(name, peer as Rank);
        match world.store.get(&key) {
            Ok(bytes) => {
                let count = parse_counter(&bytes).unwrap_or(0);
                if count == world.last_seen[peer] && world.announced_at.elapsed() > timing.notice_wait_timeout
                {
                    return Some(format!("peer {peer} missed its heartbeat"));
                }
                world.last_seen[peer] = count;
            }
            Err(crate::error::StoreError::KeyNotFound(_)) => {
                // Peer hasn't posted its first heartbeat yet; only a fault
                // once the grace window for a newly announced world has
                // passed.
                if world.announced_at.elapsed() > timing.notice_wait_timeout {
                    return Some(format!("peer {peer} never posted a heartbeat"));
                }
            }
            Err(err) => {
                return Some(format!("store error reading peer {peer}: {err}"));
            }
        }
    }
    None
}

/// Runs the bounded deadlock probe each time the heartbeat loop signals
/// that a world just broke.
fn deadlock_probe_loop(
    timing: WatchdogConfig,
    flags: DeadlockProbeFlags,
    trigger_rx: Receiver<()>,
    cancel_rx: Receiver<()>,
    on_deadlock: DeadlockAction,
) {
    loop {
        select! {
            recv(cancel_rx) -> _ => return,
            recv(trigger_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
                // Drain any further triggers queued while we were idle; one
                // broken world is enough to justify a probe round.
                while trigger_rx.try_recv().is_ok() {}

                if flags.rendezvous_in_progress.load(Ordering::SeqCst) {
                    continue;
                }
                run_probe(timing, &flags, &cancel_rx, &on_deadlock);
            }
        }
    }
}

fn run_probe(timing: WatchdogConfig, flags: &DeadlockProbeFlags, cancel_rx: &Receiver<()>, on_deadlock: &DeadlockAction) {
    for iteration in 0..timing.deadlock_check_iterations {
        if flags.rendezvous_in_progress.load(Ordering::SeqCst) {
            return;
        }
        flags.main_alive.store(false, Ordering::SeqCst);
        raise_deadlock_probe_signal();

        match cancel_rx.recv_timeout(timing.deadlock_check_wait_time) {
            Ok(()) => return,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }

        if flags.main_alive.load(Ordering::SeqCst) {
            debug!(iteration, "deadlock probe: main task responded");
            continue;
        }

        // One wait cycle elapsed with `main_alive` still false: the main
        // task is deemed blocked inside an uninterruptible call right now,
        // not only once every iteration of the bounded probe has failed.
        warn!(iteration, "deadlock probe: main task unresponsive; invoking deadlock action");
        on_deadlock();
        return;
    }
}

#[cfg(not(test))]
fn raise_deadlock_probe_signal() {
    unsafe {
        libc::raise(libc::SIGUSR1);
    }
}

#[cfg(test)]
fn raise_deadlock_probe_signal() {
    // Tests never install a real SIGUSR1 handler (doing so would affect
    // the whole test binary's process); they instead flip `main_alive`
    // directly to exercise the probe's timing logic.
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InProcessStore;

    fn make_timing() -> WatchdogConfig {
        WatchdogConfig {
            update_period: std::time::Duration::from_millis(5),
            updates_per_check: 2,
            notice_wait_timeout: std::time::Duration::from_millis(1),
            deadlock_check_wait_time: std::time::Duration::from_millis(10),
            deadlock_check_iterations: 3,
        }
    }

    #[test]
    fn check_peers_detects_stalled_peer() {
        let store: Arc<dyn RendezvousStore> = Arc::new(InProcessStore::default());
        store.add(&heartbeat_key("w", 0), 1).unwrap();
        store.add(&heartbeat_key("w", 1), 1).unwrap();
        let mut world = TrackedWorld {
            store: store.clone(),
            rank: 0,
            size: 2,
            last_seen: vec![0, 0],
            announced_at: Instant::now() - std::time::Duration::from_secs(1),
            broken: false,
        };
        let timing = make_timing();
        // First sweep just records the current counters.
        assert!(check_peers("w", &mut world, timing).is_none());
        // Rank 0 advances, rank 1 never does: next sweep should flag rank 1.
        store.add(&heartbeat_key("w", 0), 1).unwrap();
        let reason = check_peers("w", &mut world, timing);
        assert!(reason.unwrap().contains("peer 1"));
    }

    #[test]
    fn check_peers_tolerates_missing_heartbeat_within_grace_window() {
        let store: Arc<dyn RendezvousStore> = Arc::new(InProcessStore::default());
        store.add(&heartbeat_key("w", 0), 1).unwrap();
        let mut world = TrackedWorld {
            store,
            rank: 0,
            size: 2,
            last_seen: vec![0, 0],
            announced_at: Instant::now(),
            broken: false,
        };
        let mut timing = make_timing();
        timing.notice_wait_timeout = std::time::Duration::from_secs(60);
        assert!(check_peers("w", &mut world, timing).is_none());
    }

    #[test]
    fn check_peers_flags_store_error_as_broken() {
        let store = Arc::new(InProcessStore::default());
        store.add(&heartbeat_key("w", 0), 1).unwrap();
        store.add(&heartbeat_key("w", 1), 1).unwrap();
        let shared: Arc<dyn RendezvousStore> = store.clone();
        let mut world = TrackedWorld {
            store: shared,
            rank: 0,
            size: 2,
            last_seen: vec![0, 0],
            announced_at: Instant::now() - std::time::Duration::from_secs(1),
            broken: false,
        };
        let timing = make_timing();
        assert!(check_peers("w", &mut world, timing).is_none());
        store.poison();
        let reason = check_peers("w", &mut world, timing);
        assert!(reason.is_some());
    }
}
