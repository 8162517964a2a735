//! Lifecycle authority for worlds (spec §4.1): creates and destroys them,
//! owns their rendezvous stores, and bridges Watchdog events into world
//! removals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ManagerConfig, WatchdogConfig};
use crate::default_wrapper::DefaultWrapper;
use crate::error::CoreError;
use crate::store::{RendezvousStore, RendezvousStoreFactory};
use crate::transport::{ProcessGroupInit, Transport};
use crate::watchdog::{default_deadlock_action, DeadlockProbeFlags, WatchdogEvent, WatchdogInit};
use crate::world::{Backend, Rank, World, WorldRegistry, WorldStateCell, WorldState};

/// Everything a caller needs to finish wiring up the Watchdog and the
/// background cleanup task after [`WorldManager::build`].
pub struct ManagerBuild {
    pub manager: Arc<WorldManager>,
    pub watchdog_init: WatchdogInit,
    /// Closing this stops the Watchdog's threads; kept separate from
    /// `watchdog_init` because the caller typically holds onto it for
    /// shutdown while handing `watchdog_init` straight to `Watchdog::new`.
    pub watchdog_cancel: crossbeam_channel::Sender<()>,
    /// A clone of the channel the Watchdog uses to report broken worlds,
    /// handed to [`crate::communicator::WorldCommunicator`] so it can ask
    /// the Manager to remove a world itself when a transport-classified
    /// fault surfaces from a submission (spec §4.2 step 2).
    pub removal_tx: mpsc::Sender<String>,
}

/// Creates/destroys worlds, holds their rendezvous stores, and translates
/// Watchdog events into world removals (spec §4.1).
pub struct WorldManager {
    config: ManagerConfig,
    registry: Arc<WorldRegistry>,
    store_factory: Arc<dyn RendezvousStoreFactory>,
    transport: Arc<dyn Transport>,
    watchdog_events_tx: crossbeam_channel::Sender<WatchdogEvent>,
    rendezvous_in_progress: Arc<AtomicBool>,
    removal_rx: Mutex<DefaultWrapper<mpsc::Receiver<String>>>,
}

impl WorldManager {
    /// Builds a `WorldManager` along with the pieces needed to construct
    /// and start its paired [`crate::watchdog::Watchdog`]. The two are
    /// built together because they share the `WatchdogEvent` channel and
    /// the deadlock-probe flags; there is no meaningful way to construct
    /// one without the other.
    pub fn build(
        config: ManagerConfig,
        watchdog_timing: WatchdogConfig,
        store_factory: Arc<dyn RendezvousStoreFactory>,
        transport: Arc<dyn Transport>,
    ) -> ManagerBuild {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (broken_tx, removal_rx) = mpsc::channel(64);
        let broken_tx_clone = broken_tx.clone();
        let (watchdog_cancel, cancel_rx) = crossbeam_channel::bounded(0);
        let probe_flags = DeadlockProbeFlags::new();
        let rendezvous_in_progress = probe_flags.rendezvous_in_progress_flag();

        let manager = Arc::new(WorldManager {
            config,
            registry: WorldRegistry::new(),
            store_factory,
            transport,
            watchdog_events_tx: events_tx,
            rendezvous_in_progress,
            removal_rx: Mutex::new(DefaultWrapper::new(removal_rx)),
        });

        let watchdog_init = WatchdogInit {
            timing: watchdog_timing,
            events_rx,
            broken_tx,
            probe_flags,
            cancel_rx,
            on_deadlock: default_deadlock_action(),
        };

        ManagerBuild {
            manager,
            watchdog_init,
            watchdog_cancel,
            removal_tx: broken_tx_clone,
        }
    }

    /// The shared registry backing both this manager and the
    /// [`crate::communicator::WorldCommunicator`] built alongside it.
    pub fn registry(&self) -> Arc<WorldRegistry> {
        self.registry.clone()
    }

    /// Creates world `name`, joining its rendezvous over `(addr, port)` and
    /// registering it with the transport (spec §4.1).
    pub async fn initialize_world(
        &self,
        name: &str,
        rank: Rank,
        size: usize,
        backend: Backend,
        addr: &str,
        port: u16,
    ) -> Result<(), CoreError> {
        if size < 1 || rank < 0 || rank as usize >= size {
            return Err(CoreError::InvalidArgument(format!(
                "invalid rank/size for world {name}: rank={rank}, size={size}"
            )));
        }
        self.registry.reserve(name)?;

        let result = self.do_initialize(name, rank, size, backend, addr, port).await;
        match &result {
            Ok(store) => {
                let world = Arc::new(World {
                    name: name.to_string(),
                    size,
                    local_rank: rank,
                    backend,
                    store: store.clone(),
                    state: WorldStateCell::new(WorldState::Active),
                });
                self.registry.insert(world);
                let sent = self.watchdog_events_tx.send(WatchdogEvent::Announced {
                    name: name.to_string(),
                    store: store.clone(),
                    rank,
                    size,
                });
                if sent.is_err() {
                    warn!(world = name, "watchdog event channel closed; world will not be monitored");
                }
                debug!(world = name, rank, size, "world initialized");
            }
            Err(_) => {
                self.registry.abort_reservation(name);
            }
        }
        result.map(|_| ())
    }

    async fn do_initialize(
        &self,
        name: &str,
        rank: Rank,
        size: usize,
        backend: Backend,
        addr: &str,
        port: u16,
    ) -> Result<Arc<dyn RendezvousStore>, CoreError> {
        self.rendezvous_in_progress.store(true, Ordering::SeqCst);
        let outcome = self.connect_and_init(name, rank, size, backend, addr, port).await;
        self.rendezvous_in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    async fn connect_and_init(
        &self,
        name: &str,
        rank: Rank,
        size: usize,
        backend: Backend,
        addr: &str,
        port: u16,
    ) -> Result<Arc<dyn RendezvousStore>, CoreError> {
        let store_factory = self.store_factory.clone();
        let transport = self.transport.clone();
        let world_name = name.to_string();
        let addr = addr.to_string();
        let is_leader = rank == 0;

        let blocking = tokio::task::spawn_blocking(move || -> Result<Arc<dyn RendezvousStore>, CoreError> {
            let store = store_factory.connect(&addr, port, size, is_leader)?;
            transport.init_process_group(ProcessGroupInit {
                world_name: world_name.clone(),
                rank,
                size,
                backend,
                store: store.clone(),
            })?;
            Ok(store)
        });

        match tokio::time::timeout(self.config.store_connect_timeout, blocking).await {
            Ok(join_result) => join_result.expect("rendezvous blocking task panicked"),
            Err(_) => Err(CoreError::Store(crate::error::StoreError::Timeout(
                self.config.store_connect_timeout,
            ))),
        }
    }

    /// Removes `name` from the active set, releases its rendezvous store,
    /// and marks it `Broken` for any in-flight operation. Idempotent:
    /// removing an unknown world yields `NotFound`, which the cleanup task
    /// ignores (spec §4.1).
    pub async fn remove_world(&self, name: &str) -> Result<(), CoreError> {
        let world = self
            .registry
            .remove(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        world.state.mark_removed();

        if self.config.attempt_graceful_teardown {
            let transport = self.transport.clone();
            let world_name = name.to_string();
            let teardown = tokio::task::spawn_blocking(move || transport.destroy_process_group(&world_name)).await;
            match teardown {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(world = name, error = %err, "destroy_process_group failed"),
                Err(err) => warn!(world = name, error = %err, "destroy_process_group task panicked"),
            }
        } else {
            debug!(world = name, "skipping destroy_process_group; transport group leaks until exit");
        }

        if self
            .watchdog_events_tx
            .send(WatchdogEvent::Removed(name.to_string()))
            .is_err()
        {
            warn!(world = name, "watchdog event channel closed while removing world");
        }
        Ok(())
    }

    /// Terminates the host process (spec §4.1: "The design permits this to
    /// be an abrupt termination because the transport library's internal
    /// teardown is known to deadlock in some configurations"). Does not
    /// attempt to tear down any world's transport group first.
    pub fn cleanup(&self) -> ! {
        warn!("WorldManager::cleanup: terminating process without graceful transport teardown");
        // SAFETY: `_exit` is always safe to call; it never returns.
        unsafe { libc::_exit(1) };
    }

    /// The long-running task that consumes world names from the Watchdog's
    /// action channel and calls `remove_world` for each, ignoring
    /// `NotFound` (spec §4.1 "Cleanup task").
    pub async fn run_cleanup_task(self: Arc<Self>) {
        let mut removal_rx = self.removal_rx.lock().unwrap().take();
        while let Some(name) = removal_rx.recv().await {
            if let Err(err) = self.remove_world(&name).await {
                if !err.is_not_found() {
                    warn!(world = %name, error = %err, "cleanup task failed to remove world");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InProcessStoreFactory;
    use crate::transport::LoopbackNetwork;

    fn build_manager() -> ManagerBuild {
        let network = LoopbackNetwork::new();
        let transport = Arc::new(network.handle_for_rank(0));
        WorldManager::build(
            ManagerConfig::default(),
            WatchdogConfig::default(),
            Arc::new(InProcessStoreFactory::new()),
            transport,
        )
    }

    #[tokio::test]
    async fn initialize_then_duplicate_name_fails() {
        let build = build_manager();
        build
            .manager
            .initialize_world("w", 0, 1, Backend::CpuCollective, "127.0.0.1", 1)
            .await
            .unwrap();
        let err = build
            .manager
            .initialize_world("w", 0, 1, Backend::CpuCollective, "127.0.0.1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn rank_out_of_bounds_is_invalid_argument() {
        let build = build_manager();
        let err = build
            .manager
            .initialize_world("w", 2, 2, Backend::CpuCollective, "127.0.0.1", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn remove_unknown_world_is_not_found() {
        let build = build_manager();
        let err = build.manager.remove_world("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn remove_world_marks_state_removed() {
        let build = build_manager();
        build
            .manager
            .initialize_world("w", 0, 1, Backend::CpuCollective, "127.0.0.1", 1)
            .await
            .unwrap();
        assert!(!build.manager.registry().is_broken("w"));
        build.manager.remove_world("w").await.unwrap();
        assert!(build.manager.registry().is_broken("w"));
    }
}
