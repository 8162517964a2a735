//! Core data model (spec §3): `World`, `WorldState`, `WorldStatus`,
//! `Backend`, `Rank`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CoreError;
use crate::store::RendezvousStore;

pub type Rank = i32;

/// Tag identifying which collective backend a world was initialized with
/// (spec §3: `backend: tag from {cpu-collective, gpu-collective}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    CpuCollective,
    GpuCollective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorldState {
    Initializing = 0,
    Active = 1,
    Broken = 2,
    Removed = 3,
}

/// Atomic cell enforcing invariant 3: a world in `Broken` or `Removed` never
/// transitions back to `Active`.
#[derive(Debug)]
pub struct WorldStateCell(AtomicU8);

impl WorldStateCell {
    pub fn new(state: WorldState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> WorldState {
        match self.0.load(Ordering::SeqCst) {
            0 => WorldState::Initializing,
            1 => WorldState::Active,
            2 => WorldState::Broken,
            _ => WorldState::Removed,
        }
    }

    /// Moves `Initializing` to `Active`. A no-op if the world already moved
    /// on to `Broken`/`Removed` by the time rendezvous finished.
    pub fn activate(&self) {
        let _ = self.0.compare_exchange(
            WorldState::Initializing as u8,
            WorldState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Marks the world `Broken`. Idempotent, and never overwrites `Removed`.
    pub fn mark_broken(&self) {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            if current == WorldState::Removed as u8 || current == WorldState::Broken as u8 {
                return;
            }
            if self
                .0
                .compare_exchange(
                    current,
                    WorldState::Broken as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn mark_removed(&self) {
        self.0.store(WorldState::Removed as u8, Ordering::SeqCst);
    }
}

/// A named communication group this process participates in, identified by
/// `(name, size, local_rank)`.
pub struct World {
    pub name: String,
    pub size: usize,
    pub local_rank: Rank,
    pub backend: Backend,
    pub store: Arc<dyn RendezvousStore>,
    pub state: WorldStateCell,
}

/// Per-peer watchdog bookkeeping (spec §3). Local to the Watchdog; never
/// shared with the Manager or Communicator directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorldStatus {
    pub last_seen_tick: u64,
    pub broken: bool,
}

/// The single source of truth for which worlds exist and their state,
/// shared by [`crate::manager::WorldManager`] and
/// [`crate::communicator::WorldCommunicator`].
///
/// spec §4.2 describes the communicator's `broken: name -> bool` map as
/// "mirroring the Manager's view" — a copy kept in sync by the Manager.
/// This implementation shares the one `World` (and its atomic
/// [`WorldStateCell`]) between both components instead of maintaining two
/// copies that could drift: there is nothing to mirror because there is
/// only one map. See DESIGN.md for the rationale.
#[derive(Default)]
pub struct WorldRegistry {
    worlds: Mutex<HashMap<String, Arc<World>>>,
    /// Names with an `initialize_world` in flight, reserved so two
    /// concurrent calls for the same name can't both proceed past the
    /// `AlreadyExists` check before either has registered a `World`
    /// (invariant 1).
    pending: Mutex<HashSet<String>>,
}

impl WorldRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserves `name` for an in-flight `initialize_world` call. Fails if
    /// the name is already active or already reserved by another call.
    pub fn reserve(&self, name: &str) -> Result<(), CoreError> {
        if self.worlds.lock().unwrap().contains_key(name) {
            return Err(CoreError::AlreadyExists(name.to_string()));
        }
        let mut pending = self.pending.lock().unwrap();
        if !pending.insert(name.to_string()) {
            return Err(CoreError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    /// Releases a reservation without registering a world, used on a
    /// failed `initialize_world`.
    pub fn abort_reservation(&self, name: &str) {
        self.pending.lock().unwrap().remove(name);
    }

    /// Registers a newly-active world, consuming its reservation.
    pub fn insert(&self, world: Arc<World>) {
        let name = world.name.clone();
        self.pending.lock().unwrap().remove(&name);
        self.worlds.lock().unwrap().insert(name, world);
    }

    pub fn get(&self, name: &str) -> Option<Arc<World>> {
        self.worlds.lock().unwrap().get(name).cloned()
    }

    /// Removes `name` from the active set entirely, returning it if present.
    pub fn remove(&self, name: &str) -> Option<Arc<World>> {
        self.worlds.lock().unwrap().remove(name)
    }

    /// True if `name` is unknown, or known but `Broken`/`Removed`. Matches
    /// the original implementation's `self._broken_world.get(name, True)`:
    /// an unknown world is treated as broken, not as a panic condition.
    pub fn is_broken(&self, name: &str) -> bool {
        match self.worlds.lock().unwrap().get(name) {
            Some(world) => matches!(world.state.get(), WorldState::Broken | WorldState::Removed),
            None => true,
        }
    }

    /// The Manager's active set: names of every world currently registered,
    /// regardless of liveness.
    pub fn active_names(&self) -> Vec<String> {
        self.worlds.lock().unwrap().keys().cloned().collect()
    }
}
