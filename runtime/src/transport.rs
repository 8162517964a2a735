//! The transport contract (spec §6): the external collective-communication
//! library this crate drives but does not implement. Every method takes
//! `world_name` explicitly rather than relying on thread-local "current
//! world" state, per the spec §9 redesign flag calling that pattern out as
//! a footgun for a crate juggling more than one world at a time.
//!
//! [`LoopbackTransport`] is the reference implementation used by tests and
//! demos: it simulates a world's ranks as concurrent tasks inside a single
//! process rather than opening real sockets, which keeps this crate from
//! having to invent a new wire protocol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::TransportError;
use crate::store::RendezvousStore;
use crate::tensor::{reduce_all, ReduceOp, Tensor};
use crate::world::{Backend, Rank};

/// A handle to an in-flight transport operation, returned immediately by
/// every [`Transport`] method so the communicator can busy-await it instead
/// of blocking the calling OS thread for the operation's full duration
/// (spec §6 execution model).
pub trait WorkHandle: Send {
    fn is_completed(&mut self) -> bool;
    /// Blocks the calling thread until the operation finishes, returning
    /// its outcome. Only ever called from inside a `spawn_blocking` task.
    fn wait(&mut self) -> Result<(), TransportError>;
}

/// A [`WorkHandle`] for operations that finish synchronously inside the
/// `Transport` call that created them (every collective, and `isend`).
pub struct CompletedWork(Result<(), TransportError>);

impl CompletedWork {
    pub fn ok() -> Box<dyn WorkHandle> {
        Box::new(Self(Ok(())))
    }
}

impl WorkHandle for CompletedWork {
    fn is_completed(&mut self) -> bool {
        true
    }

    fn wait(&mut self) -> Result<(), TransportError> {
        self.0.clone()
    }
}

/// Parameters passed to [`Transport::init_process_group`] (spec §4.1).
pub struct ProcessGroupInit {
    pub world_name: String,
    pub rank: Rank,
    pub size: usize,
    pub backend: Backend,
    pub store: Arc<dyn RendezvousStore>,
}

/// The external collective-communication library's contract. Every data-
/// moving method is synchronous from the caller's perspective (it may block
/// the calling thread while it submits the operation) but returns a
/// [`WorkHandle`] rather than the operation's result, so completion can be
/// observed without holding that thread hostage for the duration of a slow
/// or wedged peer.
pub trait Transport: Send + Sync {
    fn init_process_group(&self, init: ProcessGroupInit) -> Result<(), TransportError>;

    /// Tears down a world's process group. Implementations should treat
    /// this as best-effort cleanup: by the time it's called the world may
    /// already be broken, and a transport that can't reach peers to
    /// coordinate a clean teardown should still return `Ok`.
    fn destroy_process_group(&self, world_name: &str) -> Result<(), TransportError>;

    fn isend(
        &self,
        world_name: &str,
        tensor: &Tensor,
        dst: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    fn irecv(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        src: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    /// Blocking point-to-point send: does not return until the peer has
    /// taken delivery. Used instead of `isend` for a world initialized with
    /// [`crate::world::Backend::CpuCollective`] (spec §6 "blocking
    /// `send`/`recv` variants").
    fn send(&self, world_name: &str, tensor: &Tensor, dst: Rank) -> Result<(), TransportError>;

    /// Blocking point-to-point receive, the `recv` counterpart to `send`.
    fn recv(&self, world_name: &str, tensor: &mut Tensor, src: Rank) -> Result<(), TransportError>;

    fn broadcast(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    fn all_reduce(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        op: ReduceOp,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    fn reduce(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        op: ReduceOp,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    fn all_gather(
        &self,
        world_name: &str,
        output: &mut [Tensor],
        input: &Tensor,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    fn gather(
        &self,
        world_name: &str,
        output: Option<&mut [Tensor]>,
        input: &Tensor,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;

    fn scatter(
        &self,
        world_name: &str,
        output: &mut Tensor,
        input: Option<&[Tensor]>,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError>;
}

/// A raw pointer wrapper that lets a [`PendingRecv`] write into a caller-
/// owned buffer once data arrives, the same way a real transport's receive
/// handle writes into a pre-registered destination buffer (DMA-style)
/// without the caller handing over ownership.
///
/// Safety: the constructor requires the pointee to outlive the handle,
/// which [`crate::communicator::WorldCommunicator`] upholds by keeping the
/// destination `Tensor` borrowed for the handle's entire `wait`/
/// `is_completed` lifetime.
struct SendPtr<T>(*mut T);

unsafe impl<T> Send for SendPtr<T> {}

/// One rank's point-to-point inbox: pending sends keyed by source rank,
/// delivered in order.
#[derive(Default)]
struct Mailbox {
    inbound: Mutex<std::collections::HashMap<Rank, VecDeque<Tensor>>>,
}

impl Mailbox {
    fn deliver(&self, src: Rank, tensor: Tensor) {
        self.inbound
            .lock()
            .unwrap()
            .entry(src)
            .or_default()
            .push_back(tensor);
    }

    fn try_take(&self, src: Rank) -> Option<Tensor> {
        self.inbound.lock().unwrap().get_mut(&src)?.pop_front()
    }
}

/// A value exchanged during a collective rendezvous: either one rank's
/// tensor, several ranks' tensors (for gather-shaped ops), or nothing (a
/// non-root's contribution to a rooted op).
#[derive(Clone)]
enum Payload {
    One(Tensor),
    Many(Vec<Tensor>),
    None,
}

impl Payload {
    fn into_one(self) -> Tensor {
        match self {
            Payload::One(t) => t,
            _ => panic!("collective rendezvous: expected a single tensor payload"),
        }
    }

    fn into_many(self) -> Vec<Tensor> {
        match self {
            Payload::Many(ts) => ts,
            _ => panic!("collective rendezvous: expected a multi-tensor payload"),
        }
    }
}

/// A reusable all-to-one-to-all barrier: every rank submits a contribution
/// and blocks until every other rank has too, at which point the last
/// arriver combines them and every rank (including the combiner) wakes with
/// the same result. Generation-counted so the round can be reused by the
/// next collective call.
struct CollectiveRound {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
}

struct RoundState {
    generation: u64,
    arrived: usize,
    contributions: Vec<Option<Payload>>,
    result: Option<Payload>,
}

impl CollectiveRound {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(RoundState {
                generation: 0,
                arrived: 0,
                contributions: vec![None; size],
                result: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until all `size` ranks have called `rendezvous` for the
    /// current generation, then returns the combined result to every
    /// caller. `combine` is only invoked by whichever rank happens to
    /// arrive last; every rank must pass logically-equivalent combine
    /// behavior for a given collective call.
    fn rendezvous(
        &self,
        rank: Rank,
        contribution: Payload,
        combine: impl FnOnce(Vec<Payload>) -> Payload,
    ) -> Payload {
        let mut state = self.state.lock().unwrap();
        let my_generation = state.generation;
        state.contributions[rank as usize] = Some(contribution);
        state.arrived += 1;
        if state.arrived == self.size {
            let all = state
                .contributions
                .iter_mut()
                .map(|slot| slot.take().unwrap())
                .collect();
            let result = combine(all);
            state.result = Some(result);
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
        } else {
            while state.generation == my_generation {
                state = self.cv.wait(state).unwrap();
            }
        }
        state.result.clone().unwrap()
    }
}

struct LoopbackWorld {
    size: usize,
    mailboxes: Vec<Mailbox>,
    round: CollectiveRound,
}

/// Shared simulated network: every rank's [`LoopbackTransport`] handle
/// points at the same registry of worlds, the way real processes on
/// distinct hosts share one logical network.
#[derive(Default)]
pub struct LoopbackNetwork {
    worlds: Mutex<std::collections::HashMap<String, Arc<LoopbackWorld>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the [`Transport`] this simulated rank should use. Real
    /// transports don't need this indirection (a process only ever has one
    /// rank); it exists purely so tests can run a whole world's worth of
    /// ranks inside a single process.
    pub fn handle_for_rank(self: &Arc<Self>, rank: Rank) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            rank,
        }
    }

    fn world(&self, world_name: &str) -> Result<Arc<LoopbackWorld>, TransportError> {
        self.worlds
            .lock()
            .unwrap()
            .get(world_name)
            .cloned()
            .ok_or_else(|| TransportError::Fault(format!("unknown world {world_name}")))
    }
}

/// Reference [`Transport`]: one simulated rank's view of a
/// [`LoopbackNetwork`]. Used by this crate's own test suite and demos,
/// never by production code, which is expected to supply a real collective
/// library binding.
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    rank: Rank,
}

impl Transport for LoopbackTransport {
    fn init_process_group(&self, init: ProcessGroupInit) -> Result<(), TransportError> {
        let mut worlds = self.network.worlds.lock().unwrap();
        let world = worlds
            .entry(init.world_name.clone())
            .or_insert_with(|| {
                Arc::new(LoopbackWorld {
                    size: init.size,
                    mailboxes: (0..init.size).map(|_| Mailbox::default()).collect(),
                    round: CollectiveRound::new(init.size),
                })
            });
        if world.size != init.size {
            return Err(TransportError::InitFailed(format!(
                "world {} size mismatch: already {} but rank {} joined with {}",
                init.world_name, world.size, init.rank, init.size
            )));
        }
        Ok(())
    }

    fn destroy_process_group(&self, world_name: &str) -> Result<(), TransportError> {
        self.network.worlds.lock().unwrap().remove(world_name);
        Ok(())
    }

    fn isend(
        &self,
        world_name: &str,
        tensor: &Tensor,
        dst: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let mailbox = world
            .mailboxes
            .get(dst as usize)
            .ok_or_else(|| TransportError::Fault(format!("no such rank {dst}")))?;
        // Delivery happens eagerly: a real transport would buffer the
        // payload in its own send queue, which this stands in for.
        mailbox.deliver(self.rank, tensor.clone());
        Ok(CompletedWork::ok())
    }

    fn irecv(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        src: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        Ok(Box::new(PendingRecv {
            world,
            own_rank: self.rank,
            src,
            dst: SendPtr(tensor as *mut Tensor),
            completed: AtomicBool::new(false),
        }))
    }

    fn send(&self, world_name: &str, tensor: &Tensor, dst: Rank) -> Result<(), TransportError> {
        let mut handle = self.isend(world_name, tensor, dst)?;
        handle.wait()
    }

    fn recv(&self, world_name: &str, tensor: &mut Tensor, src: Rank) -> Result<(), TransportError> {
        let mut handle = self.irecv(world_name, tensor, src)?;
        handle.wait()
    }

    fn broadcast(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let contribution = Payload::One(tensor.clone());
        let result = world.round.rendezvous(self.rank, contribution, move |all| {
            all.into_iter()
                .nth(root as usize)
                .expect("root contribution present")
        });
        *tensor = result.into_one();
        Ok(CompletedWork::ok())
    }

    fn all_reduce(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        op: ReduceOp,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let contribution = Payload::One(tensor.clone());
        let result = world.round.rendezvous(self.rank, contribution, move |all| {
            let tensors: Vec<Tensor> = all.into_iter().map(Payload::into_one).collect();
            Payload::One(reduce_all(op, &tensors))
        });
        *tensor = result.into_one();
        Ok(CompletedWork::ok())
    }

    fn reduce(
        &self,
        world_name: &str,
        tensor: &mut Tensor,
        op: ReduceOp,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let contribution = Payload::One(tensor.clone());
        let result = world.round.rendezvous(self.rank, contribution, move |all| {
            let tensors: Vec<Tensor> = all.into_iter().map(Payload::into_one).collect();
            Payload::One(reduce_all(op, &tensors))
        });
        // Only the root's buffer is defined to hold the reduction; other
        // ranks keep whatever they contributed, matching the usual
        // collective-library contract for a rooted reduce.
        if self.rank == root {
            *tensor = result.into_one();
        }
        Ok(CompletedWork::ok())
    }

    fn all_gather(
        &self,
        world_name: &str,
        output: &mut [Tensor],
        input: &Tensor,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let contribution = Payload::One(input.clone());
        let result = world
            .round
            .rendezvous(self.rank, contribution, |all| {
                Payload::Many(all.into_iter().map(Payload::into_one).collect())
            });
        let gathered = result.into_many();
        if gathered.len() != output.len() {
            return Err(TransportError::Fault(format!(
                "all_gather: output has {} slots but world has {} ranks",
                output.len(),
                gathered.len()
            )));
        }
        for (slot, tensor) in output.iter_mut().zip(gathered) {
            *slot = tensor;
        }
        Ok(CompletedWork::ok())
    }

    fn gather(
        &self,
        world_name: &str,
        output: Option<&mut [Tensor]>,
        input: &Tensor,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let contribution = Payload::One(input.clone());
        let result = world
            .round
            .rendezvous(self.rank, contribution, |all| {
                Payload::Many(all.into_iter().map(Payload::into_one).collect())
            });
        if let Some(output) = output {
            let gathered = result.into_many();
            if gathered.len() != output.len() {
                return Err(TransportError::Fault(format!(
                    "gather: output has {} slots but world has {} ranks",
                    output.len(),
                    gathered.len()
                )));
            }
            for (slot, tensor) in output.iter_mut().zip(gathered) {
                *slot = tensor;
            }
        }
        let _ = root;
        Ok(CompletedWork::ok())
    }

    fn scatter(
        &self,
        world_name: &str,
        output: &mut Tensor,
        input: Option<&[Tensor]>,
        root: Rank,
    ) -> Result<Box<dyn WorkHandle>, TransportError> {
        let world = self.network.world(world_name)?;
        let size = world.size;
        let contribution = match input {
            Some(chunks) => Payload::Many(chunks.to_vec()),
            None => Payload::None,
        };
        let result = world.round.rendezvous(self.rank, contribution, move |all| {
            let chunks = all
                .into_iter()
                .find_map(|payload| match payload {
                    Payload::Many(chunks) => Some(chunks),
                    _ => None,
                })
                .unwrap_or_else(|| vec![Tensor::zeros(0); size]);
            Payload::Many(chunks)
        });
        let mut chunks = result.into_many();
        if chunks.len() != size {
            return Err(TransportError::Fault(format!(
                "scatter: root provided {} chunks for {} ranks",
                chunks.len(),
                size
            )));
        }
        *output = chunks.swap_remove(self.rank as usize);
        Ok(CompletedWork::ok())
    }
}

struct PendingRecv {
    world: Arc<LoopbackWorld>,
    own_rank: Rank,
    src: Rank,
    dst: SendPtr<Tensor>,
    completed: AtomicBool,
}

impl WorkHandle for PendingRecv {
    fn is_completed(&mut self) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return true;
        }
        let mailbox = match self.world.mailboxes.get(self.own_rank as usize) {
            Some(mailbox) => mailbox,
            None => return false,
        };
        match mailbox.try_take(self.src) {
            Some(tensor) => {
                // Safety: the pointee outlives this handle per the
                // `SendPtr` contract documented above.
                unsafe {
                    *self.dst.0 = tensor;
                }
                self.completed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn wait(&mut self) -> Result<(), TransportError> {
        while !self.is_completed() {
            std::thread::yield_now();
        }
        Ok(())
    }
}
