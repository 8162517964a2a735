//! The asynchronous façade that converts the transport's blocking
//! collective primitives into cancelable, awaitable operations and enforces
//! per-world failure semantics (spec §4.2).

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::ManagerConfig;
use crate::error::{CoreError, TransportError};
use crate::tensor::{ReduceOp, Tensor};
use crate::transport::{CompletedWork, Transport, WorkHandle};
use crate::world::{Backend, Rank, World, WorldRegistry, WorldState};
use crate::DEFAULT_WORLD_NAME;

/// Submits a point-to-point send under `w.backend`'s convention: `isend`
/// for [`Backend::GpuCollective`] (a real async handle to busy-await), the
/// blocking `send` for [`Backend::CpuCollective`] (wrapped in an
/// already-complete handle so it still flows through the same busy-await
/// loop as the async path — see SPEC_FULL.md §B3).
fn dispatch_send(
    transport: &Arc<dyn Transport>,
    world_name: &str,
    tensor: &Tensor,
    dst: Rank,
    backend: Backend,
) -> Result<Box<dyn WorkHandle>, TransportError> {
    match backend {
        Backend::GpuCollective => transport.isend(world_name, tensor, dst),
        Backend::CpuCollective => transport.send(world_name, tensor, dst).map(|()| CompletedWork::ok()),
    }
}

/// The `recv` counterpart to [`dispatch_send`].
fn dispatch_recv(
    transport: &Arc<dyn Transport>,
    world_name: &str,
    tensor: &mut Tensor,
    src: Rank,
    backend: Backend,
) -> Result<Box<dyn WorkHandle>, TransportError> {
    match backend {
        Backend::GpuCollective => transport.irecv(world_name, tensor, src),
        Backend::CpuCollective => transport.recv(world_name, tensor, src).map(|()| CompletedWork::ok()),
    }
}

/// Async wrapper over a [`Transport`]: every method submits a blocking
/// transport call to a worker thread, then busy-awaits the resulting
/// [`WorkHandle`] while also watching the world's liveness (spec §4.2
/// "Execution model").
pub struct WorldCommunicator {
    registry: Arc<WorldRegistry>,
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    removal_tx: mpsc::Sender<String>,
}

impl WorldCommunicator {
    pub fn new(
        registry: Arc<WorldRegistry>,
        transport: Arc<dyn Transport>,
        config: ManagerConfig,
        removal_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            removal_tx,
        }
    }

    /// Read-only liveness check (supplemented feature: spec.md is silent on
    /// it, the original implementation exposes it). An unknown world is
    /// reported broken, matching [`WorldRegistry::is_broken`].
    pub fn is_broken(&self, world: Option<&str>) -> bool {
        self.registry.is_broken(world.unwrap_or(DEFAULT_WORLD_NAME))
    }

    fn resolve(&self, world: Option<&str>) -> Result<Arc<World>, CoreError> {
        let name = world.unwrap_or(DEFAULT_WORLD_NAME);
        let world = self
            .registry
            .get(name)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown world {name}")))?;
        if matches!(world.state.get(), WorldState::Broken | WorldState::Removed) {
            return Err(CoreError::BrokenWorld {
                name: name.to_string(),
                reason: "world already broken".to_string(),
            });
        }
        Ok(world)
    }

    fn check_rank(world: &World, rank: Rank, label: &str) -> Result<(), CoreError> {
        if rank < 0 || rank as usize >= world.size {
            return Err(CoreError::InvalidArgument(format!(
                "{label} rank {rank} out of bounds for world {} of size {}",
                world.name, world.size
            )));
        }
        Ok(())
    }

    /// Classifies a transport fault per spec §7: a classified substring
    /// marks the world broken (locally, immediately) and asks the Manager
    /// to remove it; anything else propagates unchanged.
    async fn classify(&self, world_name: &str, err: TransportError) -> CoreError {
        let message = err.to_string();
        if self.config.matches_classified_fault(&message) {
            if let Some(world) = self.registry.get(world_name) {
                world.state.mark_broken();
            }
            if self.removal_tx.send(world_name.to_string()).await.is_err() {
                warn!(world = world_name, "removal channel closed; world left registered but broken");
            }
            CoreError::BrokenWorld {
                name: world_name.to_string(),
                reason: message,
            }
        } else {
            CoreError::Fatal(err)
        }
    }

    /// Busy-awaits `handle`, yielding to the scheduler between completion
    /// checks and also watching `world_name`'s liveness so a world the
    /// Watchdog just broke releases the awaiter promptly even if the
    /// transport call itself never completes (spec §4.2 step 3).
    async fn drive(&self, world_name: &str, mut handle: Box<dyn WorkHandle>) -> Result<(), CoreError> {
        loop {
            if handle.is_completed() {
                return match handle.wait() {
                    Ok(()) => Ok(()),
                    Err(err) => Err(self.classify(world_name, err).await),
                };
            }
            if self.registry.is_broken(world_name) {
                return Err(CoreError::BrokenWorld {
                    name: world_name.to_string(),
                    reason: "watchdog observed failure".to_string(),
                });
            }
            tokio::task::yield_now().await;
        }
    }

    /// Submits a transport call on the worker-thread pool and drives its
    /// `WorkHandle` to completion. `submit` must be `Send + 'static` and
    /// contain no borrows of `self`.
    ///
    /// The submission itself is raced against the world's broken flag, not
    /// just awaited outright: for `Backend::CpuCollective`'s blocking
    /// `send`/`recv` path, `submit` *is* the call that blocks until the
    /// peer takes delivery, with no `WorkHandle` to poll until it returns.
    /// If the world breaks while that call is still running on its worker
    /// thread, the cooperative awaiter is released with `BrokenWorld`
    /// without waiting for the thread to unwind (spec §5: "that thread is
    /// left to drain... but the awaiter is released with `BrokenWorld`
    /// once the Watchdog notices").
    async fn submit_and_drive<F>(&self, world_name: &str, submit: F) -> Result<(), CoreError>
    where
        F: FnOnce() -> Result<Box<dyn WorkHandle>, TransportError> + Send + 'static,
    {
        let join = tokio::task::spawn_blocking(submit);
        tokio::pin!(join);
        loop {
            tokio::select! {
                result = &mut join => {
                    let submitted = result.expect("transport submission task panicked");
                    return match submitted {
                        Ok(handle) => self.drive(world_name, handle).await,
                        Err(err) => Err(self.classify(world_name, err).await),
                    };
                }
                _ = tokio::task::yield_now() => {
                    if self.registry.is_broken(world_name) {
                        return Err(CoreError::BrokenWorld {
                            name: world_name.to_string(),
                            reason: "watchdog observed failure during transport submission".to_string(),
                        });
                    }
                }
            }
        }
    }

    pub async fn send(&self, tensor: &Tensor, dst: Rank, world: Option<&str>) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        Self::check_rank(&w, dst, "send")?;
        let transport = self.transport.clone();
        let world_name = w.name.clone();
        let tensor = tensor.clone();
        let submit_name = world_name.clone();
        let backend = w.backend;
        self.submit_and_drive(&world_name, move || {
            dispatch_send(&transport, &submit_name, &tensor, dst, backend)
        })
        .await
    }

    pub async fn recv(&self, tensor: &mut Tensor, src: Rank, world: Option<&str>) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        Self::check_rank(&w, src, "recv")?;
        let transport = self.transport.clone();
        let world_name = w.name.clone();
        let submit_name = world_name.clone();
        let backend = w.backend;

        // `irecv`/`recv` write into the destination buffer through the
        // handle rather than returning it, so the handle must be driven to
        // completion before this function can hand `tensor` back to the
        // caller. We submit synchronously under `spawn_blocking` (the
        // submission itself is cheap; the transport defers the actual
        // wait to the handle) and then busy-await as usual.
        let mut owned = std::mem::replace(tensor, Tensor::zeros(0));
        let result = self
            .recv_into(&world_name, &submit_name, src, &mut owned, transport, backend)
            .await;
        *tensor = owned;
        result
    }

    async fn recv_into(
        &self,
        world_name: &str,
        submit_name: &str,
        src: Rank,
        tensor: &mut Tensor,
        transport: Arc<dyn Transport>,
        backend: Backend,
    ) -> Result<(), CoreError> {
        // SAFETY-adjacent: `irecv`/`recv` take `&mut Tensor` directly rather
        // than through a raw pointer because the submission and the
        // busy-await both happen before this function returns, so
        // `tensor`'s borrow remains valid for the handle's entire lifetime.
        // This differs from `LoopbackTransport::irecv`'s own internal use
        // of a raw pointer, which exists to cross the `spawn_blocking`
        // boundary; we avoid that here by dispatching directly rather than
        // via `spawn_blocking`, since the call itself is expected to be
        // non-blocking for the async path (it returns a handle immediately)
        // even though the trait allows a real implementation to block
        // briefly while registering the receive.
        let submit_name = submit_name.to_string();
        let world_name_owned = world_name.to_string();
        let ptr = tensor as *mut Tensor;
        struct SendableTensorPtr(*mut Tensor);
        unsafe impl Send for SendableTensorPtr {}
        let wrapped = SendableTensorPtr(ptr);

        let join = tokio::task::spawn_blocking(move || {
            let wrapped = wrapped;
            // SAFETY: `recv_into`'s caller keeps `tensor` alive and
            // unaliased until this function returns.
            let tensor_ref = unsafe { &mut *wrapped.0 };
            dispatch_recv(&transport, &submit_name, tensor_ref, src, backend)
        });
        tokio::pin!(join);

        // Raced against the broken-world flag rather than awaited outright:
        // for `Backend::CpuCollective`, `dispatch_recv` blocks inside this
        // submission until the peer sends, with no `WorkHandle` to poll in
        // the meantime. If the watchdog marks the world broken first, the
        // caller is released immediately and the blocked worker thread is
        // left to drain on its own (spec §5).
        loop {
            tokio::select! {
                result = &mut join => {
                    let submitted = result.expect("irecv submission task panicked");
                    return match submitted {
                        Ok(handle) => self.drive(&world_name_owned, handle).await,
                        Err(err) => Err(self.classify(&world_name_owned, err).await),
                    };
                }
                _ = tokio::task::yield_now() => {
                    if self.registry.is_broken(&world_name_owned) {
                        return Err(CoreError::BrokenWorld {
                            name: world_name_owned.clone(),
                            reason: "watchdog observed failure during transport submission".to_string(),
                        });
                    }
                }
            }
        }
    }

    pub async fn broadcast(&self, tensor: &mut Tensor, src: Rank, world: Option<&str>) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        Self::check_rank(&w, src, "broadcast")?;
        self.mutate(&w, tensor, move |transport, name, t| transport.broadcast(name, t, src))
            .await
    }

    pub async fn all_reduce(&self, tensor: &mut Tensor, op: ReduceOp, world: Option<&str>) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        self.mutate(&w, tensor, move |transport, name, t| transport.all_reduce(name, t, op))
            .await
    }

    pub async fn reduce(
        &self,
        tensor: &mut Tensor,
        dst: Rank,
        op: ReduceOp,
        world: Option<&str>,
    ) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        Self::check_rank(&w, dst, "reduce")?;
        self.mutate(&w, tensor, move |transport, name, t| transport.reduce(name, t, op, dst))
            .await
    }

    pub async fn all_gather(
        &self,
        out_list: &mut [Tensor],
        tensor: &Tensor,
        world: Option<&str>,
    ) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        if out_list.len() != w.size {
            return Err(CoreError::InvalidArgument(format!(
                "all_gather: out_list has {} slots but world {} has size {}",
                out_list.len(),
                w.name,
                w.size
            )));
        }
        let transport = self.transport.clone();
        let world_name = w.name.clone();
        let submit_name = world_name.clone();
        let input = tensor.clone();
        let mut owned_out: Vec<Tensor> = out_list.to_vec();

        let ptr = SendableSlicePtr(owned_out.as_mut_slice() as *mut [Tensor]);
        let submitted = tokio::task::spawn_blocking(move || {
            let ptr = ptr;
            // SAFETY: `owned_out` outlives this closure; the blocking task
            // runs to completion before `submit_and_drive`'s caller
            // observes `owned_out` again.
            let slice = unsafe { &mut *ptr.0 };
            transport.all_gather(&submit_name, slice, &input)
        })
        .await
        .expect("all_gather submission task panicked");

        let result = match submitted {
            Ok(handle) => self.drive(&world_name, handle).await,
            Err(err) => Err(self.classify(&world_name, err).await),
        };
        out_list.clone_from_slice(&owned_out);
        result
    }

    pub async fn gather(
        &self,
        tensor: &Tensor,
        out_list: Option<&mut [Tensor]>,
        dst: Rank,
        world: Option<&str>,
    ) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        Self::check_rank(&w, dst, "gather")?;
        let is_root = w.local_rank == dst;
        if is_root && out_list.is_none() {
            return Err(CoreError::InvalidArgument(format!(
                "gather: root rank {dst} of world {} requires an out_list",
                w.name
            )));
        }
        if let Some(ref out) = out_list {
            if out.len() != w.size {
                return Err(CoreError::InvalidArgument(format!(
                    "gather: out_list has {} slots but world {} has size {}",
                    out.len(),
                    w.name,
                    w.size
                )));
            }
        }

        let transport = self.transport.clone();
        let world_name = w.name.clone();
        let submit_name = world_name.clone();
        let input = tensor.clone();

        match out_list {
            Some(out_list) => {
                let mut owned_out: Vec<Tensor> = out_list.to_vec();
                let ptr = SendableSlicePtr(owned_out.as_mut_slice() as *mut [Tensor]);
                let submitted = tokio::task::spawn_blocking(move || {
                    let ptr = ptr;
                    // SAFETY: see `all_gather`.
                    let slice = unsafe { &mut *ptr.0 };
                    transport.gather(&submit_name, Some(slice), &input, dst)
                })
                .await
                .expect("gather submission task panicked");
                let result = match submitted {
                    Ok(handle) => self.drive(&world_name, handle).await,
                    Err(err) => Err(self.classify(&world_name, err).await),
                };
                out_list.clone_from_slice(&owned_out);
                result
            }
            None => {
                let submitted = tokio::task::spawn_blocking(move || transport.gather(&submit_name, None, &input, dst))
                    .await
                    .expect("gather submission task panicked");
                match submitted {
                    Ok(handle) => self.drive(&world_name, handle).await,
                    Err(err) => Err(self.classify(&world_name, err).await),
                }
            }
        }
    }

    pub async fn scatter(
        &self,
        tensor: &mut Tensor,
        in_list: Option<&[Tensor]>,
        src: Rank,
        world: Option<&str>,
    ) -> Result<(), CoreError> {
        let w = self.resolve(world)?;
        Self::check_rank(&w, src, "scatter")?;
        let is_root = w.local_rank == src;
        if is_root && in_list.is_none() {
            return Err(CoreError::InvalidArgument(format!(
                "scatter: source rank {src} of world {} requires an in_list",
                w.name
            )));
        }

        let transport = self.transport.clone();
        let world_name = w.name.clone();
        let submit_name = world_name.clone();
        let input = in_list.map(|chunks| chunks.to_vec());
        let mut owned = std::mem::replace(tensor, Tensor::zeros(0));
        let ptr = SendablePtr(&mut owned as *mut Tensor);

        let submitted = tokio::task::spawn_blocking(move || {
            let ptr = ptr;
            // SAFETY: `owned` is kept alive on this task's stack via the
            // outer `spawn_blocking` closure's capture until the awaited
            // join completes.
            let out_ref = unsafe { &mut *ptr.0 };
            transport.scatter(&submit_name, out_ref, input.as_deref(), src)
        })
        .await
        .expect("scatter submission task panicked");

        let result = match submitted {
            Ok(handle) => self.drive(&world_name, handle).await,
            Err(err) => Err(self.classify(&world_name, err).await),
        };
        *tensor = owned;
        result
    }

    /// Shared submit/drive path for the in-place collectives (broadcast,
    /// all_reduce, reduce) that take one mutable buffer.
    async fn mutate<F>(&self, w: &World, tensor: &mut Tensor, call: F) -> Result<(), CoreError>
    where
        F: FnOnce(&Arc<dyn Transport>, &str, &mut Tensor) -> Result<Box<dyn WorkHandle>, TransportError>
            + Send
            + 'static,
    {
        let transport = self.transport.clone();
        let world_name = w.name.clone();
        let submit_name = world_name.clone();
        let mut owned = std::mem::replace(tensor, Tensor::zeros(0));

        let submitted = tokio::task::spawn_blocking(move || call(&transport, &submit_name, &mut owned).map(|h| (h, owned)))
            .await
            .expect("collective submission task panicked");

        match submitted {
            Ok((handle, result_tensor)) => {
                let outcome = self.drive(&world_name, handle).await;
                *tensor = result_tensor;
                outcome
            }
            Err(err) => Err(self.classify(&world_name, err).await),
        }
    }
}

/// A raw pointer wrapper allowing a caller-owned slice to cross the
/// `spawn_blocking` boundary without cloning it twice; mirrors
/// [`crate::transport`]'s own `SendPtr` used for `irecv`.
struct SendableSlicePtr(*mut [Tensor]);
unsafe impl Send for SendableSlicePtr {}

struct SendablePtr(*mut Tensor);
unsafe impl Send for SendablePtr {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::WorldManager;
    use crate::store::InProcessStoreFactory;
    use crate::transport::LoopbackNetwork;
    use crate::world::Backend;

    async fn make_pair(
        size: usize,
    ) -> (
        Arc<WorldManager>,
        Vec<WorldCommunicator>,
        crossbeam_channel::Sender<()>,
    ) {
        let network = LoopbackNetwork::new();
        let store_factory = Arc::new(InProcessStoreFactory::new());
        let mut managers = Vec::new();
        let mut comms = Vec::new();
        let mut cancels = Vec::new();
        for rank in 0..size {
            let transport = Arc::new(network.handle_for_rank(rank as Rank));
            let build = WorldManager::build(
                ManagerConfig::default(),
                crate::config::WatchdogConfig::default(),
                store_factory.clone(),
                transport.clone(),
            );
            build
                .manager
                .initialize_world("w", rank as Rank, size, Backend::CpuCollective, "host", 1)
                .await
                .unwrap();
            let comm = WorldCommunicator::new(
                build.manager.registry(),
                transport,
                ManagerConfig::default(),
                build.removal_tx.clone(),
            );
            comms.push(comm);
            managers.push(build.manager);
            cancels.push(build.watchdog_cancel);
        }
        (managers.into_iter().next().unwrap(), comms, cancels.into_iter().next().unwrap())
    }

    #[tokio::test]
    async fn all_reduce_sum_across_three_ranks() {
        let (_manager, comms, _cancel) = make_pair(3).await;
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(tokio::spawn(async move {
                let mut tensor = Tensor::new(vec![1.0, 1.0, 1.0, 1.0]);
                comm.all_reduce(&mut tensor, ReduceOp::Sum, Some("w")).await.unwrap();
                tensor
            }));
        }
        for handle in handles {
            let tensor = handle.await.unwrap();
            assert_eq!(tensor.as_slice(), &[3.0, 3.0, 3.0, 3.0]);
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_source_value_to_every_rank() {
        let (_manager, comms, _cancel) = make_pair(3).await;
        let mut handles = Vec::new();
        for (rank, comm) in comms.into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                let mut tensor = if rank == 1 {
                    Tensor::new(vec![7.0, 7.0])
                } else {
                    Tensor::zeros(2)
                };
                comm.broadcast(&mut tensor, 1, Some("w")).await.unwrap();
                tensor
            }));
        }
        for handle in handles {
            let tensor = handle.await.unwrap();
            assert_eq!(tensor.as_slice(), &[7.0, 7.0]);
        }
    }

    #[tokio::test]
    async fn unknown_world_is_invalid_argument() {
        let (_manager, comms, _cancel) = make_pair(1).await;
        let mut tensor = Tensor::zeros(1);
        let err = comms[0]
            .broadcast(&mut tensor, 0, Some("nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn out_of_range_rank_is_invalid_argument() {
        let (_manager, comms, _cancel) = make_pair(1).await;
        let mut tensor = Tensor::zeros(1);
        let err = comms[0].broadcast(&mut tensor, 5, Some("w")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn gather_without_list_at_root_is_invalid_argument() {
        let (_manager, comms, _cancel) = make_pair(1).await;
        let tensor = Tensor::zeros(1);
        let err = comms[0].gather(&tensor, None, 0, Some("w")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn broken_world_rejects_is_broken_query() {
        let (manager, comms, _cancel) = make_pair(1).await;
        assert!(!comms[0].is_broken(Some("w")));
        manager.remove_world("w").await.unwrap();
        assert!(comms[0].is_broken(Some("w")));
    }
}
