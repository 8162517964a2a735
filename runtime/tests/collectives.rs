//! Round-trip and boundary properties from spec.md §8: broadcast, all_reduce,
//! reduce, scatter/all_gather round-trips, and the size-1 world boundary
//! case. Scenario 4 (broadcast source rotation) and an abbreviated form of
//! scenario 1 (two worlds, concurrent all-reduce) are exercised directly.

use std::sync::Arc;

use multiworld_runtime::communicator::WorldCommunicator;
use multiworld_runtime::config::{ManagerConfig, WatchdogConfig};
use multiworld_runtime::manager::WorldManager;
use multiworld_runtime::store::InProcessStoreFactory;
use multiworld_runtime::tensor::{ReduceOp, Tensor};
use multiworld_runtime::transport::LoopbackNetwork;
use multiworld_runtime::world::{Backend, Rank};

/// Builds one world of `size` ranks sharing a loopback network, returning
/// each rank's communicator alongside its owning manager (kept alive so the
/// world isn't torn down mid-test).
async fn build_world(world_name: &str, size: usize) -> Vec<(Rank, Arc<WorldCommunicator>, Arc<WorldManager>)> {
    let network = LoopbackNetwork::new();
    let store_factory = Arc::new(InProcessStoreFactory::new());
    let mut ranks = Vec::new();
    for rank in 0..size as Rank {
        let transport = Arc::new(network.handle_for_rank(rank));
        let build = WorldManager::build(
            ManagerConfig::default(),
            WatchdogConfig::default(),
            store_factory.clone(),
            transport.clone(),
        );
        build
            .manager
            .initialize_world(world_name, rank, size, Backend::CpuCollective, "127.0.0.1", 1)
            .await
            .unwrap();
        let communicator = Arc::new(WorldCommunicator::new(
            build.manager.registry(),
            transport,
            ManagerConfig::default(),
            build.removal_tx,
        ));
        ranks.push((rank, communicator, build.manager));
    }
    ranks
}

#[tokio::test]
async fn all_reduce_sum_matches_across_many_rounds() {
    let ranks = build_world("ar", 3).await;
    let mut handles = Vec::new();
    for (_, comm, _manager) in ranks {
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                let mut tensor = Tensor::new(vec![1.0; 4]);
                comm.all_reduce(&mut tensor, ReduceOp::Sum, Some("ar")).await.unwrap();
                assert_eq!(tensor.as_slice(), &[3.0, 3.0, 3.0, 3.0]);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Scenario 1, abbreviated: two independent worlds running all-reduce
/// concurrently never interfere with one another.
#[tokio::test]
async fn two_worlds_all_reduce_concurrently_without_interference() {
    let world1 = build_world("world1", 3).await;
    let world2 = build_world("world2", 3).await;
    let mut handles = Vec::new();
    for (_, comm, _manager) in world1 {
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                let mut tensor = Tensor::new(vec![1.0; 4]);
                comm.all_reduce(&mut tensor, ReduceOp::Sum, Some("world1")).await.unwrap();
                assert_eq!(tensor.as_slice(), &[3.0, 3.0, 3.0, 3.0]);
            }
        }));
    }
    for (_, comm, _manager) in world2 {
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                let mut tensor = Tensor::new(vec![1.0; 4]);
                comm.all_reduce(&mut tensor, ReduceOp::Sum, Some("world2")).await.unwrap();
                assert_eq!(tensor.as_slice(), &[3.0, 3.0, 3.0, 3.0]);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Scenario 4: over 3 iterations with `src = step mod 3`, every rank
/// broadcasts a distinct tensor and every other rank must observe it.
#[tokio::test]
async fn broadcast_source_rotation() {
    let ranks = build_world("bcast", 3).await;
    for step in 0..3i32 {
        let src = step % 3;
        let expected = (src + 1) as f32;
        let mut handles = Vec::new();
        for (rank, comm, _manager) in &ranks {
            let rank = *rank;
            let comm = comm.clone();
            handles.push(tokio::spawn(async move {
                let mut tensor = if rank == src {
                    Tensor::new(vec![expected; 2])
                } else {
                    Tensor::zeros(2)
                };
                comm.broadcast(&mut tensor, src, Some("bcast")).await.unwrap();
                tensor
            }));
        }
        for handle in handles {
            let tensor = handle.await.unwrap();
            assert_eq!(tensor.as_slice(), &[expected, expected]);
        }
    }
}

#[tokio::test]
async fn reduce_sum_lands_only_at_root() {
    let ranks = build_world("reduce", 3).await;
    let mut handles = Vec::new();
    for (rank, comm, _manager) in ranks {
        handles.push(tokio::spawn(async move {
            let mut tensor = Tensor::new(vec![(rank + 1) as f32; 2]);
            comm.reduce(&mut tensor, 0, ReduceOp::Sum, Some("reduce")).await.unwrap();
            (rank, tensor)
        }));
    }
    for handle in handles {
        let (rank, tensor) = handle.await.unwrap();
        if rank == 0 {
            assert_eq!(tensor.as_slice(), &[6.0, 6.0]); // 1 + 2 + 3
        } else {
            assert_eq!(tensor.as_slice(), &[(rank + 1) as f32; 2][..]);
        }
    }
}

#[tokio::test]
async fn scatter_then_all_gather_reconstructs_original_list() {
    let size = 4usize;
    let ranks = build_world("sg", size).await;
    let original: Vec<Tensor> = (0..size).map(|r| Tensor::new(vec![r as f32; 2])).collect();

    let mut handles = Vec::new();
    for (rank, comm, _manager) in ranks {
        let original = original.clone();
        handles.push(tokio::spawn(async move {
            let mut received = Tensor::zeros(2);
            let in_list = if rank == 0 { Some(original.as_slice()) } else { None };
            comm.scatter(&mut received, in_list, 0, Some("sg")).await.unwrap();
            assert_eq!(received.as_slice(), original[rank as usize].as_slice());

            let mut gathered = vec![Tensor::zeros(2); size];
            comm.all_gather(&mut gathered, &received, Some("sg")).await.unwrap();
            gathered
        }));
    }
    for handle in handles {
        let gathered = handle.await.unwrap();
        assert_eq!(gathered, original);
    }
}

/// Boundary: a world of size 1 still completes every collective — they're
/// no-ops on the single rank.
#[tokio::test]
async fn size_one_world_collectives_complete() {
    let ranks = build_world("solo", 1).await;
    let (_, comm, _manager) = &ranks[0];

    let mut tensor = Tensor::new(vec![5.0; 3]);
    comm.broadcast(&mut tensor, 0, Some("solo")).await.unwrap();
    assert_eq!(tensor.as_slice(), &[5.0, 5.0, 5.0]);

    let mut tensor = Tensor::new(vec![2.0; 3]);
    comm.all_reduce(&mut tensor, ReduceOp::Sum, Some("solo")).await.unwrap();
    assert_eq!(tensor.as_slice(), &[2.0, 2.0, 2.0]);

    let mut out = vec![Tensor::zeros(3)];
    comm.all_gather(&mut out, &tensor, Some("solo")).await.unwrap();
    assert_eq!(out[0], tensor);
}

/// Boundary: `gather`/`scatter` without the required list at the root is
/// `InvalidArgument`, and an out-of-range rank is rejected the same way.
#[tokio::test]
async fn gather_scatter_reject_missing_root_list_and_bad_rank() {
    let ranks = build_world("badargs", 2).await;
    let (_, comm0, _manager) = &ranks[0];

    let tensor = Tensor::zeros(2);
    let err = comm0.gather(&tensor, None, 0, Some("badargs")).await.unwrap_err();
    assert!(matches!(err, multiworld_runtime::error::CoreError::InvalidArgument(_)));

    let mut out = Tensor::zeros(2);
    let err = comm0.scatter(&mut out, None, 0, Some("badargs")).await.unwrap_err();
    assert!(matches!(err, multiworld_runtime::error::CoreError::InvalidArgument(_)));

    let mut tensor = Tensor::zeros(2);
    let err = comm0.broadcast(&mut tensor, -1, Some("badargs")).await.unwrap_err();
    assert!(matches!(err, multiworld_runtime::error::CoreError::InvalidArgument(_)));
    let err = comm0.broadcast(&mut tensor, 9, Some("badargs")).await.unwrap_err();
    assert!(matches!(err, multiworld_runtime::error::CoreError::InvalidArgument(_)));
}
