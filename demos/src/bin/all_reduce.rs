//! Two-worlds-at-once all-reduce demo (spec.md §8 scenario 1): `world1` and
//! `world2`, each size 3, every rank running `all_reduce(ones(4), SUM)` on
//! its own world for `--iterations` rounds concurrently. Exercises the core
//! claim of this crate — operations on independent worlds never block one
//! another — the way `original_source/examples/multiworld_asyncio.py` drives
//! two process groups from one asyncio loop.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use multiworld_runtime::communicator::WorldCommunicator;
use multiworld_runtime::config::{ManagerConfig, WatchdogConfig};
use multiworld_runtime::manager::WorldManager;
use multiworld_runtime::store::InProcessStoreFactory;
use multiworld_runtime::tensor::{ReduceOp, Tensor};
use multiworld_runtime::transport::LoopbackNetwork;
use multiworld_runtime::watchdog::Watchdog;
use multiworld_runtime::worker::Worker;
use multiworld_runtime::world::Backend;

#[derive(Parser, Debug)]
#[command(about = "Run SUM all-reduce on two independent worlds concurrently")]
struct Args {
    #[arg(long, default_value_t = 3)]
    world_size: i32,
    #[arg(long, default_value_t = 100)]
    iterations: u32,
}

type RankHandle = (
    String,
    i32,
    Arc<WorldCommunicator>,
    Arc<WorldManager>,
    crossbeam_channel::Sender<()>,
);

async fn build_world(world_name: &str, port: u16, size: i32) -> Result<Vec<RankHandle>> {
    let network = LoopbackNetwork::new();
    let store_factory = Arc::new(InProcessStoreFactory::new());
    let mut ranks = Vec::new();
    for rank in 0..size {
        let transport = Arc::new(network.handle_for_rank(rank));
        let build = WorldManager::build(
            ManagerConfig::default(),
            WatchdogConfig::default(),
            store_factory.clone(),
            transport.clone(),
        );
        build
            .manager
            .initialize_world(world_name, rank, size as usize, Backend::CpuCollective, "127.0.0.1", port)
            .await?;
        let mut watchdog = Watchdog::new(build.watchdog_init)?;
        watchdog.start().expect("failed to start watchdog");
        let communicator = Arc::new(WorldCommunicator::new(
            build.manager.registry(),
            transport,
            ManagerConfig::default(),
            build.removal_tx,
        ));
        ranks.push((
            world_name.to_string(),
            rank,
            communicator,
            build.manager,
            build.watchdog_cancel,
        ));
    }
    Ok(ranks)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let world1 = build_world("world1", 29510, args.world_size).await?;
    let world2 = build_world("world2", 29511, args.world_size).await?;

    let mut handles = Vec::new();
    for (world_name, rank, communicator, _manager, _cancel) in world1.iter().chain(world2.iter()) {
        let rank = *rank;
        let world_name = world_name.clone();
        let communicator = communicator.clone();
        let iterations = args.iterations;
        let world_size = args.world_size as f32;
        handles.push(tokio::spawn(async move {
            for step in 0..iterations {
                let mut tensor = Tensor::new(vec![1.0; 4]);
                communicator
                    .all_reduce(&mut tensor, ReduceOp::Sum, Some(&world_name))
                    .await
                    .unwrap();
                assert_eq!(tensor.as_slice(), &vec![world_size; 4][..]);
                if step % 20 == 0 {
                    tracing::debug!(rank, world = %world_name, step, "all-reduce round ok");
                }
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }
    tracing::info!(iterations = args.iterations, "both worlds completed every round with no deadlock");

    for (world_name, _, _, manager, _) in world1.iter().chain(world2.iter()) {
        manager.remove_world(world_name).await.ok();
    }

    Ok(())
}
