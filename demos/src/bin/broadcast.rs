//! Broadcast demo exercising source rotation: over `--iterations` rounds,
//! the source rank rotates `step mod world_size`, broadcasting a tensor
//! every other rank must observe exactly (spec.md §8 scenario 4). Mirrors
//! `original_source/examples/broadcast.py`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use multiworld_runtime::communicator::WorldCommunicator;
use multiworld_runtime::config::{ManagerConfig, WatchdogConfig};
use multiworld_runtime::manager::WorldManager;
use multiworld_runtime::store::InProcessStoreFactory;
use multiworld_runtime::tensor::Tensor;
use multiworld_runtime::transport::LoopbackNetwork;
use multiworld_runtime::watchdog::Watchdog;
use multiworld_runtime::worker::Worker;
use multiworld_runtime::world::Backend;

#[derive(Parser, Debug)]
#[command(about = "Broadcast a tensor around a world with a rotating source rank")]
struct Args {
    #[arg(long, default_value_t = 3)]
    world_size: i32,
    #[arg(long, default_value_t = 3)]
    iterations: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let world_name = "broadcast-world".to_string();

    let network = LoopbackNetwork::new();
    let store_factory = Arc::new(InProcessStoreFactory::new());

    let mut ranks = Vec::new();
    for rank in 0..args.world_size {
        let transport = Arc::new(network.handle_for_rank(rank));
        let build = WorldManager::build(
            ManagerConfig::default(),
            WatchdogConfig::default(),
            store_factory.clone(),
            transport.clone(),
        );
        build
            .manager
            .initialize_world(&world_name, rank, args.world_size as usize, Backend::CpuCollective, "127.0.0.1", 29501)
            .await?;
        let mut watchdog = Watchdog::new(build.watchdog_init)?;
        watchdog.start().expect("failed to start watchdog");
        let communicator = Arc::new(WorldCommunicator::new(
            build.manager.registry(),
            transport,
            ManagerConfig::default(),
            build.removal_tx,
        ));
        ranks.push((rank, communicator, build.manager, build.watchdog_cancel));
    }

    for step in 0..args.iterations {
        let src = (step as i32) % args.world_size;
        let expected = src as f32 + 1.0;
        let mut handles = Vec::new();
        for (rank, communicator, _manager, _cancel) in &ranks {
            let rank = *rank;
            let communicator = communicator.clone();
            let world_name = world_name.clone();
            handles.push(tokio::spawn(async move {
                let mut tensor = if rank == src {
                    Tensor::new(vec![expected; 3])
                } else {
                    Tensor::zeros(3)
                };
                communicator.broadcast(&mut tensor, src, Some(&world_name)).await.unwrap();
                assert_eq!(tensor.as_slice(), &[expected; 3]);
                tensor
            }));
        }
        for handle in handles {
            handle.await?;
        }
        tracing::info!(step, src, "broadcast round complete");
    }

    for (_, _, manager, _) in &ranks {
        manager.remove_world(&world_name).await.ok();
    }

    Ok(())
}
