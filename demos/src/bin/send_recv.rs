//! Point-to-point send/recv demo: two simulated ranks joined to one world,
//! exchanging a tensor. Ranks are simulated as tokio tasks inside one
//! process (the real transport's TCP/NCCL backends out of scope for this
//! core); see `original_source/examples/send_recv.py` for the script this
//! mirrors.

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
#[command(about = "Send a tensor from rank 0 to rank 1 over a two-rank world")]
struct Args {
    #[arg(long, default_value = "send-recv-world")]
    world: String,
    #[arg(long, default_value_t = 4)]
    tensor_len: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let network = LoopbackNetwork::new();
    let store_factory = Arc::new(InProcessStoreFactory::new());

    let mut senders = Vec::new();
    for rank in 0..2i32 {
        let transport = Arc::new(network.handle_for_rank(rank));
        let build = WorldManager::build(
            ManagerConfig::default(),
            WatchdogConfig::default(),
            store_factory.clone(),
            transport.clone(),
        );
        build
            .manager
            .initialize_world(&args.world, rank, 2, Backend::CpuCollective, "127.0.0.1", 29500)
            .await?;

        let mut watchdog = Watchdog::new(build.watchdog_init)?;
        watchdog.start().expect("failed to start watchdog");

        let communicator = WorldCommunicator::new(
            build.manager.registry(),
            transport,
            ManagerConfig::default(),
            build.removal_tx,
        );

        senders.push((rank, communicator, build.manager, build.watchdog_cancel));
    }

    let world_name = args.world.clone();
    let tensor_len = args.tensor_len;
    let mut handles = Vec::new();
    for (rank, communicator, manager, _cancel) in senders {
        let world_name = world_name.clone();
        handles.push(tokio::spawn(async move {
            if rank == 0 {
                let payload = Tensor::new((0..tensor_len).map(|i| i as f32).collect());
                communicator.send(&payload, 1, Some(&world_name)).await.unwrap();
                tracing::info!(rank, "sent payload");
            } else {
                let mut buf = Tensor::zeros(tensor_len);
                communicator.recv(&mut buf, 0, Some(&world_name)).await.unwrap();
                tracing::info!(rank, received = ?buf.as_slice(), "received payload");
            }
            manager.remove_world(&world_name).await.ok();
        }));
    }

    for handle in handles {
        handle.await?;
    }

    Ok(())
}
