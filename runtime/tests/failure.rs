//! Failure propagation: spec.md §8 scenarios 2 and 6, plus the monotonic
//! `broken` invariant (invariant 3/5: a world never goes back to `Active`
//! once `Broken`, and a watchdog-observed break releases any in-flight
//! operation with `BrokenWorld`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use multiworld_runtime::communicator::WorldCommunicator;
use multiworld_runtime::config::{ManagerConfig, WatchdogConfig};
use multiworld_runtime::error::CoreError;
use multiworld_runtime::manager::WorldManager;
use multiworld_runtime::store::InProcessStoreFactory;
use multiworld_runtime::tensor::Tensor;
use multiworld_runtime::transport::LoopbackNetwork;
use multiworld_runtime::watchdog::Watchdog;
use multiworld_runtime::worker::Worker;
use multiworld_runtime::world::{Backend, WorldState, WorldStateCell};

fn fast_timing() -> WatchdogConfig {
    WatchdogConfig {
        update_period: Duration::from_millis(10),
        updates_per_check: 2,
        notice_wait_timeout: Duration::from_millis(5),
        deadlock_check_wait_time: Duration::from_millis(30),
        deadlock_check_iterations: 3,
    }
}

/// Invariant 3/5: once a world's state cell is marked `Broken`, nothing
/// moves it back to `Active`, and marking it broken again or removing it
/// never resurrects it.
#[test]
fn world_state_never_returns_to_active_once_broken() {
    let cell = WorldStateCell::new(WorldState::Initializing);
    cell.activate();
    assert_eq!(cell.get(), WorldState::Active);

    cell.mark_broken();
    assert_eq!(cell.get(), WorldState::Broken);

    // A late `activate()` call (e.g. a delayed rendezvous success racing
    // with a watchdog break) must not resurrect the world.
    cell.activate();
    assert_eq!(cell.get(), WorldState::Broken);

    cell.mark_broken();
    assert_eq!(cell.get(), WorldState::Broken);
}

#[test]
fn removed_state_is_terminal() {
    let cell = WorldStateCell::new(WorldState::Active);
    cell.mark_removed();
    assert_eq!(cell.get(), WorldState::Removed);
    cell.activate();
    assert_eq!(cell.get(), WorldState::Removed);
    cell.mark_broken();
    assert_eq!(cell.get(), WorldState::Removed);
}

/// Scenario 2: rank 0 is awaiting `recv` from rank 1 when rank 1's process
/// is killed (simulated: rank 1 never joins, and the shared store goes
/// unreachable). Expect the awaiting `recv` to complete with `BrokenWorld`
/// well within the watchdog's detection window, with no panic or process
/// exit.
#[tokio::test(flavor = "multi_thread")]
async fn point_to_point_recv_unblocks_with_broken_world_on_peer_loss() {
    let network = LoopbackNetwork::new();
    let store_factory = Arc::new(InProcessStoreFactory::new());
    let transport = Arc::new(network.handle_for_rank(0));
    let mut build = WorldManager::build(
        ManagerConfig::default(),
        fast_timing(),
        store_factory.clone(),
        transport.clone(),
    );
    build
        .manager
        .initialize_world("world1", 0, 2, Backend::CpuCollective, "127.0.0.1", 50001)
        .await
        .unwrap();

    // This test is only interested in the point-to-point BrokenWorld path,
    // not the deadlock probe's default abrupt-exit action.
    build.watchdog_init.on_deadlock = Arc::new(|| {});
    let mut watchdog = Watchdog::new(build.watchdog_init).unwrap();
    watchdog.start().unwrap();
    tokio::spawn(build.manager.clone().run_cleanup_task());

    let communicator = Arc::new(WorldCommunicator::new(
        build.manager.registry(),
        transport,
        ManagerConfig::default(),
        build.removal_tx,
    ));

    let recv_task = {
        let communicator = communicator.clone();
        tokio::spawn(async move {
            let mut buf = Tensor::zeros(4);
            communicator.recv(&mut buf, 1, Some("world1")).await
        })
    };

    // Give the recv a moment to actually start busy-awaiting, then kill the
    // peer by poisoning the shared store.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let store = store_factory.existing("127.0.0.1", 50001).unwrap();
    store.poison();

    let result = tokio::time::timeout(Duration::from_secs(5), recv_task)
        .await
        .expect("recv should unblock within the watchdog's detection window")
        .expect("recv task should not panic");

    assert!(matches!(result, Err(CoreError::BrokenWorld { name, .. }) if name == "world1"));
}

/// Scenario 6: the main task installs the deadlock-probe signal handler but
/// never actually services it (simulating being wedged inside a blocking
/// call that ignores signals). Once a world breaks and the probe exhausts
/// its bounded iterations without a response, the configured deadlock
/// action fires.
#[tokio::test(flavor = "multi_thread")]
async fn unresponsive_main_task_triggers_deadlock_action() {
    let network = LoopbackNetwork::new();
    let store_factory = Arc::new(InProcessStoreFactory::new());
    let transport = Arc::new(network.handle_for_rank(0));
    let mut build = WorldManager::build(
        ManagerConfig::default(),
        fast_timing(),
        store_factory.clone(),
        transport.clone(),
    );
    build
        .manager
        .initialize_world("world1", 0, 1, Backend::CpuCollective, "127.0.0.1", 50002)
        .await
        .unwrap();

    // Install a handler for the probe's signal so the process doesn't take
    // the default (terminating) disposition, but never poll it — the main
    // task in this scenario is wedged and never services the signal.
    let _signal_guard = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        .expect("failed to install SIGUSR1 handler");

    let deadlock_fired = Arc::new(AtomicBool::new(false));
    let flag = deadlock_fired.clone();
    build.watchdog_init.on_deadlock = Arc::new(move || {
        flag.store(true, Ordering::SeqCst);
    });

    let mut watchdog = Watchdog::new(build.watchdog_init).unwrap();
    watchdog.start().unwrap();
    tokio::spawn(build.manager.clone().run_cleanup_task());

    let store = store_factory.existing("127.0.0.1", 50002).unwrap();
    store.poison();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        deadlock_fired.load(Ordering::SeqCst),
        "deadlock action should have fired once the bounded probe exhausted its iterations"
    );
}
