//! Core of a multi-world distributed collective-communication runtime: the
//! [`manager::WorldManager`], [`communicator::WorldCommunicator`], and
//! [`watchdog::Watchdog`] that let one process join several independent
//! communication groups ("worlds") at once, exchange tensors across them
//! under a cooperative asynchronous execution model, and survive the
//! failure of any one world without tearing the process down.
//!
//! The wire-level transport and the tensor/array runtime are external
//! collaborators; this crate depends on them only through the
//! [`transport::Transport`] and [`store::RendezvousStore`] contracts (see
//! `SPEC_FULL.md` §6). [`transport::LoopbackTransport`] and
//! [`store::InProcessStore`] are in-process reference implementations used
//! by this crate's own tests and by the `demos` binaries.

pub mod communicator;
pub mod config;
pub mod default_wrapper;
pub mod error;
pub mod manager;
pub mod store;
pub mod tensor;
pub mod transport;
pub mod watchdog;
pub mod worker;
pub mod world;

/// The sentinel world name used by every operation that doesn't name one
/// explicitly (spec §4.2, §5 "Lifecycle of the default world sentinel").
/// Process-wide, initialized once, never torn down.
pub const DEFAULT_WORLD_NAME: &str = "default";
