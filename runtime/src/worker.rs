//! A small lifecycle contract shared by the long-running background workers
//! in this crate (currently just the [`crate::watchdog::Watchdog`]): a
//! worker is built from a `Config`, started on its own thread(s), and can be
//! joined to recover a terminal error.

use std::fmt::Display;

/// A component that runs on dedicated thread(s) for the life of the process
/// (or until it fails).
pub trait Worker: Sized {
    type Config;
    type Error: Display;

    fn new(config: Self::Config) -> Result<Self, Self::Error>;

    /// A short name used in logs and panics.
    fn name() -> &'static str;

    /// Whether a failure of this worker should be treated as recoverable by
    /// its owner (restart) or fatal (tear down the process).
    fn is_recoverable(&self) -> bool;

    /// Spawns the worker's thread(s). Returns once they're running, not once
    /// they've finished.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Blocks until the worker's thread(s) exit, returning the error that
    /// caused the exit, if any.
    fn join(self) -> Result<(), Self::Error>;
}
