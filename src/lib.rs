//! Helpers for integration-testing external processes and sockets.
//!
//! The crate wraps a spawned process or a connected socket so that its output
//! can be collected without blocking, waits for expected strings to show up in
//! that output in a given order, and tears processes down without leaving
//! zombies behind.

pub type Result<T> = eyre::Result<T>;

pub mod buffer;
pub mod config;
pub mod coverage;
pub mod environment;
pub mod fork_hooks;
pub mod logging;
pub mod process;
pub mod socket;
pub mod wait;

pub use buffer::{set_non_blocking, Buffering, NonBlockingReader};
pub use config::{HarnessConfig, ShutdownPolicy};
pub use coverage::{setup_coverage, setup_coverage_from_config, CoverageController, CoverageSession};
pub use environment::Environment;
pub use fork_hooks::ForkHooks;
pub use process::{ManagedProcess, ProcessBuilder};
pub use socket::ManagedSocket;
pub use wait::{
    assert_strings_in_order, dump_on_error, strings_in_order, wait_for_strings, WaitTimeout, Waiter,
};
