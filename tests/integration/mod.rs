//! Integration tests driving real processes and sockets through the harness

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::ScriptHarness;
