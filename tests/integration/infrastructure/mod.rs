pub mod process_harness;

pub use process_harness::{is_reaped, ScriptHarness, IGNORES_INTERRUPT, IGNORES_INTERRUPT_AND_TERMINATE};
pub use socket_framework::{tcp_pair, ScriptedServer};
