// src/lib.rs
//
// modgate — Modbus TCP/RTU client gateway.
//
// Bridges one Modbus endpoint onto a pub/sub message bus: registers are
// polled on a per-component cadence, decoded into semantic values and
// published; bus sets are debounced, encoded and written back through a
// pool of connection workers with retry and bad-register recovery.

#[macro_use]
pub mod logging;

pub mod bus;
pub mod codec;
pub mod config;
pub mod events;
pub mod gateway;
pub mod heartbeat;
pub mod io;
pub mod sched;
pub mod uri;

pub use config::load_config;
pub use gateway::{run, RunOutcome};
