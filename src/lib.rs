//! Nightjar library: the portable core of a dual-radio assessment handheld.
//!
//! Everything that decides what the device does lives here and runs on any
//! host with `cargo test`: the target registry, the context-aware action
//! resolver, the radio arbiter, the orchestrator loop with its two bounded
//! queues, frame observation and the NDJSON console. The ESP32 firmware
//! binary only supplies capability providers, a clock, a watchdog and a byte
//! stream.
//!
//! Modules by layer:
//! - **State**: `target`, `registry`, `actions`, `board`, `config`
//! - **Coordination**: `radio`, `provider`, `ipc`, `context`, `orchestrator`,
//!   `diag`, `error`
//! - **Edges**: `observe` (air to observations), `protocol` and `console`
//!   (observations and events to the host)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Host implementation of the critical section used by the shared mutexes
#[cfg(test)]
use critical_section as _;

pub mod actions;
pub mod board;
pub mod config;
pub mod console;
pub mod context;
pub mod diag;
pub mod error;
pub mod ipc;
pub mod observe;
pub mod orchestrator;
pub mod protocol;
pub mod provider;
pub mod radio;
pub mod registry;
pub mod target;
