//! Per-node daemon library half, split out from `main.rs` so every
//! component is independently testable against `fleetkeeper_core`'s
//! `FakeStore` without spawning a real process (spec §6 "A4").

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate failure;

pub mod config;
pub mod fence;
pub mod ipmi;
pub mod keepalive;
pub mod libvirt;
pub mod node_fsm;
pub mod vmctl;
