//! Shared data model, coordination-store client, and cluster logic for
//! the fleetkeeper cluster manager. `fleetkeeperd` links this crate and
//! adds the daemon's process wiring (config, signals, CLI) on top.

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate failure;

pub mod domain_xml;
pub mod logger;
pub mod metadata;
pub mod model;
pub mod placement;
pub mod schema;
pub mod store;

pub use model::*;
pub use schema::{KeyName, SchemaRegistry, SchemaVersion, CURRENT_SCHEMA};
pub use store::{Store, StoreError, StoreErrKind, WriteOp};
