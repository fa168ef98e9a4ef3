//! Schema registry (spec §4.2, "C2").
//!
//! Maps symbolic names like `("node.state.daemon", "hv1")` to concrete
//! store paths, and tracks the cluster's installed/per-node schema
//! versions so a rolling upgrade only commits once every node has
//! loaded the new schema (spec §4.2).

use std::sync::Arc;

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

use crate::store::{Store, StoreErrKind, WriteOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion(pub u32);

pub const CURRENT_SCHEMA: SchemaVersion = SchemaVersion(0);

#[derive(Debug)]
pub struct SchemaError {
    inner: Context<SchemaErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum SchemaErrKind {
    #[fail(display = "unknown symbolic path name: {}", _0)]
    UnknownName(String),
    #[fail(display = "schema migration from {} to {} has no declared path", _0, _1)]
    NoMigrationPath(u32, u32),
    #[fail(display = "store error applying schema: {}", _0)]
    Store(String),
}

impl Fail for SchemaError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<SchemaErrKind> for SchemaError {
    fn from(kind: SchemaErrKind) -> SchemaError {
        SchemaError { inner: Context::new(kind) }
    }
}
impl From<Context<SchemaErrKind>> for SchemaError {
    fn from(inner: Context<SchemaErrKind>) -> SchemaError {
        SchemaError { inner }
    }
}
impl From<crate::store::StoreError> for SchemaError {
    fn from(e: crate::store::StoreError) -> SchemaError {
        SchemaErrKind::Store(e.to_string()).into()
    }
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Symbolic key names resolved by `SchemaRegistry::path`. New symbolic
/// names are added here, never by hand-building path strings at call
/// sites — this is the one place schema-version-dependent layout is
/// allowed to leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyName {
    BaseSchemaVersion,
    BaseConfigPrimaryNode,
    BaseConfigMaintenance,
    BaseConfigLock,
    NodeRoot,
    NodeMode,
    NodeStateDaemon,
    NodeStateRouter,
    NodeStateDomain,
    NodeKeepalive,
    NodeHealth,
    NodeMemory,
    NodeCpuLoad,
    NodeVcpuAllocated,
    NodeRunningDomains,
    NodeProvisionedDomains,
    NodeIpmi,
    NodeInventory,
    NodeActiveSchema,
    NodeLatestSchema,
    NodeLogRing,
    DomainRoot,
    DomainState,
    DomainNode,
    DomainLastNode,
    DomainXml,
    DomainConsoleLog,
    DomainMetaAutostart,
    DomainMetaProfile,
    DomainMigrateLock,
    NetworkRoot,
    NetworkNetType,
    NetworkDhcpLeases,
    FaultRoot,
}

/// Maps symbolic names to concrete paths for a given schema version
/// (spec §4.2). Only `V0` exists today; a `V1` would add match arms to
/// `path` plus an entry in `MIGRATIONS`.
#[derive(Clone)]
pub struct SchemaRegistry {
    version: SchemaVersion,
}

impl SchemaRegistry {
    pub fn new(version: SchemaVersion) -> Self {
        SchemaRegistry { version }
    }

    pub fn current() -> Self {
        SchemaRegistry::new(CURRENT_SCHEMA)
    }

    /// Resolve a symbolic name (plus positional args, e.g. a node name
    /// or VM uuid) to a concrete store path.
    pub fn path(&self, name: KeyName, args: &[&str]) -> String {
        match self.version {
            SchemaVersion(0) => Self::path_v0(name, args),
            SchemaVersion(v) => panic!("no path table for schema version {}", v),
        }
    }

    fn path_v0(name: KeyName, args: &[&str]) -> String {
        use KeyName::*;
        match name {
            BaseSchemaVersion => "/config/schema_version".to_string(),
            BaseConfigPrimaryNode => "/config/primary_node".to_string(),
            BaseConfigMaintenance => "/config/maintenance".to_string(),
            BaseConfigLock => "/config/primary_lock".to_string(),
            NodeRoot => "/nodes".to_string(),
            NodeMode => format!("/nodes/{}/mode", args[0]),
            NodeStateDaemon => format!("/nodes/{}/state/daemon", args[0]),
            NodeStateRouter => format!("/nodes/{}/state/router", args[0]),
            NodeStateDomain => format!("/nodes/{}/state/domain", args[0]),
            NodeKeepalive => format!("/nodes/{}/keepalive", args[0]),
            NodeHealth => format!("/nodes/{}/health", args[0]),
            NodeMemory => format!("/nodes/{}/memory", args[0]),
            NodeCpuLoad => format!("/nodes/{}/cpu/load", args[0]),
            NodeVcpuAllocated => format!("/nodes/{}/vcpu/allocated", args[0]),
            NodeRunningDomains => format!("/nodes/{}/running_domains", args[0]),
            NodeProvisionedDomains => format!("/nodes/{}/count/provisioned_domains", args[0]),
            NodeIpmi => format!("/nodes/{}/ipmi", args[0]),
            NodeInventory => format!("/nodes/{}/inventory", args[0]),
            NodeActiveSchema => format!("/nodes/{}/schema/active", args[0]),
            NodeLatestSchema => format!("/nodes/{}/schema/latest", args[0]),
            NodeLogRing => format!("/logs/{}/messages", args[0]),
            DomainRoot => "/domains".to_string(),
            DomainState => format!("/domains/{}/state", args[0]),
            DomainNode => format!("/domains/{}/node", args[0]),
            DomainLastNode => format!("/domains/{}/last_node", args[0]),
            DomainXml => format!("/domains/{}/xml", args[0]),
            DomainConsoleLog => format!("/domains/{}/consolelog", args[0]),
            DomainMetaAutostart => format!("/domains/{}/meta/autostart", args[0]),
            DomainMetaProfile => format!("/domains/{}/meta/profile", args[0]),
            DomainMigrateLock => format!("/domains/{}/migrate_lock", args[0]),
            NetworkRoot => "/networks".to_string(),
            NetworkNetType => format!("/networks/{}/type", args[0]),
            NetworkDhcpLeases => format!("/networks/{}/dhcp_leases", args[0]),
            FaultRoot => "/faults".to_string(),
        }
    }

    /// The base keys every installation needs, used by `validate`.
    fn base_keys() -> Vec<&'static str> {
        vec!["/config", "/config/maintenance", "/nodes", "/domains", "/networks", "/faults", "/logs"]
    }

    /// Return the subset of base keys that are missing (spec §4.2
    /// `validate`).
    pub fn validate(&self, store: &dyn Store) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for key in Self::base_keys() {
            if !store.exists(key).map_err(|e| SchemaErrKind::Store(e.to_string()))? {
                missing.push(key.to_string());
            }
        }
        Ok(missing)
    }

    /// Create all missing base keys with default values (spec §4.2
    /// `apply`).
    pub fn apply(&self, store: &dyn Store) -> Result<()> {
        for key in self.validate(store)? {
            let default = if key == "/config/maintenance" { b"false".to_vec() } else { Vec::new() };
            store.write(&[WriteOp::upsert(key, default)]).map_err(|e| SchemaErrKind::Store(e.to_string()))?;
        }
        if !store.exists(&self.path(KeyName::BaseSchemaVersion, &[])).map_err(|e| SchemaErrKind::Store(e.to_string()))? {
            store
                .write(&[WriteOp::upsert(self.path(KeyName::BaseSchemaVersion, &[]), CURRENT_SCHEMA.0.to_string().into_bytes())])
                .map_err(|e| SchemaErrKind::Store(e.to_string()))?;
        }
        Ok(())
    }

    /// One declarative step of a schema delta.
    pub fn migrate(&self, store: &dyn Store, from: SchemaVersion, to: SchemaVersion) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let ops = MIGRATIONS
            .iter()
            .find(|m| m.from == from.0 && m.to == to.0)
            .ok_or(SchemaErrKind::NoMigrationPath(from.0, to.0))?;
        for op in ops.ops {
            apply_schema_op(store, op)?;
        }
        store
            .write(&[WriteOp::upsert(self.path(KeyName::BaseSchemaVersion, &[]), to.0.to_string().into_bytes())])
            .map_err(|e| SchemaErrKind::Store(e.to_string()))?;
        Ok(())
    }
}

/// One step of a schema delta (spec §4.2: "each schema delta is a
/// declarative list of add/rename/remove operations").
#[derive(Debug, Clone, Copy)]
pub enum SchemaOp {
    AddKey(&'static str),
    RenameKey(&'static str, &'static str),
    RemoveKey(&'static str),
}

struct Migration {
    from: u32,
    to: u32,
    ops: &'static [SchemaOp],
}

/// No migrations exist yet (only `V0` is defined); this stays empty
/// until a `V1` schema is introduced.
static MIGRATIONS: &[Migration] = &[];

fn apply_schema_op(store: &dyn Store, op: &SchemaOp) -> Result<()> {
    match *op {
        SchemaOp::AddKey(path) => {
            if !store.exists(path).map_err(|e| SchemaErrKind::Store(e.to_string()))? {
                store.write(&[WriteOp::upsert(path, Vec::new())]).map_err(|e| SchemaErrKind::Store(e.to_string()))?;
            }
            Ok(())
        }
        SchemaOp::RenameKey(old, new) => {
            if store.exists(old).map_err(|e| SchemaErrKind::Store(e.to_string()))? {
                store.rename(old, new).map_err(|e| SchemaErrKind::Store(e.to_string()))?;
            }
            Ok(())
        }
        SchemaOp::RemoveKey(path) => {
            if store.exists(path).map_err(|e| SchemaErrKind::Store(e.to_string()))? {
                store.delete(path, true).map_err(|e| SchemaErrKind::Store(e.to_string()))?;
            }
            Ok(())
        }
    }
}

/// Has every node loaded at least schema `target`? Used by the gate
/// spec §4.2 describes: "a rolling upgrade commits a new schema only
/// when every node has loaded the new version".
pub fn all_nodes_ready(store: &dyn Store, registry: &SchemaRegistry, target: SchemaVersion) -> Result<bool> {
    let root = registry.path(KeyName::NodeRoot, &[]);
    let nodes = store.children(&root).map_err(|e| SchemaErrKind::Store(e.to_string()))?;
    for node in nodes {
        let path = registry.path(KeyName::NodeActiveSchema, &[&node]);
        let active: u32 = store
            .read(&path)
            .ok()
            .and_then(|(d, _)| String::from_utf8(d).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if active < target.0 {
            return Ok(false);
        }
    }
    Ok(true)
}

#[allow(unused)]
fn _assert_store_object_safe(_s: Arc<dyn Store>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[test]
    fn path_resolution_is_stable() {
        let reg = SchemaRegistry::current();
        assert_eq!(reg.path(KeyName::NodeStateDaemon, &["hv1"]), "/nodes/hv1/state/daemon");
        assert_eq!(reg.path(KeyName::DomainState, &["abc"]), "/domains/abc/state");
    }

    #[test]
    fn validate_then_apply_clears_missing_keys() {
        let store = FakeStore::new();
        let reg = SchemaRegistry::current();
        let missing = reg.validate(&*store).unwrap();
        assert!(!missing.is_empty());
        reg.apply(&*store).unwrap();
        let missing = reg.validate(&*store).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn apply_is_idempotent() {
        let store = FakeStore::new();
        let reg = SchemaRegistry::current();
        reg.apply(&*store).unwrap();
        reg.apply(&*store).unwrap();
        assert!(reg.validate(&*store).unwrap().is_empty());
    }
}
