//! Fence executor (spec §4.8, "C8"). Runs on the primary coordinator
//! whenever it observes `daemon_state[n] == dead`.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use failure::{Backtrace, Context, Fail};
use fleetkeeper_core::model::{DaemonState, DomainState, Node, RouterState};
use fleetkeeper_core::placement::{self, Selector};
use fleetkeeper_core::schema::{KeyName, SchemaRegistry};
use fleetkeeper_core::store::{self, Store, WriteOp};
use uuid::Uuid;

use crate::config::FenceAction;
use crate::ipmi::{self, IpmiTarget};
use crate::keepalive::StopSignal;

#[derive(Debug)]
pub struct FenceError {
    inner: Context<FenceErrKind>,
}

#[derive(Debug, Fail)]
pub enum FenceErrKind {
    #[fail(display = "store error fencing {}: {}", _0, _1)]
    Store(String, String),
    #[fail(display = "ipmi error fencing {}: {}", _0, _1)]
    Ipmi(String, String),
}

impl Fail for FenceError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<FenceErrKind> for FenceError {
    fn from(kind: FenceErrKind) -> FenceError {
        FenceError { inner: Context::new(kind) }
    }
}
impl From<Context<FenceErrKind>> for FenceError {
    fn from(inner: Context<FenceErrKind>) -> FenceError {
        FenceError { inner }
    }
}

pub type Result<T> = std::result::Result<T, FenceError>;

/// Policy knobs carried in `Config` (spec §4.8 "Policy knobs").
#[derive(Debug, Clone)]
pub struct FencePolicy {
    pub fence_intervals: u32,
    pub suicide_intervals: Option<u32>,
    pub successful_fence: FenceAction,
    pub failed_fence: FenceAction,
    pub placement_selector: Selector,
}

/// Outcome of a single fence attempt, used by callers to decide
/// whether to log success (saving throw) or proceed to the migrate
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    SavedByKeepalive,
    SkippedMaintenance,
    Fenced,
}

fn store_err(node: &str) -> impl Fn(store::StoreError) -> FenceError + '_ {
    move |e| FenceErrKind::Store(node.to_string(), e.to_string()).into()
}

fn read_daemon_state(store: &Arc<dyn Store>, schema: &SchemaRegistry, node: &str) -> Result<DaemonState> {
    let (data, _) = store
        .read(&schema.path(KeyName::NodeStateDaemon, &[node]))
        .map_err(store_err(node))?;
    Ok(String::from_utf8_lossy(&data).parse().unwrap_or(DaemonState::Dead))
}

fn maintenance_enabled(store: &Arc<dyn Store>, schema: &SchemaRegistry) -> bool {
    store
        .read(&schema.path(KeyName::BaseConfigMaintenance, &[]))
        .map(|(d, _)| String::from_utf8_lossy(&d) == "true")
        .unwrap_or(false)
}

/// Step 1: saving throws. Re-reads `daemon_state[n]` every `t_k` for
/// `policy.fence_intervals` iterations; returns early the moment it
/// stops being `dead` (property 4, "saving-throw correctness").
pub fn saving_throws(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    node: &str,
    t_k: Duration,
    policy: &FencePolicy,
    stop: &StopSignal,
) -> Result<bool> {
    for _ in 0..policy.fence_intervals {
        if read_daemon_state(store, schema, node)? != DaemonState::Dead {
            return Ok(true);
        }
        if stop.interruptible_sleep(t_k) {
            return Ok(true);
        }
    }
    Ok(read_daemon_state(store, schema, node)? != DaemonState::Dead)
}

/// Runs the full fence algorithm (spec §4.8 steps 1-7) against node
/// `n`. `candidates` is the node pool the migrate-on-fence phase
/// places VMs against; it must already exclude `n`.
pub fn fence_node(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    node: &str,
    was_coordinator: bool,
    ipmi_target: &IpmiTarget,
    running_domains: &[Uuid],
    candidates: &[Node],
    t_k: Duration,
    policy: &FencePolicy,
    stop: &StopSignal,
) -> Result<FenceOutcome> {
    // step 1
    if saving_throws(store, schema, node, t_k, policy, stop)? {
        log::info!("node {} recovered during saving throws; fence aborted", node);
        return Ok(FenceOutcome::SavedByKeepalive);
    }

    // step 2
    if maintenance_enabled(store, schema) {
        log::warn!("node {} is dead but cluster is in maintenance; skipping fence", node);
        return Ok(FenceOutcome::SkippedMaintenance);
    }

    // step 3
    if let Err(e) = ipmi::reset_or_recover(ipmi_target) {
        log::warn!("ipmi power reset for {} failed: {}", node, e);
    }

    // step 4
    if stop.interruptible_sleep(t_k * 2) {
        return Ok(FenceOutcome::Fenced);
    }

    // step 5
    if was_coordinator {
        store
            .write(&[WriteOp::upsert(
                schema.path(KeyName::NodeStateRouter, &[node]),
                RouterState::Secondary.to_string().into_bytes(),
            )])
            .map_err(store_err(node))?;
        let primary = store
            .read(&schema.path(KeyName::BaseConfigPrimaryNode, &[]))
            .map(|(d, _)| String::from_utf8_lossy(&d).into_owned())
            .unwrap_or_default();
        if primary == node {
            store
                .write(&[WriteOp::upsert(schema.path(KeyName::BaseConfigPrimaryNode, &[]), Vec::new())])
                .map_err(store_err(node))?;
        }
    }

    // step 6
    store
        .write(&[WriteOp::upsert(
            schema.path(KeyName::NodeStateDomain, &[node]),
            fleetkeeper_core::model::NodeDomainState::Flush.to_string().into_bytes(),
        )])
        .map_err(store_err(node))?;

    if policy.successful_fence == FenceAction::Migrate {
        for uuid in running_domains {
            migrate_or_park(store, schema, node, *uuid, candidates, policy)?;
        }
    }

    // step 7
    store
        .write(&[WriteOp::upsert(
            schema.path(KeyName::NodeStateDomain, &[node]),
            fleetkeeper_core::model::NodeDomainState::Flushed.to_string().into_bytes(),
        )])
        .map_err(store_err(node))?;

    Ok(FenceOutcome::Fenced)
}

fn migrate_or_park(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    node: &str,
    uuid: Uuid,
    candidates: &[Node],
    policy: &FencePolicy,
) -> Result<()> {
    let uuid_s = uuid.to_string();
    match placement::select(policy.placement_selector, candidates) {
        Some(target) => store.write(&[
            WriteOp::upsert(schema.path(KeyName::DomainState, &[&uuid_s]), DomainState::Start.to_string().into_bytes()),
            WriteOp::upsert(schema.path(KeyName::DomainNode, &[&uuid_s]), target.name.as_bytes().to_vec()),
            WriteOp::upsert(schema.path(KeyName::DomainLastNode, &[&uuid_s]), node.as_bytes().to_vec()),
        ]),
        None => store.write(&[
            WriteOp::upsert(schema.path(KeyName::DomainState, &[&uuid_s]), DomainState::Stop.to_string().into_bytes()),
            WriteOp::upsert(schema.path(KeyName::DomainMetaAutostart, &[&uuid_s]), b"true".to_vec()),
        ]),
    }
    .map_err(store_err(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetkeeper_core::store::fake::FakeStore;

    fn policy() -> FencePolicy {
        FencePolicy {
            fence_intervals: 2,
            suicide_intervals: None,
            successful_fence: FenceAction::Migrate,
            failed_fence: FenceAction::Migrate,
            placement_selector: Selector::Mem,
        }
    }

    #[test]
    fn saving_throw_aborts_when_node_recovers() {
        let store: Arc<dyn Store> = FakeStore::new();
        let schema = SchemaRegistry::current();
        schema.apply(&*store).unwrap();
        store
            .write(&[WriteOp::upsert(schema.path(KeyName::NodeStateDaemon, &["hv1"]), b"run".to_vec())])
            .unwrap();
        let stop = StopSignal::new();
        let saved = saving_throws(&store, &schema, "hv1", Duration::from_millis(1), &policy(), &stop).unwrap();
        assert!(saved);
    }

    #[test]
    fn saving_throw_exhausts_when_node_stays_dead() {
        let store: Arc<dyn Store> = FakeStore::new();
        let schema = SchemaRegistry::current();
        schema.apply(&*store).unwrap();
        store
            .write(&[WriteOp::upsert(schema.path(KeyName::NodeStateDaemon, &["hv1"]), b"dead".to_vec())])
            .unwrap();
        let stop = StopSignal::new();
        let saved = saving_throws(&store, &schema, "hv1", Duration::from_millis(1), &policy(), &stop).unwrap();
        assert!(!saved);
    }

    #[test]
    fn migrate_or_park_parks_when_no_candidates() {
        let store: Arc<dyn Store> = FakeStore::new();
        let schema = SchemaRegistry::current();
        schema.apply(&*store).unwrap();
        let uuid = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        migrate_or_park(&store, &schema, "hv1", uuid, &[], &policy()).unwrap();
        let (state, _) = store.read(&schema.path(KeyName::DomainState, &[&uuid.to_string()])).unwrap();
        assert_eq!(String::from_utf8(state).unwrap(), "stop");
        let (autostart, _) = store.read(&schema.path(KeyName::DomainMetaAutostart, &[&uuid.to_string()])).unwrap();
        assert_eq!(autostart, b"true");
    }
}
