//! Node state machine (spec §4.5, "C5").
//!
//! Drives `node.state.daemon` / `node.state.domain` through
//! `init -> ready -> flush -> flushed -> unflush -> ready`, `shutdown`,
//! and the fencer-driven `dead -> fence-flush -> flushed` path (the
//! fence half lives in `fence.rs`; this module owns the operator-driven
//! flush/unflush/shutdown half and the deterministic VM ordering both
//! sides rely on).

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fleetkeeper_core::model::{state_priority, DomainState, NodeDomainState};
use fleetkeeper_core::placement::{self, Selector};
use fleetkeeper_core::schema::{KeyName, SchemaRegistry};
use fleetkeeper_core::store::{Store, WriteOp};
use uuid::Uuid;

use crate::keepalive::StopSignal;

const MIGRATION_PACING: Duration = Duration::from_secs(1);

#[derive(Debug, Fail)]
pub enum NodeFsmError {
    #[fail(display = "store error during {}: {}", _0, _1)]
    Store(String, String),
}

type Result<T> = std::result::Result<T, NodeFsmError>;

fn store_err(op: &str) -> impl Fn(fleetkeeper_core::store::StoreError) -> NodeFsmError + '_ {
    move |e| NodeFsmError::Store(op.to_string(), e.to_string())
}

/// One VM entry as seen by the flush/fence loop: enough to order and
/// to issue a migration write, without pulling in the full `Domain`
/// model (which also carries the XML blob we don't need here).
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub uuid: Uuid,
    pub state: DomainState,
}

/// Sort VMs `(state_priority, uuid)` (spec §4.5: "Per-VM iteration
/// ordering is deterministic").
pub fn ordered(mut vms: Vec<VmHandle>) -> Vec<VmHandle> {
    vms.sort_by_key(|v| (state_priority(v.state), v.uuid));
    vms
}

/// `ready -> flush`: enumerate `running_domains`, pick a placement
/// target per VM, write each into `migrate`, pacing between writes
/// (spec §4.5). Returns the list of VMs for which no target could be
/// found (the caller, per spec §4.7, shuts these down instead).
pub fn flush_node(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    node_name: &str,
    running: Vec<VmHandle>,
    candidates: &[fleetkeeper_core::model::Node],
    selector: Selector,
    stop: &StopSignal,
) -> Result<Vec<Uuid>> {
    store
        .write(&[WriteOp::upsert(
            schema.path(KeyName::NodeStateDomain, &[node_name]),
            NodeDomainState::Flush.to_string().into_bytes(),
        )])
        .map_err(store_err("flush:set-flush"))?;

    let mut unplaceable = Vec::new();
    for vm in ordered(running) {
        if stop.is_stopped() {
            break;
        }
        match placement::select(selector, candidates) {
            Some(target) => {
                store
                    .write(&[
                        WriteOp::upsert(
                            schema.path(KeyName::DomainState, &[&vm.uuid.to_string()]),
                            DomainState::Migrate.to_string().into_bytes(),
                        ),
                        WriteOp::upsert(
                            schema.path(KeyName::DomainNode, &[&vm.uuid.to_string()]),
                            target.name.as_bytes().to_vec(),
                        ),
                    ])
                    .map_err(store_err("flush:migrate"))?;
            }
            None => {
                // spec §4.7: caller sets the VM to shutdown when no
                // candidate exists; we just report it upward.
                unplaceable.push(vm.uuid);
            }
        }
        if stop.interruptible_sleep(MIGRATION_PACING) {
            break;
        }
    }
    Ok(unplaceable)
}

/// Shut down VMs that flush couldn't place anywhere (spec §4.7: "the
/// caller must then either set the VM to shutdown ... or keep it
/// stopped with autostart=true").
pub fn shutdown_unplaceable(store: &Arc<dyn Store>, schema: &SchemaRegistry, uuids: &[Uuid]) -> Result<()> {
    for uuid in uuids {
        store
            .write(&[WriteOp::upsert(
                schema.path(KeyName::DomainState, &[&uuid.to_string()]),
                DomainState::Shutdown.to_string().into_bytes(),
            )])
            .map_err(store_err("shutdown-unplaceable"))?;
    }
    Ok(())
}

/// `flush -> flushed` once `running_domains` is empty.
pub fn mark_flushed_if_drained(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    node_name: &str,
) -> Result<bool> {
    let running = store
        .read(&schema.path(KeyName::NodeRunningDomains, &[node_name]))
        .map(|(d, _)| String::from_utf8_lossy(&d).trim().is_empty())
        .unwrap_or(true);
    if running {
        store
            .write(&[WriteOp::upsert(
                schema.path(KeyName::NodeStateDomain, &[node_name]),
                NodeDomainState::Flushed.to_string().into_bytes(),
            )])
            .map_err(store_err("mark-flushed"))?;
    }
    Ok(running)
}

/// `flushed -> unflush -> ready`: VMs whose `meta.autostart` is set and
/// whose `last_node` is us are started back here (spec §4.5, and the
/// round-trip law `flush(n); unflush(n)` of spec §8).
pub fn unflush_node(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    node_name: &str,
    autostart_candidates: &[VmHandle],
) -> Result<()> {
    store
        .write(&[WriteOp::upsert(
            schema.path(KeyName::NodeStateDomain, &[node_name]),
            NodeDomainState::Unflush.to_string().into_bytes(),
        )])
        .map_err(store_err("unflush:set-unflush"))?;

    for vm in ordered(autostart_candidates.to_vec()) {
        store
            .write(&[WriteOp::upsert(
                schema.path(KeyName::DomainState, &[&vm.uuid.to_string()]),
                DomainState::Start.to_string().into_bytes(),
            )])
            .map_err(store_err("unflush:start"))?;
        thread::sleep(Duration::from_millis(0));
    }

    store
        .write(&[WriteOp::upsert(
            schema.path(KeyName::NodeStateDomain, &[node_name]),
            NodeDomainState::Ready.to_string().into_bytes(),
        )])
        .map_err(store_err("unflush:set-ready"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(uuid: &str, state: DomainState) -> VmHandle {
        VmHandle { uuid: Uuid::parse_str(uuid).unwrap(), state }
    }

    #[test]
    fn ordered_puts_migrate_before_start_before_rest() {
        let vms = vec![
            vm("33333333-3333-3333-3333-333333333333", DomainState::Stop),
            vm("11111111-1111-1111-1111-111111111111", DomainState::Migrate),
            vm("22222222-2222-2222-2222-222222222222", DomainState::Start),
        ];
        let sorted = ordered(vms);
        assert_eq!(sorted[0].state, DomainState::Migrate);
        assert_eq!(sorted[1].state, DomainState::Start);
        assert_eq!(sorted[2].state, DomainState::Stop);
    }

    #[test]
    fn ordering_is_stable_for_equal_priority_by_uuid() {
        let a = vm("11111111-1111-1111-1111-111111111111", DomainState::Stop);
        let b = vm("22222222-2222-2222-2222-222222222222", DomainState::Disable);
        let sorted = ordered(vec![b.clone(), a.clone()]);
        assert_eq!(sorted[0].uuid, a.uuid);
        assert_eq!(sorted[1].uuid, b.uuid);
    }
}
