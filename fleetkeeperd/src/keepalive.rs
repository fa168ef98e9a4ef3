//! Node membership & keepalive (spec §4.4, "C4").
//!
//! Owns the periodic heartbeat write and, for coordinator-mode nodes,
//! the exclusive-lock-based primary election described in spec §4.4.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use fleetkeeper_core::model::{DaemonState, Node, NodeMode, RouterState};
use fleetkeeper_core::schema::{KeyName, SchemaRegistry};
use fleetkeeper_core::store::{self, Store, WriteOp};

const STOP_POLL: Duration = Duration::from_millis(100);

/// Shared flag every long-lived task polls to know when to stop (spec
/// §5 "Cancellation and shutdown": "a shared stop signal").
#[derive(Clone)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        StopSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `total`, waking early and returning `true` if a stop
    /// was requested mid-sleep (spec §5: "fine-grained interruptible
    /// sleep, <=100ms poll of a stop flag").
    pub fn interruptible_sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::from_millis(0) {
            if self.is_stopped() {
                return true;
            }
            let step = remaining.min(STOP_POLL);
            thread::sleep(step);
            remaining -= step;
        }
        self.is_stopped()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::new()
    }
}

/// Snapshot of this node's current dynamic metrics, refreshed by the
/// caller before each keepalive tick (memory/cpu/libvirt accounting
/// lives in `vmctl`; this module only writes what it's handed).
#[derive(Debug, Clone, Default)]
pub struct KeepaliveMetrics {
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,
    pub memory_allocated: u64,
    pub memory_provisioned: u64,
    pub cpu_load: f64,
    pub vcpu_allocated: u32,
    pub running_domains: Vec<uuid::Uuid>,
    pub provisioned_domains: u32,
    pub health: u8,
    pub active_schema: u32,
    pub latest_schema: u32,
}

/// Create the node record if absent, otherwise update its static
/// fields (spec §4.4 step 2: "update mode, daemon_state=init, static
/// data, IPMI credentials; create defaults if absent").
pub fn register_node(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    name: &str,
    mode: NodeMode,
    ipmi: fleetkeeper_core::model::IpmiCredentials,
    inventory: fleetkeeper_core::model::NodeInventory,
) -> store::Result<()> {
    let root = schema.path(KeyName::NodeRoot, &[]);
    if !store.exists(&root)? {
        store.write(&[WriteOp::upsert(root, Vec::new())])?;
    }
    let daemon_path = schema.path(KeyName::NodeStateDaemon, &[name]);
    store.write(&[WriteOp::upsert(daemon_path, DaemonState::Init.to_string().into_bytes())])?;
    let mode_str = match mode {
        NodeMode::Coordinator => "coordinator",
        NodeMode::Hypervisor => "hypervisor",
    };
    store.write(&[WriteOp::upsert(schema.path(KeyName::NodeMode, &[name]), mode_str.as_bytes().to_vec())])?;
    store.write(&[WriteOp::upsert(
        schema.path(KeyName::NodeIpmi, &[name]),
        serde_json::to_vec(&ipmi).unwrap_or_default(),
    )])?;
    store.write(&[WriteOp::upsert(
        schema.path(KeyName::NodeInventory, &[name]),
        serde_json::to_vec(&inventory).unwrap_or_default(),
    )])?;
    Ok(())
}

/// One heartbeat write. Best-effort (`WriteOp::upsert`, no version
/// check) since losing a race on the heartbeat field is harmless — the
/// next tick corrects it (spec §4.4 step 3).
pub fn send_keepalive(
    store: &Arc<dyn Store>,
    schema: &SchemaRegistry,
    name: &str,
    metrics: &KeepaliveMetrics,
) -> store::Result<()> {
    let now = Utc::now().timestamp();
    let running_domains_joined = metrics
        .running_domains
        .iter()
        .map(uuid::Uuid::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    store.write(&[
        WriteOp::upsert(schema.path(KeyName::NodeKeepalive, &[name]), now.to_string().into_bytes()),
        WriteOp::upsert(schema.path(KeyName::NodeHealth, &[name]), metrics.health.to_string().into_bytes()),
        WriteOp::upsert(
            schema.path(KeyName::NodeMemory, &[name]),
            format!(
                "{} {} {} {} {}",
                metrics.memory_total,
                metrics.memory_used,
                metrics.memory_free,
                metrics.memory_allocated,
                metrics.memory_provisioned
            )
            .into_bytes(),
        ),
        WriteOp::upsert(schema.path(KeyName::NodeCpuLoad, &[name]), metrics.cpu_load.to_string().into_bytes()),
        WriteOp::upsert(
            schema.path(KeyName::NodeVcpuAllocated, &[name]),
            metrics.vcpu_allocated.to_string().into_bytes(),
        ),
        WriteOp::upsert(schema.path(KeyName::NodeRunningDomains, &[name]), running_domains_joined.into_bytes()),
        WriteOp::upsert(
            schema.path(KeyName::NodeProvisionedDomains, &[name]),
            metrics.provisioned_domains.to_string().into_bytes(),
        ),
        WriteOp::upsert(schema.path(KeyName::NodeActiveSchema, &[name]), metrics.active_schema.to_string().into_bytes()),
        WriteOp::upsert(schema.path(KeyName::NodeLatestSchema, &[name]), metrics.latest_schema.to_string().into_bytes()),
    ])
}

/// Has node `name` missed keepalives for at least `T_dead = 6 * T_k`
/// (spec §4.5 "dead" transition, property 4 "saving-throw
/// correctness")?
pub fn is_stale(last_keepalive: i64, now: i64, keepalive_interval_secs: u64) -> bool {
    let t_dead = 6 * keepalive_interval_secs as i64;
    now - last_keepalive >= t_dead
}

/// Runs the keepalive loop until `stop` is requested. `refresh`
/// recomputes dynamic metrics each tick (memory/cpu/libvirt accounting
/// is owned by the caller, typically `vmctl`).
pub fn run_keepalive_loop<F>(
    store: Arc<dyn Store>,
    schema: SchemaRegistry,
    name: String,
    interval: Duration,
    stop: StopSignal,
    mut refresh: F,
) where
    F: FnMut() -> KeepaliveMetrics,
{
    loop {
        if stop.is_stopped() {
            break;
        }
        let metrics = refresh();
        if let Err(e) = send_keepalive(&store, &schema, &name, &metrics) {
            log::warn!("keepalive write failed for {}: {}", name, e);
        }
        if stop.interruptible_sleep(interval) {
            break;
        }
    }
}

/// Coordinator election (spec §4.4 "Coordinator election"): blocks
/// until `primary_lock` is acquired (or `stop` fires), writes our
/// hostname as the primary, and returns the held lock. The lock's
/// data payload carries the candidate hostname so any watcher can read
/// who holds it without a second round trip.
pub fn attempt_primary_election(
    store: Arc<dyn Store>,
    schema: &SchemaRegistry,
    hostname: &str,
) -> store::Result<Box<dyn store::LockGuard>> {
    let lock_path = schema.path(KeyName::BaseConfigLock, &[]);
    let guard = store::exclusive_lock(store.clone(), &lock_path)?;
    store.write(&[WriteOp::upsert(
        schema.path(KeyName::BaseConfigPrimaryNode, &[]),
        hostname.as_bytes().to_vec(),
    )])?;
    Ok(guard)
}

/// Role cleanup performed by a node that just lost (or relinquished)
/// the primary lock (spec §4.4: "the previous primary... transitions
/// relinquish -> secondary").
pub fn relinquish_primary(store: &Arc<dyn Store>, schema: &SchemaRegistry, name: &str) -> store::Result<()> {
    store.write(&[WriteOp::upsert(
        schema.path(KeyName::NodeStateRouter, &[name]),
        RouterState::Secondary.to_string().into_bytes(),
    )])
}

/// Read a peer node's record for C5/C8 consumption. Missing optional
/// fields default to zero rather than failing the whole read, matching
/// the tolerant-read idiom the rest of this daemon uses for peer data
/// that may lag one keepalive interval behind.
pub fn read_node(store: &Arc<dyn Store>, schema: &SchemaRegistry, name: &str) -> store::Result<Node> {
    let daemon_state = read_str(store, &schema.path(KeyName::NodeStateDaemon, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(DaemonState::Dead);
    let keepalive = read_str(store, &schema.path(KeyName::NodeKeepalive, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let running_domains = Node::parse_running_domains(
        &read_str(store, &schema.path(KeyName::NodeRunningDomains, &[name])).unwrap_or_default(),
    );
    let ipmi = store
        .read(&schema.path(KeyName::NodeIpmi, &[name]))
        .ok()
        .and_then(|(d, _)| serde_json::from_slice(&d).ok())
        .unwrap_or_default();
    let inventory = store
        .read(&schema.path(KeyName::NodeInventory, &[name]))
        .ok()
        .and_then(|(d, _)| serde_json::from_slice(&d).ok())
        .unwrap_or_default();
    let mode = match read_str(store, &schema.path(KeyName::NodeMode, &[name])).as_deref() {
        Some("coordinator") => NodeMode::Coordinator,
        _ => NodeMode::Hypervisor,
    };
    let router_state = read_str(store, &schema.path(KeyName::NodeStateRouter, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(RouterState::Client);
    let domain_state = read_str(store, &schema.path(KeyName::NodeStateDomain, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(fleetkeeper_core::model::NodeDomainState::Ready);
    let health = read_str(store, &schema.path(KeyName::NodeHealth, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
    let memory = read_str(store, &schema.path(KeyName::NodeMemory, &[name]))
        .and_then(|s| parse_node_memory(&s))
        .unwrap_or_default();
    let cpu_load = read_str(store, &schema.path(KeyName::NodeCpuLoad, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    let vcpu_allocated = read_str(store, &schema.path(KeyName::NodeVcpuAllocated, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let provisioned_domains = read_str(store, &schema.path(KeyName::NodeProvisionedDomains, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let active_schema = read_str(store, &schema.path(KeyName::NodeActiveSchema, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let latest_schema = read_str(store, &schema.path(KeyName::NodeLatestSchema, &[name]))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok(Node {
        name: name.to_string(),
        mode,
        daemon_state,
        router_state,
        domain_state,
        health,
        memory,
        vcpu_allocated,
        cpu_load,
        running_domains,
        provisioned_domains,
        keepalive,
        ipmi,
        inventory,
        active_schema,
        latest_schema,
    })
}

/// Inverse of `send_keepalive`'s `"{total} {used} {free} {allocated}
/// {provisioned}"` encoding.
fn parse_node_memory(s: &str) -> Option<fleetkeeper_core::model::NodeMemory> {
    let mut parts = s.split_whitespace();
    Some(fleetkeeper_core::model::NodeMemory {
        total: parts.next()?.parse().ok()?,
        used: parts.next()?.parse().ok()?,
        free: parts.next()?.parse().ok()?,
        allocated: parts.next()?.parse().ok()?,
        provisioned: parts.next()?.parse().ok()?,
    })
}

fn read_str(store: &Arc<dyn Store>, path: &str) -> Option<String> {
    store.read(path).ok().map(|(d, _)| String::from_utf8_lossy(&d).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetkeeper_core::store::fake::FakeStore;

    #[test]
    fn staleness_threshold_is_six_intervals() {
        assert!(!is_stale(100, 100 + 29, 5));
        assert!(is_stale(100, 100 + 30, 5));
    }

    #[test]
    fn register_then_keepalive_round_trips() {
        let store: Arc<dyn Store> = FakeStore::new();
        let schema = SchemaRegistry::current();
        schema.apply(&*store).unwrap();
        register_node(
            &store,
            &schema,
            "hv1",
            NodeMode::Hypervisor,
            Default::default(),
            Default::default(),
        )
        .unwrap();
        let metrics = KeepaliveMetrics {
            cpu_load: 0.5,
            memory_total: 16000,
            memory_used: 4000,
            memory_free: 12000,
            memory_allocated: 2000,
            memory_provisioned: 3000,
            vcpu_allocated: 4,
            provisioned_domains: 2,
            health: 87,
            active_schema: 3,
            latest_schema: 4,
            ..Default::default()
        };
        send_keepalive(&store, &schema, "hv1", &metrics).unwrap();
        let node = read_node(&store, &schema, "hv1").unwrap();
        assert_eq!(node.daemon_state, DaemonState::Init);
        assert_eq!(node.cpu_load, 0.5);
        assert_eq!(node.memory.total, 16000);
        assert_eq!(node.memory.allocated, 2000);
        assert_eq!(node.vcpu_allocated, 4);
        assert_eq!(node.provisioned_domains, 2);
        assert_eq!(node.health, 87);
        assert_eq!(node.active_schema, 3);
        assert_eq!(node.latest_schema, 4);
    }

    #[test]
    fn stop_signal_interrupts_sleep_immediately() {
        let stop = StopSignal::new();
        stop.request_stop();
        let interrupted = stop.interruptible_sleep(Duration::from_secs(5));
        assert!(interrupted);
    }
}
