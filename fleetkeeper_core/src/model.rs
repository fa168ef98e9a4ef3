//! Core entities of the cluster data model (spec §3).
//!
//! These are plain serde-friendly structs; nothing here talks to the
//! store directly; see `schema` for symbolic-name-to-path resolution
//! and `store` for the client that reads/writes the bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A node's operating mode: does it participate in cluster-level
/// coordination (`Coordinator`) or only run VMs (`Hypervisor`)?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Coordinator,
    Hypervisor,
}

/// Node-local daemon lifecycle (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonState {
    Init,
    Run,
    Stop,
    Dead,
    Shutdown,
    FenceFlush,
}

/// Router (coordinator) role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterState {
    Primary,
    Secondary,
    Client,
    Takeover,
    Relinquish,
}

/// Domain-scheduling readiness of a node (distinct from `DaemonState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDomainState {
    Ready,
    Flush,
    Flushed,
    Unflush,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DaemonState::Init => "init",
            DaemonState::Run => "run",
            DaemonState::Stop => "stop",
            DaemonState::Dead => "dead",
            DaemonState::Shutdown => "shutdown",
            DaemonState::FenceFlush => "fence-flush",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RouterState::Primary => "primary",
            RouterState::Secondary => "secondary",
            RouterState::Client => "client",
            RouterState::Takeover => "takeover",
            RouterState::Relinquish => "relinquish",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RouterState {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "primary" => RouterState::Primary,
            "secondary" => RouterState::Secondary,
            "client" => RouterState::Client,
            "takeover" => RouterState::Takeover,
            "relinquish" => RouterState::Relinquish,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for NodeDomainState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NodeDomainState::Ready => "ready",
            NodeDomainState::Flush => "flush",
            NodeDomainState::Flushed => "flushed",
            NodeDomainState::Unflush => "unflush",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NodeDomainState {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "ready" => NodeDomainState::Ready,
            "flush" => NodeDomainState::Flush,
            "flushed" => NodeDomainState::Flushed,
            "unflush" => NodeDomainState::Unflush,
            _ => return Err(()),
        })
    }
}

impl FromStr for DaemonState {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "init" => DaemonState::Init,
            "run" => DaemonState::Run,
            "stop" => DaemonState::Stop,
            "dead" => DaemonState::Dead,
            "shutdown" => DaemonState::Shutdown,
            "fence-flush" => DaemonState::FenceFlush,
            _ => return Err(()),
        })
    }
}

/// Static inventory recorded once at first daemon start (spec §3 "static
/// inventory"; elaborated as its own struct per SPEC_FULL §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInventory {
    pub cpu_count: u32,
    pub kernel: String,
    pub os: String,
    pub arch: String,
}

/// Memory accounting for a node, in MiB.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub allocated: u64,
    pub provisioned: u64,
}

/// IPMI credentials for a node, used exclusively by the fence executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpmiCredentials {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

/// A physical host (spec §3 "Node").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub mode: NodeMode,
    pub daemon_state: DaemonState,
    pub router_state: RouterState,
    pub domain_state: NodeDomainState,
    pub health: u8,
    pub memory: NodeMemory,
    pub vcpu_allocated: u32,
    pub cpu_load: f64,
    /// VM UUIDs currently understood to be running on this node.
    pub running_domains: Vec<Uuid>,
    pub provisioned_domains: u32,
    /// Epoch seconds of the last successful keepalive write.
    pub keepalive: i64,
    pub ipmi: IpmiCredentials,
    pub inventory: NodeInventory,
    pub active_schema: u32,
    pub latest_schema: u32,
}

impl Node {
    /// Whitespace-joined `running_domains`, matching the on-the-wire
    /// codec spec §4.1 calls out for list-typed values.
    pub fn running_domains_joined(&self) -> String {
        self.running_domains
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn parse_running_domains(s: &str) -> Vec<Uuid> {
        s.split_whitespace()
            .filter_map(|tok| Uuid::parse_str(tok).ok())
            .collect()
    }

    /// Headroom used by the `mem` placement selector.
    pub fn memory_headroom(&self) -> i64 {
        self.memory.total as i64 - self.memory.allocated as i64
    }
}

/// VM lifecycle state (spec §3 "Domain").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Start,
    Restart,
    Shutdown,
    Stop,
    Disable,
    Fail,
    Migrate,
    Unmigrate,
    Provision,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DomainState::Start => "start",
            DomainState::Restart => "restart",
            DomainState::Shutdown => "shutdown",
            DomainState::Stop => "stop",
            DomainState::Disable => "disable",
            DomainState::Fail => "fail",
            DomainState::Migrate => "migrate",
            DomainState::Unmigrate => "unmigrate",
            DomainState::Provision => "provision",
        };
        write!(f, "{}", s)
    }
}

/// Priority used by the node state machine's deterministic VM iteration
/// order (spec §4.5: "sort VMs by (state_priority, uuid) where
/// state_priority puts migrate before start before others").
pub fn state_priority(state: DomainState) -> u8 {
    match state {
        DomainState::Migrate => 0,
        DomainState::Start => 1,
        _ => 2,
    }
}

/// Metadata consumed by the external cloud-init metadata service (C9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainMeta {
    pub autostart: bool,
    pub profile: String,
}

/// A managed virtual machine (spec §3 "Domain").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub uuid: Uuid,
    pub state: DomainState,
    pub node: String,
    pub last_node: String,
    pub xml: String,
    pub meta: DomainMeta,
}

/// Fault status (spec §3 "Fault").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultStatus {
    New,
    Ack,
}

/// A health event keyed by a symbolic fault id (spec §3 "Fault").
///
/// `details` is a SPEC_FULL §3 supplement pulled from
/// `original_source/daemon-common/faults.py`: a free-form blob (command
/// output, stack trace) kept separate from the one-line `message` so
/// that paginated fault listings stay terse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub id: String,
    pub first_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    pub ack_time: Option<DateTime<Utc>>,
    pub status: FaultStatus,
    pub delta: i64,
    pub message: String,
    pub details: Option<String>,
}

impl Fault {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, delta: i64, message: impl Into<String>) -> Self {
        Fault {
            id: id.into(),
            first_time: now,
            last_time: now,
            ack_time: None,
            status: FaultStatus::New,
            delta,
            message: message.into(),
            details: None,
        }
    }

    /// Coalesce a repeat observation onto an existing fault (spec §8:
    /// `generate_fault(x); generate_fault(x)` leaves one fault with
    /// `first_time` unchanged and `last_time` advanced).
    pub fn coalesce(&mut self, now: DateTime<Utc>, delta: i64, message: impl Into<String>) {
        self.last_time = now;
        self.delta = delta;
        self.message = message.into();
    }

    /// Idempotent acknowledge (spec §8: `acknowledge(f); acknowledge(f)`
    /// is idempotent).
    pub fn acknowledge(&mut self, now: DateTime<Utc>) {
        self.status = FaultStatus::Ack;
        self.ack_time = Some(now);
        self.delta = 0;
    }
}

/// A DHCP lease record, read-only input to C9 (spec §3 "Network").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpLease {
    pub mac: String,
    pub ipaddr: String,
    pub hostname: String,
    pub clientid: String,
    pub expiry: i64,
}

/// Overlay network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Managed,
    Bridged,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NetworkType::Managed => "managed",
            NetworkType::Bridged => "bridged",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NetworkType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "managed" => NetworkType::Managed,
            "bridged" => NetworkType::Bridged,
            _ => return Err(()),
        })
    }
}

/// An overlay VNI (spec §3 "Network"). `description`/`domain` are a
/// SPEC_FULL §3 supplement from
/// `original_source/router-daemon/pvcrd/VXNetworkInstance.py`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub vni: u32,
    pub net_type: NetworkType,
    pub description: String,
    pub domain: String,
    pub dhcp_leases: BTreeMap<String, DhcpLease>,
}

/// Cluster-wide configuration keys stored in the coordination store
/// itself (as opposed to the daemon's local YAML config, see
/// `fleetkeeperd::config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub maintenance: bool,
    pub primary_node: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_domains_round_trip() {
        let ids = vec![Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
                        Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap()];
        let node = Node {
            name: "hv1".into(),
            mode: NodeMode::Hypervisor,
            daemon_state: DaemonState::Run,
            router_state: RouterState::Client,
            domain_state: NodeDomainState::Ready,
            health: 100,
            memory: NodeMemory::default(),
            vcpu_allocated: 0,
            cpu_load: 0.0,
            running_domains: ids.clone(),
            provisioned_domains: 2,
            keepalive: 0,
            ipmi: IpmiCredentials::default(),
            inventory: NodeInventory::default(),
            active_schema: 0,
            latest_schema: 0,
        };
        let joined = node.running_domains_joined();
        assert_eq!(Node::parse_running_domains(&joined), ids);
    }

    #[test]
    fn state_priority_orders_migrate_before_start_before_rest() {
        assert!(state_priority(DomainState::Migrate) < state_priority(DomainState::Start));
        assert!(state_priority(DomainState::Start) < state_priority(DomainState::Stop));
    }

    #[test]
    fn fault_coalesce_preserves_first_time() {
        use chrono::TimeZone;
        let t0 = Utc.ymd(2026, 1, 1).and_hms(0, 0, 0);
        let t1 = Utc.ymd(2026, 1, 1).and_hms(0, 5, 0);
        let mut f = Fault::new("peer-dead/hv1", t0, 1, "node hv1 missed keepalive");
        f.coalesce(t1, 2, "node hv1 missed keepalive (again)");
        assert_eq!(f.first_time, t0);
        assert_eq!(f.last_time, t1);
        assert_eq!(f.delta, 2);
    }

    #[test]
    fn fault_acknowledge_is_idempotent() {
        use chrono::TimeZone;
        let t0 = Utc.ymd(2026, 1, 1).and_hms(0, 0, 0);
        let mut f = Fault::new("x", t0, 5, "msg");
        f.acknowledge(t0);
        let snap = f.clone();
        f.acknowledge(t0);
        assert_eq!(snap.status, f.status);
        assert_eq!(snap.ack_time, f.ack_time);
        assert_eq!(f.delta, 0);
    }
}
