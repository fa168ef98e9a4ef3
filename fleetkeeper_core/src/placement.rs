//! VM placement selectors (spec §4.7, "C7").
//!
//! Each selector picks one candidate node out of a slice of eligible
//! nodes (already filtered by the caller to `daemon_state == Run` and
//! `domain_state == Ready`); `None` means no eligible candidate existed.
//! Ties are always broken by node name, ascending, so placement is
//! deterministic given the same cluster snapshot (spec §4.7, §8).

use crate::model::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Mem,
    Load,
    Vcpus,
    Vms,
}

impl std::str::FromStr for Selector {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s {
            "mem" => Selector::Mem,
            "load" => Selector::Load,
            "vcpus" => Selector::Vcpus,
            "vms" => Selector::Vms,
            _ => return Err(()),
        })
    }
}

/// Picks the node with the most free memory headroom.
fn by_mem(nodes: &[Node]) -> Option<&Node> {
    best_by(nodes, |n| std::cmp::Reverse(n.memory_headroom()))
}

/// Picks the node with the lowest reported load average.
fn by_load(nodes: &[Node]) -> Option<&Node> {
    best_by(nodes, |n| ordered_float(n.cpu_load))
}

/// Picks the node with the fewest vCPUs currently allocated.
fn by_vcpus(nodes: &[Node]) -> Option<&Node> {
    best_by(nodes, |n| n.vcpu_allocated)
}

/// Picks the node provisioned with the fewest VMs (spec §4.7: minimize
/// `count.provisioned_domains`, not the count of currently-running
/// domains — a node can be provisioned for a VM that's stopped).
fn by_vms(nodes: &[Node]) -> Option<&Node> {
    best_by(nodes, |n| n.provisioned_domains)
}

/// `f64` has no total order, but load averages are never NaN in
/// practice; map through a `u64` bit pattern so we can still use
/// `Ord`-based tie-breaking without pulling in an ordered-float crate.
fn ordered_float(f: f64) -> u64 {
    let bits = f.to_bits();
    if f >= 0.0 {
        bits | (1 << 63)
    } else {
        !bits
    }
}

fn best_by<K: Ord, F: Fn(&Node) -> K>(nodes: &[Node], key: F) -> Option<&Node> {
    nodes
        .iter()
        .min_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name)))
}

/// Select a target node for a new VM instance (spec §4.7: "the
/// selector function is one of four and is configured cluster-wide").
pub fn select<'a>(selector: Selector, nodes: &'a [Node]) -> Option<&'a Node> {
    match selector {
        Selector::Mem => by_mem(nodes),
        Selector::Load => by_load(nodes),
        Selector::Vcpus => by_vcpus(nodes),
        Selector::Vms => by_vms(nodes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DaemonState, IpmiCredentials, NodeDomainState, NodeInventory, NodeMemory, NodeMode, RouterState};

    fn node(name: &str, free: u64, load: f64, vcpus: u32, vms: usize) -> Node {
        Node {
            name: name.to_string(),
            mode: NodeMode::Hypervisor,
            daemon_state: DaemonState::Run,
            router_state: RouterState::Client,
            domain_state: NodeDomainState::Ready,
            health: 100,
            memory: NodeMemory { total: free, used: 0, free, allocated: 0, provisioned: 0 },
            vcpu_allocated: vcpus,
            cpu_load: load,
            running_domains: (0..vms).map(|_| uuid::Uuid::new_v4()).collect(),
            provisioned_domains: vms as u32,
            keepalive: 0,
            ipmi: IpmiCredentials::default(),
            inventory: NodeInventory::default(),
            active_schema: 0,
            latest_schema: 0,
        }
    }

    #[test]
    fn selects_most_free_memory() {
        let nodes = vec![node("a", 1000, 0.1, 4, 2), node("b", 4000, 0.1, 4, 2)];
        assert_eq!(select(Selector::Mem, &nodes).unwrap().name, "b");
    }

    #[test]
    fn selects_lowest_load() {
        let nodes = vec![node("a", 1000, 0.9, 4, 2), node("b", 1000, 0.1, 4, 2)];
        assert_eq!(select(Selector::Load, &nodes).unwrap().name, "b");
    }

    #[test]
    fn ties_break_by_node_name() {
        let nodes = vec![node("zeta", 1000, 0.1, 4, 2), node("alpha", 1000, 0.1, 4, 2)];
        assert_eq!(select(Selector::Mem, &nodes).unwrap().name, "alpha");
    }

    #[test]
    fn empty_candidate_set_yields_none() {
        let nodes: Vec<Node> = Vec::new();
        assert!(select(Selector::Vms, &nodes).is_none());
    }

    #[test]
    fn vms_selector_minimizes_provisioned_not_running() {
        // "a" has a stopped VM it's still provisioned for (1 running, 3
        // provisioned); "b" has fewer VMs provisioned overall even though
        // more of them happen to be running right now.
        let mut a = node("a", 1000, 0.1, 4, 1);
        a.provisioned_domains = 3;
        let mut b = node("b", 1000, 0.1, 4, 2);
        b.provisioned_domains = 2;
        let nodes = vec![a, b];
        assert_eq!(select(Selector::Vms, &nodes).unwrap().name, "b");
    }
}
