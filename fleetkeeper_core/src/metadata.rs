//! DHCP-lease-to-VM metadata lookup (spec §4.9, "C9").
//!
//! Grounded in `original_source/node-daemon/pvcnoded/MetadataAPIInstance.py`'s
//! `get_vm_details`: given the source IP a cloud-init metadata request
//! came from, scan every managed network's DHCP leases for a matching
//! `ip4_address`, take that lease's MAC, then scan every domain's
//! parsed XML for an interface with that MAC. The first match wins;
//! ambiguous configurations (two VMs sharing a MAC) are a
//! misconfiguration this lookup doesn't try to detect.

use std::sync::Arc;

use crate::domain_xml;
use crate::model::{Domain, Network};
use crate::schema::{KeyName, SchemaRegistry};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct VmMetadata {
    pub uuid: String,
    pub name: String,
    pub profile: String,
}

fn mac_for_source_ip(networks: &[Network], source_ip: &str) -> Option<String> {
    networks
        .iter()
        .filter(|n| n.net_type == crate::model::NetworkType::Managed)
        .flat_map(|n| n.dhcp_leases.values())
        .find(|lease| lease.ipaddr == source_ip)
        .map(|lease| lease.mac.clone())
}

fn domain_with_mac(domains: &[Domain], mac: &str) -> Option<VmMetadata> {
    domains.iter().find_map(|d| {
        let parsed = domain_xml::parse(&d.xml).ok()?;
        if parsed.interfaces.iter().any(|i| i.mac_address.eq_ignore_ascii_case(mac)) {
            Some(VmMetadata { uuid: d.uuid.to_string(), name: parsed.name, profile: d.meta.profile.clone() })
        } else {
            None
        }
    })
}

/// Resolve a cloud-init metadata request's source address to the VM
/// that owns it, reading networks and domains fresh from the store
/// (spec §4.9: "no caching; a lookup is a handful of reads against a
/// cluster too small for that to matter").
pub fn lookup(store: &Arc<dyn Store>, source_ip: &str) -> crate::store::Result<Option<VmMetadata>> {
    let schema = SchemaRegistry::current();
    let networks = load_networks(store, &schema)?;
    let mac = match mac_for_source_ip(&networks, source_ip) {
        Some(m) => m,
        None => return Ok(None),
    };
    let domains = load_domains(store, &schema)?;
    Ok(domain_with_mac(&domains, &mac))
}

fn load_networks(store: &Arc<dyn Store>, schema: &SchemaRegistry) -> crate::store::Result<Vec<Network>> {
    let root = schema.path(KeyName::NetworkRoot, &[]);
    let mut out = Vec::new();
    for vni in store.children(&root).unwrap_or_default() {
        let leases_path = schema.path(KeyName::NetworkDhcpLeases, &[&vni]);
        let mut dhcp_leases = std::collections::BTreeMap::new();
        for mac in store.children(&leases_path).unwrap_or_default() {
            if let Ok((data, _)) = store.read(&format!("{}/{}", leases_path, mac)) {
                if let Ok(lease) = serde_json::from_slice(&data) {
                    dhcp_leases.insert(mac, lease);
                }
            }
        }
        // Bridged networks have no DHCP lease table fleetkeeperd manages
        // and must never be scanned for metadata lookups (original
        // `MetadataAPIInstance.py` filters `type == 'managed'` first).
        let net_type = store
            .read(&schema.path(KeyName::NetworkNetType, &[&vni]))
            .ok()
            .map(|(d, _)| String::from_utf8_lossy(&d).into_owned())
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::model::NetworkType::Managed);
        out.push(Network {
            vni: vni.parse().unwrap_or(0),
            net_type,
            description: String::new(),
            domain: String::new(),
            dhcp_leases,
        });
    }
    Ok(out)
}

fn load_domains(store: &Arc<dyn Store>, schema: &SchemaRegistry) -> crate::store::Result<Vec<Domain>> {
    let root = schema.path(KeyName::DomainRoot, &[]);
    let mut out = Vec::new();
    for uuid_str in store.children(&root).unwrap_or_default() {
        let xml_path = schema.path(KeyName::DomainXml, &[&uuid_str]);
        let profile_path = schema.path(KeyName::DomainMetaProfile, &[&uuid_str]);
        let (xml, _) = match store.read(&xml_path) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let profile = store
            .read(&profile_path)
            .ok()
            .map(|(d, _)| String::from_utf8_lossy(&d).into_owned())
            .unwrap_or_default();
        let uuid = match uuid::Uuid::parse_str(&uuid_str) {
            Ok(u) => u,
            Err(_) => continue,
        };
        out.push(Domain {
            uuid,
            state: crate::model::DomainState::Start,
            node: String::new(),
            last_node: String::new(),
            xml: String::from_utf8_lossy(&xml).into_owned(),
            meta: crate::model::DomainMeta { autostart: false, profile },
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DhcpLease;
    use crate::store::fake::FakeStore;
    use crate::store::WriteOp;

    #[test]
    fn resolves_vm_by_dhcp_lease_mac() {
        let store: Arc<dyn Store> = FakeStore::new();
        let schema = SchemaRegistry::current();
        schema.apply(&*store).unwrap();

        let vni = "1001";
        store.write(&[WriteOp::upsert(format!("/networks/{}", vni), Vec::new())]).unwrap();
        store
            .write(&[WriteOp::upsert(schema.path(KeyName::NetworkNetType, &[vni]), b"managed".to_vec())])
            .unwrap();
        let leases_path = schema.path(KeyName::NetworkDhcpLeases, &[vni]);
        store.write(&[WriteOp::upsert(leases_path.clone(), Vec::new())]).unwrap();
        let lease = DhcpLease {
            mac: "52:54:00:12:34:56".to_string(),
            ipaddr: "10.1.0.5".to_string(),
            hostname: "test1".to_string(),
            clientid: String::new(),
            expiry: 0,
        };
        store
            .write(&[WriteOp::upsert(
                format!("{}/{}", leases_path, "52-54-00-12-34-56"),
                serde_json::to_vec(&lease).unwrap(),
            )])
            .unwrap();

        let uuid = "11111111-1111-1111-1111-111111111111";
        store.write(&[WriteOp::upsert(format!("/domains/{}", uuid), Vec::new())]).unwrap();
        let xml = r#"<domain><name>test1</name><uuid>11111111-1111-1111-1111-111111111111</uuid>
            <devices><interface type='bridge'><mac address='52:54:00:12:34:56'/></interface></devices></domain>"#;
        store
            .write(&[WriteOp::upsert(schema.path(KeyName::DomainXml, &[uuid]), xml.as_bytes().to_vec())])
            .unwrap();
        store
            .write(&[WriteOp::upsert(schema.path(KeyName::DomainMetaProfile, &[uuid]), b"default".to_vec())])
            .unwrap();

        let found = lookup(&store, "10.1.0.5").unwrap().expect("vm should resolve");
        assert_eq!(found.uuid, uuid);
        assert_eq!(found.name, "test1");
        assert_eq!(found.profile, "default");
    }

    #[test]
    fn unknown_source_ip_resolves_to_none() {
        let store: Arc<dyn Store> = FakeStore::new();
        SchemaRegistry::current().apply(&*store).unwrap();
        assert!(lookup(&store, "192.0.2.1").unwrap().is_none());
    }

    #[test]
    fn bridged_network_leases_are_not_scanned() {
        let store: Arc<dyn Store> = FakeStore::new();
        let schema = SchemaRegistry::current();
        schema.apply(&*store).unwrap();

        let vni = "2001";
        store.write(&[WriteOp::upsert(format!("/networks/{}", vni), Vec::new())]).unwrap();
        store
            .write(&[WriteOp::upsert(schema.path(KeyName::NetworkNetType, &[vni]), b"bridged".to_vec())])
            .unwrap();
        let leases_path = schema.path(KeyName::NetworkDhcpLeases, &[vni]);
        store.write(&[WriteOp::upsert(leases_path.clone(), Vec::new())]).unwrap();
        let lease = DhcpLease {
            mac: "52:54:00:aa:bb:cc".to_string(),
            ipaddr: "10.2.0.5".to_string(),
            hostname: "bridged-host".to_string(),
            clientid: String::new(),
            expiry: 0,
        };
        store
            .write(&[WriteOp::upsert(
                format!("{}/{}", leases_path, "52-54-00-aa-bb-cc"),
                serde_json::to_vec(&lease).unwrap(),
            )])
            .unwrap();

        assert!(lookup(&store, "10.2.0.5").unwrap().is_none());
    }
}
