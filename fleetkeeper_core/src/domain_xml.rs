//! Minimal libvirt domain XML reader (spec §4.6, "C6" subcomponent).
//!
//! We only need enough of the `<domain>` document to answer placement
//! and metadata questions — disk paths, network interface MAC/bridge
//! pairs, and controller models — so this is a streaming scan with
//! `quick_xml`, not a full DOM, matching spec §4.1's "nothing in this
//! system needs a general-purpose XML DOM".

use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub device: String,
    pub driver_type: String,
    pub source_path: String,
    pub target_dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub mac_address: String,
    pub source_bridge: String,
    pub model_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    pub controller_type: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDomain {
    pub name: String,
    pub uuid: String,
    pub memory_kib: u64,
    pub vcpu: u32,
    pub disks: Vec<Disk>,
    pub interfaces: Vec<Interface>,
    pub controllers: Vec<Controller>,
}

#[derive(Debug, Fail)]
pub enum DomainXmlError {
    #[fail(display = "malformed domain XML: {}", _0)]
    Malformed(String),
}

fn attr(e: &quick_xml::events::BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key == name)
        .and_then(|a| a.unescaped_value().ok().map(|v| String::from_utf8_lossy(&v).into_owned()))
}

/// Parse a libvirt domain XML document into the subset of fields this
/// daemon cares about.
pub fn parse(xml: &str) -> Result<ParsedDomain, DomainXmlError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut doc = ParsedDomain::default();

    // Track which element we're nested inside, since `<disk>` and
    // `<interface>` carry their interesting data on *child* elements
    // (<source>, <target>, <mac>), not on the opening tag itself.
    let mut in_disk: Option<Disk> = None;
    let mut in_interface: Option<Interface> = None;

    loop {
        match reader.read_event(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = e.name().to_vec();
                match name.as_slice() {
                    b"uuid" => {
                        if let Ok(Event::Text(t)) = reader.read_event(&mut buf) {
                            doc.uuid = t.unescape_and_decode(&reader).unwrap_or_default();
                        }
                    }
                    b"name" => {
                        if let Ok(Event::Text(t)) = reader.read_event(&mut buf) {
                            doc.name = t.unescape_and_decode(&reader).unwrap_or_default();
                        }
                    }
                    b"memory" => {
                        if let Ok(Event::Text(t)) = reader.read_event(&mut buf) {
                            doc.memory_kib =
                                t.unescape_and_decode(&reader).unwrap_or_default().parse().unwrap_or(0);
                        }
                    }
                    b"vcpu" => {
                        if let Ok(Event::Text(t)) = reader.read_event(&mut buf) {
                            doc.vcpu = t.unescape_and_decode(&reader).unwrap_or_default().parse().unwrap_or(0);
                        }
                    }
                    b"disk" => {
                        in_disk = Some(Disk {
                            device: attr(e, b"device").unwrap_or_default(),
                            driver_type: String::new(),
                            source_path: String::new(),
                            target_dev: String::new(),
                        });
                    }
                    b"interface" => {
                        in_interface = Some(Interface {
                            mac_address: String::new(),
                            source_bridge: String::new(),
                            model_type: String::new(),
                        });
                    }
                    b"controller" => {
                        doc.controllers.push(Controller {
                            controller_type: attr(e, b"type").unwrap_or_default(),
                            model: attr(e, b"model").unwrap_or_default(),
                        });
                    }
                    b"driver" if in_disk.is_some() => {
                        if let Some(d) = in_disk.as_mut() {
                            d.driver_type = attr(e, b"type").unwrap_or_default();
                        }
                    }
                    b"source" if in_disk.is_some() => {
                        if let Some(d) = in_disk.as_mut() {
                            d.source_path =
                                attr(e, b"file").or_else(|| attr(e, b"dev")).unwrap_or_default();
                        }
                    }
                    b"source" if in_interface.is_some() => {
                        if let Some(i) = in_interface.as_mut() {
                            i.source_bridge = attr(e, b"bridge").unwrap_or_default();
                        }
                    }
                    b"target" if in_disk.is_some() => {
                        if let Some(d) = in_disk.as_mut() {
                            d.target_dev = attr(e, b"dev").unwrap_or_default();
                        }
                    }
                    b"mac" if in_interface.is_some() => {
                        if let Some(i) = in_interface.as_mut() {
                            i.mac_address = attr(e, b"address").unwrap_or_default();
                        }
                    }
                    b"model" if in_interface.is_some() => {
                        if let Some(i) = in_interface.as_mut() {
                            i.model_type = attr(e, b"type").unwrap_or_default();
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => match e.name() {
                b"disk" => {
                    if let Some(d) = in_disk.take() {
                        doc.disks.push(d);
                    }
                }
                b"interface" => {
                    if let Some(i) = in_interface.take() {
                        doc.interfaces.push(i);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DomainXmlError::Malformed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if doc.uuid.is_empty() {
        return Err(DomainXmlError::Malformed("missing <uuid>".to_string()));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
<domain type='kvm'>
  <name>test1</name>
  <uuid>11111111-1111-1111-1111-111111111111</uuid>
  <memory unit='KiB'>1048576</memory>
  <vcpu>2</vcpu>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/test1_sda.img'/>
      <target dev='sda' bus='scsi'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:12:34:56'/>
      <source bridge='vmbr1001'/>
      <model type='virtio'/>
    </interface>
    <controller type='scsi' model='virtio-scsi'/>
  </devices>
</domain>
"#;

    #[test]
    fn parses_name_uuid_and_resources() {
        let d = parse(SAMPLE).unwrap();
        assert_eq!(d.name, "test1");
        assert_eq!(d.uuid, "11111111-1111-1111-1111-111111111111");
        assert_eq!(d.memory_kib, 1048576);
        assert_eq!(d.vcpu, 2);
    }

    #[test]
    fn parses_disk_and_interface_and_controller() {
        let d = parse(SAMPLE).unwrap();
        assert_eq!(d.disks.len(), 1);
        assert_eq!(d.disks[0].source_path, "/var/lib/libvirt/images/test1_sda.img");
        assert_eq!(d.disks[0].target_dev, "sda");
        assert_eq!(d.interfaces.len(), 1);
        assert_eq!(d.interfaces[0].mac_address, "52:54:00:12:34:56");
        assert_eq!(d.interfaces[0].source_bridge, "vmbr1001");
        assert_eq!(d.controllers.len(), 1);
        assert_eq!(d.controllers[0].model, "virtio-scsi");
    }

    #[test]
    fn rejects_xml_missing_uuid() {
        assert!(parse("<domain><name>x</name></domain>").is_err());
    }
}
