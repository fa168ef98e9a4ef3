//! Thin synchronous wrapper over the `virt` crate's libvirt bindings
//! (spec §6 "Libvirt endpoint"). Grounded on the same lookup/create/
//! destroy/migrate call shapes used throughout the retrieval pack's
//! libvirt backends, adapted to this daemon's blocking, no-async
//! concurrency model (spec §5) and `failure`-based error taxonomy.

use std::fmt::{self, Display};

use failure::{Backtrace, Context, Fail};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

#[derive(Debug)]
pub struct LibvirtError {
    inner: Context<LibvirtErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum LibvirtErrKind {
    #[fail(display = "could not connect to libvirt at {}: {}", _0, _1)]
    ConnectFailed(String, String),
    #[fail(display = "domain {} not found: {}", _0, _1)]
    NotFound(String, String),
    #[fail(display = "libvirt operation {} failed for {}: {}", _0, _1, _2)]
    OperationFailed(String, String, String),
}

impl Fail for LibvirtError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for LibvirtError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<LibvirtErrKind> for LibvirtError {
    fn from(kind: LibvirtErrKind) -> LibvirtError {
        LibvirtError { inner: Context::new(kind) }
    }
}
impl From<Context<LibvirtErrKind>> for LibvirtError {
    fn from(inner: Context<LibvirtErrKind>) -> LibvirtError {
        LibvirtError { inner }
    }
}

pub type Result<T> = std::result::Result<T, LibvirtError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainRunState {
    Running,
    Paused,
    ShutOff,
    Crashed,
    Other,
}

fn map_state(state: sys::virDomainState) -> DomainRunState {
    match state {
        sys::VIR_DOMAIN_RUNNING => DomainRunState::Running,
        sys::VIR_DOMAIN_PAUSED => DomainRunState::Paused,
        sys::VIR_DOMAIN_SHUTOFF => DomainRunState::ShutOff,
        sys::VIR_DOMAIN_CRASHED => DomainRunState::Crashed,
        _ => DomainRunState::Other,
    }
}

/// A session to one node's libvirt endpoint (spec §6: "Per-node,
/// reachable as qemu+tcp://<hostname>/system").
pub struct LibvirtSession {
    uri: String,
    conn: Connect,
}

impl LibvirtSession {
    pub fn connect(hostname: &str) -> Result<Self> {
        let uri = format!("qemu+tcp://{}/system", hostname);
        let conn = Connect::open(Some(&uri))
            .map_err(|e| LibvirtErrKind::ConnectFailed(uri.clone(), e.to_string()))?;
        Ok(LibvirtSession { uri, conn })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The wrapper converts a textual UUID and swallows transient
    /// lookup errors (spec §6), surfacing `NotFound` uniformly whether
    /// the domain was never defined or libvirt's RPC hiccuped.
    fn lookup(&self, uuid: &str) -> Result<Domain> {
        Domain::lookup_by_uuid_string(&self.conn, uuid)
            .map_err(|e| LibvirtErrKind::NotFound(uuid.to_string(), e.to_string()).into())
    }

    pub fn exists(&self, uuid: &str) -> bool {
        self.lookup(uuid).is_ok()
    }

    pub fn define(&self, xml: &str) -> Result<()> {
        Domain::define_xml(&self.conn, xml)
            .map(|_| ())
            .map_err(|e| LibvirtErrKind::OperationFailed("define".to_string(), xml_uuid_hint(xml), e.to_string()).into())
    }

    pub fn start(&self, uuid: &str) -> Result<()> {
        let domain = self.lookup(uuid)?;
        if domain.is_active().unwrap_or(false) {
            return Ok(());
        }
        domain
            .create()
            .map(|_| ())
            .map_err(|e| LibvirtErrKind::OperationFailed("start".to_string(), uuid.to_string(), e.to_string()).into())
    }

    pub fn acpi_shutdown(&self, uuid: &str) -> Result<()> {
        let domain = self.lookup(uuid)?;
        domain
            .shutdown()
            .map_err(|e| LibvirtErrKind::OperationFailed("shutdown".to_string(), uuid.to_string(), e.to_string()).into())
    }

    pub fn destroy(&self, uuid: &str) -> Result<()> {
        let domain = self.lookup(uuid)?;
        domain
            .destroy()
            .map_err(|e| LibvirtErrKind::OperationFailed("destroy".to_string(), uuid.to_string(), e.to_string()).into())
    }

    pub fn state(&self, uuid: &str) -> Result<DomainRunState> {
        let domain = self.lookup(uuid)?;
        let (state, _reason) = domain
            .get_state()
            .map_err(|e| LibvirtErrKind::OperationFailed("get_state".to_string(), uuid.to_string(), e.to_string()))?;
        Ok(map_state(state))
    }

    /// Live migration to `target`'s libvirt endpoint (spec §4.6 "Source
    /// invokes live migration to target's libvirt endpoint").
    pub fn migrate_to(&self, uuid: &str, target: &LibvirtSession) -> Result<()> {
        let domain = self.lookup(uuid)?;
        let flags = sys::VIR_MIGRATE_LIVE | sys::VIR_MIGRATE_PERSIST_DEST | sys::VIR_MIGRATE_UNDEFINE_SOURCE;
        domain
            .migrate(&target.conn, flags, None, None, 0)
            .map(|_| ())
            .map_err(|e| LibvirtErrKind::OperationFailed("migrate".to_string(), uuid.to_string(), e.to_string()).into())
    }
}

fn xml_uuid_hint(xml: &str) -> String {
    xml.find("<uuid>")
        .and_then(|start| {
            let after = &xml[start + "<uuid>".len()..];
            after.find("</uuid>").map(|end| after[..end].to_string())
        })
        .unwrap_or_else(|| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_uuid_hint_extracts_uuid_text() {
        let xml = "<domain><uuid>abc-123</uuid></domain>";
        assert_eq!(xml_uuid_hint(xml), "abc-123");
    }

    #[test]
    fn xml_uuid_hint_falls_back_when_absent() {
        assert_eq!(xml_uuid_hint("<domain></domain>"), "<unknown>");
    }
}
