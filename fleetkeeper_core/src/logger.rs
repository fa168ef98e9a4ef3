//! Logger and fault sink (spec §4.3, "C3").
//!
//! Two halves: a structured node-local log stream (thin wrapper over
//! the `log` crate's macros, configured by the daemon's CLI entrypoint
//! per spec §6) and a bounded per-node ring persisted in the
//! coordination store plus a fault table, both guarded against
//! concurrent writers the way the teacher guards Vault/Slack calls —
//! with a typed error kind per failure mode.

use std::sync::Arc;

use chrono::Utc;
use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

use crate::schema::{KeyName, SchemaRegistry};
use crate::store::{Store, WriteOp};

#[derive(Debug)]
pub struct LogError {
    inner: Context<LogErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum LogErrKind {
    #[fail(display = "could not append to log ring for {}: {}", _0, _1)]
    RingAppendFailed(String, String),
    #[fail(display = "could not read fault {}: {}", _0, _1)]
    FaultReadFailed(String, String),
}

impl Fail for LogError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<LogErrKind> for LogError {
    fn from(kind: LogErrKind) -> LogError {
        LogError { inner: Context::new(kind) }
    }
}
impl From<Context<LogErrKind>> for LogError {
    fn from(inner: Context<LogErrKind>) -> LogError {
        LogError { inner }
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Appends to the bounded per-node log ring stored at
/// `node.state.daemon`'s sibling key (spec §4.3: "a newline-joined
/// string whose writes are guarded by a write-lock on the ring key, and
/// is clamped to `node_log_lines` entries (drop oldest)").
pub struct RingLogger {
    store: Arc<dyn Store>,
    schema: SchemaRegistry,
    node: String,
    max_lines: usize,
}

impl RingLogger {
    pub fn new(store: Arc<dyn Store>, node: impl Into<String>, max_lines: usize) -> Self {
        RingLogger { store, schema: SchemaRegistry::current(), node: node.into(), max_lines }
    }

    pub fn append(&self, line: &str) -> Result<()> {
        let path = self.schema.path(KeyName::NodeLogRing, &[&self.node]);
        let _guard = crate::store::write_lock(self.store.clone(), &format!("{}.lock", path))
            .map_err(|e| LogErrKind::RingAppendFailed(path.clone(), e.to_string()))?;
        let (data, version) = self.store.read(&path).unwrap_or((Vec::new(), -1));
        let existing = String::from_utf8_lossy(&data);
        let mut lines: Vec<&str> = if existing.is_empty() {
            Vec::new()
        } else {
            existing.lines().collect()
        };
        lines.push(line);
        let start = lines.len().saturating_sub(self.max_lines);
        let joined = lines[start..].join("\n");
        let op = if version >= 0 {
            WriteOp::checked(path.clone(), joined.into_bytes(), version)
        } else {
            WriteOp::upsert(path.clone(), joined.into_bytes())
        };
        self.store.write(&[op]).map_err(|e| LogErrKind::RingAppendFailed(path, e.to_string()))?;
        Ok(())
    }
}

/// Generates and queries fault records (spec §4.3, §3 "Fault").
///
/// Fault *generation* is suppressed while `config.maintenance == true`
/// (spec §4.3), matching the fence executor's own maintenance check so
/// a planned outage doesn't spam the fault table.
pub struct FaultSink {
    store: Arc<dyn Store>,
    schema: SchemaRegistry,
}

impl FaultSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        FaultSink { store, schema: SchemaRegistry::current() }
    }

    fn maintenance_enabled(&self) -> bool {
        let path = self.schema.path(KeyName::BaseConfigMaintenance, &[]);
        self.store
            .read(&path)
            .ok()
            .map(|(d, _)| d == b"true")
            .unwrap_or(false)
    }

    /// Coalesce onto `name` if it already exists, else create it (spec
    /// §4.3, §8 round-trip law: `generate(x); generate(x)` leaves one
    /// fault with `first_time` unchanged and `last_time` advanced).
    pub fn generate(&self, name: &str, delta: i64, message: &str, details: Option<&str>) -> Result<()> {
        if self.maintenance_enabled() {
            return Ok(());
        }
        let path = format!("{}/{}", self.schema.path(KeyName::FaultRoot, &[]), name);
        let now = Utc::now();
        // Whether to coalesce hinges on whether the fault already exists
        // in the store, not on whether its fields happen to match this
        // call's — two back-to-back identical `generate` calls must
        // still coalesce the second one (spec §8 round-trip law).
        let mut fault = match self.store.read(&path) {
            Ok((data, _)) => {
                let mut fault: crate::model::Fault = serde_json::from_slice(&data)
                    .unwrap_or_else(|_| crate::model::Fault::new(name, now, delta, message));
                fault.coalesce(now, delta, message);
                fault
            }
            Err(_) => crate::model::Fault::new(name, now, delta, message),
        };
        fault.details = details.map(str::to_string).or(fault.details);
        let encoded = serde_json::to_vec(&fault)
            .map_err(|e| LogErrKind::RingAppendFailed(path.clone(), e.to_string()))?;
        self.store
            .write(&[WriteOp::upsert(path.clone(), encoded)])
            .map_err(|e| LogErrKind::RingAppendFailed(path, e.to_string()))?;
        Ok(())
    }

    /// Idempotent acknowledge (spec §8).
    pub fn acknowledge(&self, name: &str) -> Result<()> {
        let path = format!("{}/{}", self.schema.path(KeyName::FaultRoot, &[]), name);
        let (data, version) = self
            .store
            .read(&path)
            .map_err(|e| LogErrKind::FaultReadFailed(path.clone(), e.to_string()))?;
        let mut fault: crate::model::Fault = serde_json::from_slice(&data)
            .map_err(|e| LogErrKind::FaultReadFailed(path.clone(), e.to_string()))?;
        fault.acknowledge(Utc::now());
        let encoded = serde_json::to_vec(&fault)
            .map_err(|e| LogErrKind::FaultReadFailed(path.clone(), e.to_string()))?;
        self.store
            .write(&[WriteOp::checked(path.clone(), encoded, version)])
            .map_err(|e| LogErrKind::RingAppendFailed(path, e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = format!("{}/{}", self.schema.path(KeyName::FaultRoot, &[]), name);
        self.store.delete(&path, false).map_err(|e| LogErrKind::FaultReadFailed(path, e.to_string()))?;
        Ok(())
    }

    /// Sort key for fault listings (spec §4.3: "Queries are
    /// paginated/sortable on first_reported, last_reported,
    /// acknowledged_at, status, health_delta, message (time keys sort
    /// newest-first)").
    pub fn list(&self, sort: FaultSort) -> Result<Vec<crate::model::Fault>> {
        let root = self.schema.path(KeyName::FaultRoot, &[]);
        let mut faults = Vec::new();
        for name in self.store.children(&root).unwrap_or_default() {
            let path = format!("{}/{}", root, name);
            if let Ok((data, _)) = self.store.read(&path) {
                if let Ok(f) = serde_json::from_slice::<crate::model::Fault>(&data) {
                    faults.push(f);
                }
            }
        }
        match sort {
            FaultSort::FirstReported => faults.sort_by(|a, b| b.first_time.cmp(&a.first_time)),
            FaultSort::LastReported => faults.sort_by(|a, b| b.last_time.cmp(&a.last_time)),
            FaultSort::AcknowledgedAt => faults.sort_by(|a, b| b.ack_time.cmp(&a.ack_time)),
            FaultSort::Status => faults.sort_by_key(|f| f.status),
            FaultSort::HealthDelta => faults.sort_by_key(|f| f.delta),
            FaultSort::Message => faults.sort_by(|a, b| a.message.cmp(&b.message)),
        }
        Ok(faults)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FaultSort {
    FirstReported,
    LastReported,
    AcknowledgedAt,
    Status,
    HealthDelta,
    Message,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeStore;

    #[test]
    fn ring_logger_clamps_to_max_lines() {
        let store = FakeStore::new();
        let logger = RingLogger::new(store.clone(), "hv1", 3);
        for i in 0..5 {
            logger.append(&format!("line {}", i)).unwrap();
        }
        let path = SchemaRegistry::current().path(KeyName::NodeLogRing, &["hv1"]);
        let (data, _) = store.read(&path).unwrap();
        let text = String::from_utf8(data).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn fault_generate_is_idempotent_on_repeat() {
        let store = FakeStore::new();
        let sink = FaultSink::new(store.clone());
        sink.generate("peer-dead/hv1", 1, "hv1 missed keepalive", None).unwrap();
        let path = SchemaRegistry::current().path(KeyName::FaultRoot, &[]) + "/peer-dead/hv1";
        let (data, _) = store.read(&path).unwrap();
        let first: crate::model::Fault = serde_json::from_slice(&data).unwrap();

        sink.generate("peer-dead/hv1", 1, "hv1 missed keepalive", None).unwrap();
        let faults = sink.list(FaultSort::FirstReported).unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].first_time, first.first_time);
        assert!(faults[0].last_time >= first.last_time);
    }

    #[test]
    fn fault_generation_suppressed_during_maintenance() {
        let store = FakeStore::new();
        store
            .write(&[WriteOp::upsert(
                SchemaRegistry::current().path(KeyName::BaseConfigMaintenance, &[]),
                b"true".to_vec(),
            )])
            .unwrap();
        let sink = FaultSink::new(store.clone());
        sink.generate("x", 1, "msg", None).unwrap();
        assert!(sink.list(FaultSort::FirstReported).unwrap().is_empty());
    }
}
