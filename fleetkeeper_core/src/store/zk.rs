//! ZooKeeper-backed `Store` (spec §4.1, "a strongly-consistent
//! coordination store ... ZooKeeper-style hierarchical keys with
//! watches, versioned writes, ephemeral leases, and recursive locks").

use std::sync::{Arc, Mutex};
use std::time::Duration;

use zookeeper::{Acl, CreateMode, WatchedEvent, Watcher, ZkError, ZkState, ZooKeeper};

use super::{Result, SessionEvent, Store, StoreErrKind, WatchAction, WatchCallback, WatchEvent, WriteOp};

/// Forwards raw ZK session events to our `SessionEvent` listeners; this
/// is the `Watcher` zk-rs requires at `connect` time (spec §4.1:
/// "emits SUSPENDED/CONNECTED/LOST events to listeners").
struct SessionWatcher {
    listeners: Arc<Mutex<Vec<Box<dyn Fn(SessionEvent) + Send + Sync>>>>,
}

impl Watcher for SessionWatcher {
    fn handle(&self, event: WatchedEvent) {
        let mapped = match event.keeper_state {
            ZkState::Connected | ZkState::ConnectedReadOnly => Some(SessionEvent::Connected),
            ZkState::NotConnected => Some(SessionEvent::Suspended),
            ZkState::Closed | ZkState::AuthFailed => Some(SessionEvent::Lost),
            _ => None,
        };
        if let Some(ev) = mapped {
            for l in self.listeners.lock().unwrap().iter() {
                l(ev);
            }
        }
    }
}

/// Registers a data watch and, on `WatchAction::Rearm`, re-registers
/// itself from inside the fired callback. ZK watches are one-shot by
/// protocol (the server drops the registration the instant it fires),
/// so "continuous observation" only exists if the caller re-issues
/// `get_data_w` every time — this recursion is that re-issue.
fn register_data_watch(zk: Arc<ZooKeeper>, path: String, cb: Arc<WatchCallback>) -> Result<()> {
    let (data, _stat) = zk
        .get_data_w(&path, {
            let zk = zk.clone();
            let path = path.clone();
            let cb = cb.clone();
            move |event: WatchedEvent| {
                let mapped = match event.event_type {
                    zookeeper::WatchedEventType::NodeDataChanged => Some(WatchEvent::DataChanged),
                    zookeeper::WatchedEventType::NodeDeleted => Some(WatchEvent::Deleted),
                    _ => None,
                };
                if let Some(ev) = mapped {
                    if cb(ev, None) == WatchAction::Rearm {
                        let _ = register_data_watch(zk.clone(), path.clone(), cb.clone());
                    }
                }
            }
        })
        .map_err(|e| match e {
            ZkError::NoNode => StoreErrKind::NotFound(path.clone()),
            other => map_err(other),
        })?;
    let _ = data;
    Ok(())
}

/// Same one-shot-rearm treatment as `register_data_watch`, for child
/// watches (spec C4/C5/C8's "continuous observation" of membership).
fn register_children_watch(zk: Arc<ZooKeeper>, path: String, cb: Arc<WatchCallback>) -> Result<()> {
    zk.get_children_w(&path, {
        let zk = zk.clone();
        let path = path.clone();
        let cb = cb.clone();
        move |event: WatchedEvent| {
            if event.event_type == zookeeper::WatchedEventType::NodeChildrenChanged {
                if cb(WatchEvent::ChildrenChanged, None) == WatchAction::Rearm {
                    let _ = register_children_watch(zk.clone(), path.clone(), cb.clone());
                }
            }
        }
    })
    .map_err(|e| match e {
        ZkError::NoNode => StoreErrKind::NotFound(path.clone()),
        other => map_err(other),
    })?;
    Ok(())
}

fn map_err(e: ZkError) -> StoreErrKind {
    match e {
        ZkError::NoNode => StoreErrKind::NotFound(String::new()),
        ZkError::BadVersion => StoreErrKind::VersionConflict { path: String::new(), expected: -1, found: -1 },
        ZkError::SessionExpired => StoreErrKind::SessionExpired,
        ZkError::ConnectionLoss => StoreErrKind::Disconnected,
        other => StoreErrKind::Other(format!("{:?}", other)),
    }
}

/// A live session to a ZooKeeper ensemble (spec §4.1 `connect`). `zk` is
/// `Arc`-wrapped so a fired watch callback can re-issue its own
/// registration (ZK watches are one-shot by protocol; see `watch_data`).
pub struct ZkStore {
    zk: Arc<ZooKeeper>,
    listeners: Arc<Mutex<Vec<Box<dyn Fn(SessionEvent) + Send + Sync>>>>,
}

impl ZkStore {
    /// `endpoints` is a comma-separated `host:port` list (spec §6).
    /// `persistent` controls session re-establishment behavior; both
    /// modes auto-reconnect on transient failure, persistent sessions
    /// additionally treat a still-valid session id as resumable across
    /// a brief network blip (spec §4.1).
    pub fn connect(endpoints: &str, persistent: bool) -> Result<Arc<ZkStore>> {
        let listeners: Arc<Mutex<Vec<Box<dyn Fn(SessionEvent) + Send + Sync>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let watcher = SessionWatcher { listeners: listeners.clone() };
        let session_timeout = if persistent { Duration::from_secs(30) } else { Duration::from_secs(10) };
        let zk = ZooKeeper::connect(endpoints, session_timeout, watcher)
            .map_err(|e| StoreErrKind::Other(format!("connect({}) failed: {}", endpoints, e)))?;
        Ok(Arc::new(ZkStore { zk: Arc::new(zk), listeners }))
    }

    pub fn on_session_event(&self, listener: Box<dyn Fn(SessionEvent) + Send + Sync>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn ensure_path(&self, path: &str) -> Result<()> {
        // Create parent chain as persistent nodes if missing (mirrors
        // `write`'s "if key is absent it is created" clause extended to
        // ancestors, since ZK has no recursive create primitive).
        let mut acc = String::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            acc.push('/');
            acc.push_str(part);
            if self.zk.exists(&acc, false).map_err(map_err)?.is_none() {
                match self.zk.create(&acc, Vec::new(), Acl::open_unsafe().clone(), CreateMode::Persistent) {
                    Ok(_) | Err(ZkError::NodeExists) => {}
                    Err(e) => return Err(map_err(e).into()),
                }
            }
        }
        Ok(())
    }
}

impl Store for ZkStore {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.zk.exists(path, false).map_err(map_err)?.is_some())
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.zk.get_children(path, false).map_err(|e| match e {
            ZkError::NoNode => StoreErrKind::NotFound(path.to_string()).into(),
            other => map_err(other).into(),
        })
    }

    fn read(&self, path: &str) -> Result<(Vec<u8>, i32)> {
        let (data, stat) = self.zk.get_data(path, false).map_err(|e| match e {
            ZkError::NoNode => StoreErrKind::NotFound(path.to_string()),
            other => map_err(other),
        })?;
        Ok((data, stat.version))
    }

    fn write(&self, pairs: &[WriteOp]) -> Result<()> {
        // zookeeper-rs's `multi` transaction surface is limited in the
        // 0.8 line, so we emulate the "batch commits or fails together"
        // contract with a two-phase approach: validate every expected
        // version first (so the common case — a conflict on the first
        // key — fails before any write lands), then apply in order.
        // A partial failure after this point is the same
        // non-transactional limitation `rename` already documents.
        for op in pairs {
            if let Some(expected) = op.version {
                let (_, current) = self.read(&op.path)?;
                if current != expected {
                    return Err(StoreErrKind::VersionConflict {
                        path: op.path.clone(),
                        expected,
                        found: current,
                    }
                    .into());
                }
            }
        }
        for op in pairs {
            match op.version {
                Some(expected) => {
                    self.zk.set_data(&op.path, op.data.clone(), Some(expected)).map_err(|e| match e {
                        ZkError::BadVersion => StoreErrKind::VersionConflict {
                            path: op.path.clone(),
                            expected,
                            found: -1,
                        },
                        ZkError::NoNode => StoreErrKind::NotFound(op.path.clone()),
                        other => map_err(other),
                    })?;
                }
                None => {
                    if self.zk.exists(&op.path, false).map_err(map_err)?.is_some() {
                        self.zk.set_data(&op.path, op.data.clone(), None).map_err(map_err)?;
                    } else {
                        if let Some(parent) = super::lock::parent_path(&op.path) {
                            self.ensure_path(&parent)?;
                        }
                        match self.zk.create(
                            &op.path,
                            op.data.clone(),
                            Acl::open_unsafe().clone(),
                            CreateMode::Persistent,
                        ) {
                            Ok(_) => {}
                            Err(ZkError::NodeExists) => {
                                self.zk.set_data(&op.path, op.data.clone(), None).map_err(map_err)?;
                            }
                            Err(e) => return Err(map_err(e).into()),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        if recursive {
            for child in self.children(path).unwrap_or_default() {
                self.delete(&format!("{}/{}", path, child), true)?;
            }
        }
        match self.zk.delete(path, None) {
            Ok(()) => Ok(()),
            Err(ZkError::NoNode) => Ok(()),
            Err(e) => Err(map_err(e).into()),
        }
    }

    fn watch_data(&self, path: &str, cb: WatchCallback) -> Result<()> {
        register_data_watch(self.zk.clone(), path.to_string(), Arc::new(cb))
    }

    fn watch_children(&self, path: &str, cb: WatchCallback) -> Result<()> {
        register_children_watch(self.zk.clone(), path.to_string(), Arc::new(cb))
    }

    fn create_sequential_ephemeral(&self, path: &str, prefix: &str, data: &[u8]) -> Result<String> {
        self.ensure_path(path)?;
        let base = format!("{}/{}", path.trim_end_matches('/'), prefix);
        self.zk
            .create(&base, data.to_vec(), Acl::open_unsafe().clone(), CreateMode::EphemeralSequential)
            .map_err(|e| map_err(e).into())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        super::lock::default_rename(self, old, new)
    }
}
