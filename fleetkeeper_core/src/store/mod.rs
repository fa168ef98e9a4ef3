//! Coordination store client (spec §4.1, "C1").
//!
//! `Store` is the trait every other component is written against. The
//! real implementation (`zk`) is backed by a ZooKeeper session; the
//! `fake` implementation is an in-memory stand-in used by tests, the
//! same role the teacher's `Vault::Mode::Mocked` plays for HTTP calls.

pub mod fake;
pub mod lock;
pub mod zk;

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

/// One op in a `Store::write` batch.
///
/// `version` is the writer's last-known version of the key: `None`
/// means "create if absent, otherwise accept any version" (used for
/// best-effort fields like heartbeats where losing a race is harmless);
/// `Some(v)` means the write is rejected with `VersionConflict` unless
/// the key's current version is exactly `v`, matching ZooKeeper's own
/// `setData(path, data, version)` semantics.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub path: String,
    pub data: Vec<u8>,
    pub version: Option<i32>,
}

impl WriteOp {
    pub fn upsert(path: impl Into<String>, data: Vec<u8>) -> Self {
        WriteOp { path: path.into(), data, version: None }
    }

    pub fn checked(path: impl Into<String>, data: Vec<u8>, version: i32) -> Self {
        WriteOp { path: path.into(), data, version: Some(version) }
    }
}

/// Session-level connectivity events delivered to listeners (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Suspended,
    Connected,
    Lost,
}

/// What changed at a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    DataChanged,
    ChildrenChanged,
    Deleted,
}

/// Returned by a watch callback to indicate whether the subscription
/// should be re-armed (spec §4.1: "`fn` may request termination by
/// returning a sentinel").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Rearm,
    Terminate,
}

pub type WatchCallback = Box<dyn Fn(WatchEvent, Option<Vec<u8>>) -> WatchAction + Send + Sync>;

/// Failure taxonomy (spec §4.1 "Failure semantics").
#[derive(Debug)]
pub struct StoreError {
    inner: Context<StoreErrKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum StoreErrKind {
    #[fail(display = "path not found: {}", _0)]
    NotFound(String),
    #[fail(display = "version conflict writing {}: expected {}, found {}", path, expected, found)]
    VersionConflict { path: String, expected: i32, found: i32 },
    #[fail(display = "store disconnected")]
    Disconnected,
    #[fail(display = "store session expired")]
    SessionExpired,
    #[fail(display = "store operation failed: {}", _0)]
    Other(String),
}

impl Fail for StoreError {
    fn cause(&self) -> Option<&dyn Fail> { self.inner.cause() }
    fn backtrace(&self) -> Option<&Backtrace> { self.inner.backtrace() }
}
impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<StoreErrKind> for StoreError {
    fn from(kind: StoreErrKind) -> StoreError {
        StoreError { inner: Context::new(kind) }
    }
}
impl From<Context<StoreErrKind>> for StoreError {
    fn from(inner: Context<StoreErrKind>) -> StoreError {
        StoreError { inner }
    }
}
impl StoreError {
    pub fn kind(&self) -> &StoreErrKind {
        self.inner.get_context()
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A held lock; released when dropped (spec §4.1: "scoped acquisition
/// with guaranteed release on all exit paths").
pub trait LockGuard: Send {
    /// The sequential znode this acquisition created, unique per
    /// acquisition (spec §4.1: "locks are keyed by an ID unique per
    /// acquisition").
    fn lock_id(&self) -> &str;
}

/// Lock flavor, used internally by the ZK lock recipe (`store::lock`) to
/// decide whether same-mode holders may share (read locks) or must fully
/// exclude each other (write/exclusive locks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    Exclusive,
}

/// Hierarchical, watchable, versioned key-value store (spec §4.1).
pub trait Store: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool>;
    fn children(&self, path: &str) -> Result<Vec<String>>;
    /// Returns `(data, version)`.
    fn read(&self, path: &str) -> Result<(Vec<u8>, i32)>;

    fn read_many(&self, paths: &[&str]) -> Result<Vec<Vec<u8>>> {
        paths.iter().map(|p| self.read(p).map(|(d, _)| d)).collect()
    }

    /// Atomic multi-op write; see `WriteOp` for per-key semantics. The
    /// whole batch commits or fails together.
    fn write(&self, pairs: &[WriteOp]) -> Result<()>;

    fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    fn watch_data(&self, path: &str, cb: WatchCallback) -> Result<()>;
    fn watch_children(&self, path: &str, cb: WatchCallback) -> Result<()>;

    /// Create an ephemeral, sequential child of `path` (e.g.
    /// `path/lock-0000000001`) and return its full path. Building block
    /// used by `store::lock`'s ZK lock recipe.
    fn create_sequential_ephemeral(&self, path: &str, prefix: &str, data: &[u8]) -> Result<String>;

    /// Recursive copy of the subtree rooted at `old` to `new`, then
    /// recursive delete of `old` (spec §4.1: "Not transactional ...
    /// idempotent and safe to retry"). Implementations should delegate
    /// to `store::lock::default_rename`.
    fn rename(&self, old: &str, new: &str) -> Result<()>;
}

/// `write_lock`/`read_lock`/`exclusive_lock` are free functions rather
/// than `Store` methods because the lock recipe (`store::lock::acquire`)
/// needs an owned, cloneable handle to delete its znode from the guard's
/// `Drop` impl; every long-lived task in this codebase already holds its
/// store as `Arc<dyn Store>` (spec §9: "the coordination-store session is
/// the only process-wide handle"), so this is the natural call shape:
/// `store::write_lock(store.clone(), path)`.
pub fn write_lock(store: std::sync::Arc<dyn Store>, path: &str) -> Result<Box<dyn LockGuard>> {
    lock::acquire(store, path, LockMode::Write)
}

pub fn read_lock(store: std::sync::Arc<dyn Store>, path: &str) -> Result<Box<dyn LockGuard>> {
    lock::acquire(store, path, LockMode::Read)
}

pub fn exclusive_lock(store: std::sync::Arc<dyn Store>, path: &str) -> Result<Box<dyn LockGuard>> {
    lock::acquire(store, path, LockMode::Exclusive)
}
