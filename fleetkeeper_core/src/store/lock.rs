//! The ZooKeeper lock recipe, shared by every `Store` implementation.
//!
//! `write_lock`/`exclusive_lock` are both full mutual exclusion; `Store`
//! exposes them separately because spec §4.1 names all three, but a
//! recursive advisory lock over a single hierarchical store has no
//! cheaper way to implement "exclusive" than "write" - the distinction
//! spec draws is about caller intent (readers vs single-writer-at-a-time
//! vs "nobody else may proceed at all"), not about two different wire
//! protocols. `read_lock` allows multiple holders whose acquisitions are
//! all prefixed `read-`, blocking only behind outstanding `write-`/`excl-`
//! nodes with a lower sequence number.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{LockGuard, LockMode, Result, Store, StoreErrKind};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

fn prefix_for(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Read => "read-",
        LockMode::Write => "write-",
        LockMode::Exclusive => "excl-",
    }
}

/// Does a holder in `mode` block behind the sibling znode `other_name`?
/// Read locks don't block other read locks; everything else is
/// exclusive with everything.
fn conflicts(holder_mode: LockMode, other_name: &str) -> bool {
    if holder_mode == LockMode::Read && other_name.starts_with("read-") {
        return false;
    }
    true
}

fn sequence_of(name: &str) -> Option<u64> {
    name.rsplit('-').next().and_then(|s| s.parse().ok())
}

/// The parent path of `path`, or `None` if `path` is already the root.
/// Used by `zk::ZkStore` to lazily create ancestor nodes before an
/// ephemeral-sequential create, since ZooKeeper has no recursive
/// create primitive.
pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(trimmed[..idx].to_string())
    }
}

struct ZkLockGuard {
    path: String,
    release: Box<dyn Fn(&str) -> Result<()> + Send>,
}

impl LockGuard for ZkLockGuard {
    fn lock_id(&self) -> &str {
        &self.path
    }
}

impl Drop for ZkLockGuard {
    fn drop(&mut self) {
        let _ = (self.release)(&self.path);
    }
}

/// Acquire a lock at `path` using the standard sequential-ephemeral
/// recipe: create our sequence node, then block until every
/// lower-sequenced, conflicting sibling has vanished. The returned
/// guard deletes its own znode on drop.
pub fn acquire(store: Arc<dyn Store>, path: &str, mode: LockMode) -> Result<Box<dyn LockGuard>> {
    let our_path = store.create_sequential_ephemeral(path, prefix_for(mode), b"")?;
    let our_name = our_path.rsplit('/').next().unwrap_or(&our_path).to_string();
    let our_seq = sequence_of(&our_name);

    let deadline = std::time::Instant::now() + ACQUIRE_TIMEOUT;
    loop {
        let siblings = store.children(path)?;
        let blocking = siblings.iter().any(|s| {
            if s == &our_name {
                return false;
            }
            match (sequence_of(s), our_seq) {
                (Some(their_seq), Some(our_seq)) if their_seq < our_seq => conflicts(mode, s),
                _ => false,
            }
        });
        if !blocking {
            break;
        }
        if std::time::Instant::now() > deadline {
            let _ = store.delete(&our_path, false);
            return Err(StoreErrKind::Other(format!("timed out acquiring lock at {}", path)).into());
        }
        thread::sleep(POLL_INTERVAL);
    }

    let release_store = store.clone();
    Ok(Box::new(ZkLockGuard {
        path: our_path,
        release: Box::new(move |p: &str| {
            release_store.delete(p, false).or_else(|e| match e.kind() {
                StoreErrKind::NotFound(_) => Ok(()),
                _ => Err(e),
            })
        }),
    }))
}

/// Recursive copy-then-delete rename (spec §4.1). Idempotent: if `old`
/// no longer exists but `new` does, treat it as already completed.
pub fn default_rename(store: &dyn Store, old: &str, new: &str) -> Result<()> {
    if !store.exists(old)? {
        if store.exists(new)? {
            return Ok(());
        }
        return Err(StoreErrKind::NotFound(old.to_string()).into());
    }
    copy_subtree(store, old, new)?;
    delete_subtree(store, old)
}

fn copy_subtree(store: &dyn Store, old: &str, new: &str) -> Result<()> {
    let (data, _version) = store.read(old)?;
    if !store.exists(new)? {
        store.write(&[super::WriteOp::upsert(new, data)])?;
    }
    for child in store.children(old)? {
        copy_subtree(store, &format!("{}/{}", old, child), &format!("{}/{}", new, child))?;
    }
    Ok(())
}

fn delete_subtree(store: &dyn Store, path: &str) -> Result<()> {
    store.delete(path, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_parses_trailing_counter() {
        assert_eq!(sequence_of("write-0000000007"), Some(7));
        assert_eq!(sequence_of("read-3"), Some(3));
        assert_eq!(sequence_of("garbage"), None);
    }

    #[test]
    fn read_locks_do_not_conflict_with_each_other() {
        assert!(!conflicts(LockMode::Read, "read-1"));
        assert!(conflicts(LockMode::Read, "write-1"));
        assert!(conflicts(LockMode::Write, "read-1"));
        assert!(conflicts(LockMode::Exclusive, "excl-1"));
    }
}
