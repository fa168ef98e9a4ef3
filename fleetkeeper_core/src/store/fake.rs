//! In-memory `Store` used by tests (spec §4.1 "an in-memory fake ...
//! is part of this component, not an afterthought"). Mirrors the
//! teacher's `Vault::Mode::Mocked` split between a real backend and a
//! canned one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{Result, SessionEvent, Store, StoreErrKind, WatchAction, WatchCallback, WatchEvent, WriteOp};

struct Node {
    data: Vec<u8>,
    version: i32,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn new(data: Vec<u8>) -> Self {
        Node { data, version: 0, children: BTreeMap::new() }
    }
}

struct Tree {
    root: Node,
}

impl Tree {
    fn new() -> Self {
        Tree { root: Node::new(Vec::new()) }
    }

    fn split(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    fn find<'a>(node: &'a Node, parts: &[&str]) -> Option<&'a Node> {
        match parts.split_first() {
            None => Some(node),
            Some((head, rest)) => node.children.get(*head).and_then(|c| Tree::find(c, rest)),
        }
    }

    fn find_mut<'a>(node: &'a mut Node, parts: &[&str]) -> Option<&'a mut Node> {
        match parts.split_first() {
            None => Some(node),
            Some((head, rest)) => node.children.get_mut(*head).and_then(|c| Tree::find_mut(c, rest)),
        }
    }
}

type Watchers = Mutex<Vec<(String, WatchCallback)>>;

/// An in-process stand-in for a ZooKeeper ensemble. All operations are
/// synchronous and guarded by one coarse mutex, which is fine for tests
/// and for the property-test scenarios of spec §8: there is no real
/// concurrency to model faithfully, only the *semantics* of versioned
/// writes, watches, and ephemeral locks.
pub struct FakeStore {
    tree: Mutex<Tree>,
    seq_counter: AtomicU64,
    data_watchers: Watchers,
    child_watchers: Watchers,
    session_listeners: Mutex<Vec<Box<dyn Fn(SessionEvent) + Send + Sync>>>,
}

impl FakeStore {
    pub fn new() -> Arc<FakeStore> {
        Arc::new(FakeStore {
            tree: Mutex::new(Tree::new()),
            seq_counter: AtomicU64::new(0),
            data_watchers: Mutex::new(Vec::new()),
            child_watchers: Mutex::new(Vec::new()),
            session_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn on_session_event(&self, listener: Box<dyn Fn(SessionEvent) + Send + Sync>) {
        self.session_listeners.lock().unwrap().push(listener);
    }

    fn fire_data(&self, path: &str, event: WatchEvent, data: Option<Vec<u8>>) {
        let mut watchers = self.data_watchers.lock().unwrap();
        watchers.retain(|(p, cb)| {
            if p != path {
                return true;
            }
            cb(event, data.clone()) == WatchAction::Rearm
        });
    }

    fn fire_children(&self, path: &str) {
        let mut watchers = self.child_watchers.lock().unwrap();
        watchers.retain(|(p, cb)| {
            if p != path {
                return true;
            }
            cb(WatchEvent::ChildrenChanged, None) == WatchAction::Rearm
        });
    }

    fn parent_of(path: &str) -> Option<String> {
        let trimmed = path.trim_end_matches('/');
        let idx = trimmed.rfind('/')?;
        if idx == 0 {
            Some(String::new())
        } else {
            Some(trimmed[..idx].to_string())
        }
    }
}

impl Store for FakeStore {
    fn exists(&self, path: &str) -> Result<bool> {
        let tree = self.tree.lock().unwrap();
        Ok(Tree::find(&tree.root, &Tree::split(path)).is_some())
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.tree.lock().unwrap();
        let node = Tree::find(&tree.root, &Tree::split(path))
            .ok_or_else(|| StoreErrKind::NotFound(path.to_string()))?;
        Ok(node.children.keys().cloned().collect())
    }

    fn read(&self, path: &str) -> Result<(Vec<u8>, i32)> {
        let tree = self.tree.lock().unwrap();
        let node = Tree::find(&tree.root, &Tree::split(path))
            .ok_or_else(|| StoreErrKind::NotFound(path.to_string()))?;
        Ok((node.data.clone(), node.version))
    }

    fn write(&self, pairs: &[WriteOp]) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        // Validate the whole batch before mutating anything, so the
        // batch either commits or fails as one unit (spec §4.1).
        for op in pairs {
            if let Some(expected) = op.version {
                let parts = Tree::split(&op.path);
                if let Some(existing) = Tree::find(&tree.root, &parts) {
                    if existing.version != expected {
                        return Err(StoreErrKind::VersionConflict {
                            path: op.path.clone(),
                            expected,
                            found: existing.version,
                        }
                        .into());
                    }
                } else {
                    return Err(StoreErrKind::NotFound(op.path.clone()).into());
                }
            }
        }
        let mut touched = Vec::new();
        let mut created_under: Vec<String> = Vec::new();
        for op in pairs {
            let parts = Tree::split(&op.path);
            let (parent_parts, leaf) = parts.split_at(parts.len().saturating_sub(1));
            let leaf = leaf.first().copied().unwrap_or("");
            let parent = Tree::find_mut(&mut tree.root, parent_parts)
                .ok_or_else(|| StoreErrKind::NotFound(op.path.clone()))?;
            match parent.children.get_mut(leaf) {
                Some(existing) => {
                    existing.data = op.data.clone();
                    existing.version += 1;
                }
                None => {
                    parent.children.insert(leaf.to_string(), Node::new(op.data.clone()));
                    if let Some(p) = Self::parent_of(&op.path) {
                        created_under.push(p);
                    }
                }
            }
            touched.push(op.path.clone());
        }
        drop(tree);
        for path in &touched {
            self.fire_data(path, WatchEvent::DataChanged, self.read(path).ok().map(|(d, _)| d));
        }
        for parent in created_under {
            self.fire_children(&parent);
        }
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let parts = Tree::split(path);
        let (parent_parts, leaf) = parts.split_at(parts.len().saturating_sub(1));
        let leaf = leaf.first().copied().unwrap_or("");
        let parent = Tree::find_mut(&mut tree.root, parent_parts)
            .ok_or_else(|| StoreErrKind::NotFound(path.to_string()))?;
        let node = parent.children.get(leaf).ok_or_else(|| StoreErrKind::NotFound(path.to_string()))?;
        if !recursive && !node.children.is_empty() {
            return Err(StoreErrKind::Other(format!("{} has children", path)).into());
        }
        parent.children.remove(leaf);
        drop(tree);
        self.fire_data(path, WatchEvent::Deleted, None);
        if let Some(p) = Self::parent_of(path) {
            self.fire_children(&p);
        }
        Ok(())
    }

    fn watch_data(&self, path: &str, cb: WatchCallback) -> Result<()> {
        self.data_watchers.lock().unwrap().push((path.to_string(), cb));
        Ok(())
    }

    fn watch_children(&self, path: &str, cb: WatchCallback) -> Result<()> {
        self.child_watchers.lock().unwrap().push((path.to_string(), cb));
        Ok(())
    }

    fn create_sequential_ephemeral(&self, path: &str, prefix: &str, data: &[u8]) -> Result<String> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{:010}", prefix, seq);
        let full = format!("{}/{}", path.trim_end_matches('/'), name);
        self.write(&[WriteOp::upsert(full.clone(), data.to_vec())])?;
        Ok(full)
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        super::lock::default_rename(self, old, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let store = FakeStore::new();
        store.write(&[WriteOp::upsert("/nodes", b"".to_vec())]).unwrap();
        store.write(&[WriteOp::upsert("/nodes/hv1", b"hello".to_vec())]).unwrap();
        let (data, version) = store.read("/nodes/hv1").unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, 0);
    }

    #[test]
    fn version_conflict_on_stale_write() {
        let store = FakeStore::new();
        store.write(&[WriteOp::upsert("/x", b"a".to_vec())]).unwrap();
        let err = store.write(&[WriteOp::checked("/x", b"b".to_vec(), 5)]).unwrap_err();
        match err.kind() {
            StoreErrKind::VersionConflict { expected, found, .. } => {
                assert_eq!(*expected, 5);
                assert_eq!(*found, 0);
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn sequential_ephemeral_names_increase() {
        let store = FakeStore::new();
        store.write(&[WriteOp::upsert("/locks/v1", b"".to_vec())]).unwrap();
        let a = store.create_sequential_ephemeral("/locks/v1", "write-", b"").unwrap();
        let b = store.create_sequential_ephemeral("/locks/v1", "write-", b"").unwrap();
        assert!(a < b);
    }

    #[test]
    fn delete_fires_data_watch() {
        let store = FakeStore::new();
        store.write(&[WriteOp::upsert("/x", b"a".to_vec())]).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        store
            .watch_data(
                "/x",
                Box::new(move |ev, _| {
                    seen2.lock().unwrap().push(ev);
                    WatchAction::Terminate
                }),
            )
            .unwrap();
        store.delete("/x", false).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![WatchEvent::Deleted]);
    }
}
