//! Process-local shard store.
//!
//! Holds the same tree layout as the durable backend in ordered maps. Used
//! for ephemeral stores and tests; `fail_commits` injects commit failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fhist_error::{HistoryError, Result};
use fhist_types::{BucketLayout, ShardId};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::backend::{ShardBackend, TreeWrites};

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug)]
pub struct MemoryBackend {
    shard: ShardId,
    trees: RwLock<HashMap<String, Tree>>,
    fail_commits: AtomicBool,
    commits: AtomicU64,
    high_water: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(shard: ShardId, layout: BucketLayout) -> Self {
        let trees = layout
            .tree_names()
            .into_iter()
            .map(|name| (name, Tree::new()))
            .collect();
        Self {
            shard,
            trees: RwLock::new(trees),
            fail_commits: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
        }
    }

    /// Make every following commit fail (or succeed again).
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Release);
    }

    /// Successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Stored entries across all trees.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.read().values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ShardBackend for MemoryBackend {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let trees = self.trees.read();
        let tree = trees.get(tree).ok_or_else(|| missing_tree(self.shard, tree))?;
        Ok(tree.get(key).cloned())
    }

    fn commit(&self, writes: &[TreeWrites]) -> Result<()> {
        if self.fail_commits.load(Ordering::Acquire) {
            return Err(HistoryError::IndexStore {
                op: "commit",
                shard: self.shard.as_char(),
                detail: "injected commit failure".to_owned(),
            });
        }
        let mut trees = self.trees.write();
        if let Some(write) = writes.iter().find(|write| !trees.contains_key(&write.tree)) {
            return Err(missing_tree(self.shard, &write.tree));
        }
        for write in writes {
            if let Some(tree) = trees.get_mut(&write.tree) {
                for (key, value) in &write.entries {
                    tree.insert(key.clone(), value.clone());
                }
            }
        }
        self.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn high_water(&self) -> Result<u64> {
        Ok(self.high_water.load(Ordering::Acquire))
    }

    fn raise_high_water(&self, offset: u64) -> Result<()> {
        self.high_water.fetch_max(offset, Ordering::AcqRel);
        Ok(())
    }

    fn reset_high_water(&self, offset: u64) -> Result<()> {
        self.high_water.store(offset, Ordering::Release);
        Ok(())
    }

    fn scan(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let trees = self.trees.read();
        let tree = trees.get(tree).ok_or_else(|| missing_tree(self.shard, tree))?;
        Ok(tree
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn remove(&self, tree: &str, keys: &[Vec<u8>]) -> Result<()> {
        let mut trees = self.trees.write();
        let tree = trees
            .get_mut(tree)
            .ok_or_else(|| missing_tree(self.shard, tree))?;
        for key in keys {
            tree.remove(key);
        }
        Ok(())
    }
}

fn missing_tree(shard: ShardId, tree: &str) -> HistoryError {
    HistoryError::internal(format!("shard {shard} has no tree {tree:?}"))
}
