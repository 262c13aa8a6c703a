//! Durable shard store on `sled`.
//!
//! One database per shard under `<index_dir>/<c>/`. Every bucket tree is
//! opened (and on first use created) up front; the layout it was created
//! with is recorded under [`LAYOUT_KEY`] in the default tree and checked on
//! every reopen. The highest log offset ever committed is kept next to it
//! under [`HIGH_WATER_KEY`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fhist_error::{HistoryError, Result};
use fhist_types::{BucketLayout, ShardId, SledConfig};
use hashbrown::HashMap;
use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use tracing::{debug, info};

use crate::INDEX_TARGET;
use crate::backend::{ShardBackend, TreeWrites};

/// Default-tree key holding the layout marker.
pub const LAYOUT_KEY: &[u8] = b"__fhist_layout";
/// Default-tree key holding the high-water offset, big-endian.
pub const HIGH_WATER_KEY: &[u8] = b"__fhist_high_water";

#[derive(Debug)]
pub struct SledBackend {
    shard: ShardId,
    db: sled::Db,
    trees: HashMap<String, sled::Tree>,
    /// Last value written under [`HIGH_WATER_KEY`].
    high_water: AtomicU64,
}

impl SledBackend {
    pub fn open(
        index_dir: &Path,
        shard: ShardId,
        layout: BucketLayout,
        config: &SledConfig,
    ) -> Result<Self> {
        let path = index_dir.join(shard.as_char().to_string());
        std::fs::create_dir_all(&path)?;
        let db = sled::Config::new()
            .path(&path)
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(config.flush_every_ms)
            .open()
            .map_err(|err| store_error("open", shard, &err))?;

        let expected = layout.marker();
        let stored = db
            .get(LAYOUT_KEY)
            .map_err(|err| store_error("read layout", shard, &err))?;
        let fresh = match stored {
            Some(stored) if stored.as_ref() != expected.as_bytes() => {
                return Err(HistoryError::LayoutMismatch {
                    shard: shard.as_char(),
                    stored: String::from_utf8_lossy(&stored).into_owned(),
                    expected,
                });
            }
            Some(_) => false,
            None => true,
        };

        let names = layout.tree_names();
        let mut trees = HashMap::with_capacity(names.len());
        for (chunk_index, chunk) in names.chunks(config.layout_chunk.max(1)).enumerate() {
            for name in chunk {
                let tree = db
                    .open_tree(name.as_bytes())
                    .map_err(|err| store_error("open tree", shard, &err))?;
                trees.insert(name.clone(), tree);
            }
            if fresh {
                db.flush().map_err(|err| store_error("flush", shard, &err))?;
                debug!(
                    target: INDEX_TARGET,
                    shard = %shard,
                    chunk = chunk_index,
                    created = trees.len(),
                    total = names.len(),
                    "created bucket trees"
                );
            }
        }

        if fresh {
            db.insert(LAYOUT_KEY, expected.as_bytes())
                .map_err(|err| store_error("write layout", shard, &err))?;
            db.flush().map_err(|err| store_error("flush", shard, &err))?;
            info!(
                target: INDEX_TARGET,
                shard = %shard,
                path = %path.display(),
                trees = trees.len(),
                layout = %expected,
                "created shard store"
            );
        }

        let high_water = match db
            .get(HIGH_WATER_KEY)
            .map_err(|err| store_error("read high water", shard, &err))?
        {
            Some(bytes) => decode_high_water(&bytes).ok_or_else(|| HistoryError::IndexStore {
                op: "read high water",
                shard: shard.as_char(),
                detail: format!("expected 8 bytes, found {}", bytes.len()),
            })?,
            None => 0,
        };

        Ok(Self {
            shard,
            db,
            trees,
            high_water: AtomicU64::new(high_water),
        })
    }

    fn tree(&self, name: &str) -> Result<&sled::Tree> {
        self.trees.get(name).ok_or_else(|| {
            HistoryError::internal(format!("shard {} has no tree {name:?}", self.shard))
        })
    }
}

impl ShardBackend for SledBackend {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree(tree)?
            .get(key)
            .map_err(|err| store_error("get", self.shard, &err))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn commit(&self, writes: &[TreeWrites]) -> Result<()> {
        let mut trees = Vec::with_capacity(writes.len());
        let mut batches = Vec::with_capacity(writes.len());
        for write in writes {
            trees.push(self.tree(&write.tree)?.clone());
            let mut batch = sled::Batch::default();
            for (key, value) in &write.entries {
                batch.insert(key.as_slice(), value.as_slice());
            }
            batches.push(batch);
        }

        match trees.as_slice() {
            [] => Ok(()),
            [tree] => tree
                .apply_batch(batches.swap_remove(0))
                .map_err(|err| store_error("commit", self.shard, &err)),
            many => many
                .transaction(|views| {
                    for (view, batch) in views.iter().zip(&batches) {
                        view.apply_batch(batch)?;
                    }
                    Ok::<(), ConflictableTransactionError<()>>(())
                })
                .map_err(|err| HistoryError::IndexStore {
                    op: "commit",
                    shard: self.shard.as_char(),
                    detail: format!("{err:?}"),
                }),
        }
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|err| store_error("flush", self.shard, &err))
    }

    fn high_water(&self) -> Result<u64> {
        Ok(self.high_water.load(Ordering::Acquire))
    }

    fn raise_high_water(&self, offset: u64) -> Result<()> {
        if self.high_water.load(Ordering::Acquire) >= offset {
            return Ok(());
        }
        self.db
            .fetch_and_update(HIGH_WATER_KEY, |old| {
                let current = old.and_then(decode_high_water).unwrap_or(0);
                Some(current.max(offset).to_be_bytes().to_vec())
            })
            .map_err(|err| store_error("raise high water", self.shard, &err))?;
        self.high_water.fetch_max(offset, Ordering::AcqRel);
        Ok(())
    }

    fn reset_high_water(&self, offset: u64) -> Result<()> {
        self.db
            .insert(HIGH_WATER_KEY, offset.to_be_bytes().to_vec())
            .map_err(|err| store_error("reset high water", self.shard, &err))?;
        self.high_water.store(offset, Ordering::Release);
        Ok(())
    }

    fn scan(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.tree(tree)?
            .iter()
            .map(|entry| {
                entry
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
                    .map_err(|err| store_error("scan", self.shard, &err))
            })
            .collect()
    }

    fn remove(&self, tree: &str, keys: &[Vec<u8>]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key.as_slice());
        }
        self.tree(tree)?
            .apply_batch(batch)
            .map_err(|err| store_error("remove", self.shard, &err))
    }
}

fn decode_high_water(bytes: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(bytes).ok().map(u64::from_be_bytes)
}

fn store_error(op: &'static str, shard: ShardId, err: &sled::Error) -> HistoryError {
    HistoryError::IndexStore {
        op,
        shard: shard.as_char(),
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn shard() -> ShardId {
        ShardId::from_hex_char(b'c').expect("hex")
    }

    #[test]
    fn creates_layout_and_round_trips_commits() {
        let dir = tempdir().expect("tempdir");
        let layout = BucketLayout::new(1, 1, 7);
        let config = SledConfig {
            layout_chunk: 50,
            ..SledConfig::default()
        };
        let backend = SledBackend::open(dir.path(), shard(), layout, &config).expect("open");
        assert_eq!(backend.trees.len(), 256);

        backend
            .commit(&[
                TreeWrites {
                    tree: "3/f".to_owned(),
                    entries: vec![(b"0912345".to_vec(), b"80,".to_vec())],
                },
                TreeWrites {
                    tree: "4/0".to_owned(),
                    entries: vec![(b"aaaaaaa".to_vec(), b"c0,".to_vec())],
                },
            ])
            .expect("commit");
        backend.flush().expect("flush");
        drop(backend);

        let backend = SledBackend::open(dir.path(), shard(), layout, &config).expect("reopen");
        assert_eq!(
            backend.get("3/f", b"0912345").expect("get"),
            Some(b"80,".to_vec())
        );
        assert_eq!(backend.get("4/0", b"0912345").expect("get"), None);
        assert!(backend.get("nope", b"k").is_err());
    }

    #[test]
    fn high_water_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let layout = BucketLayout::default();
        let config = SledConfig::default();
        {
            let backend = SledBackend::open(dir.path(), shard(), layout, &config).expect("open");
            assert_eq!(backend.high_water().expect("read"), 0);
            backend.raise_high_water(4096).expect("raise");
            backend.raise_high_water(512).expect("raise");
            backend.flush().expect("flush");
        }
        let backend = SledBackend::open(dir.path(), shard(), layout, &config).expect("reopen");
        assert_eq!(backend.high_water().expect("read"), 4096);
        backend.reset_high_water(200).expect("reset");
        assert_eq!(backend.high_water().expect("read"), 200);
    }

    #[test]
    fn scan_then_remove_rewrites_a_tree() {
        let dir = tempdir().expect("tempdir");
        let backend = SledBackend::open(
            dir.path(),
            shard(),
            BucketLayout::default(),
            &SledConfig::default(),
        )
        .expect("open");
        backend
            .commit(&[TreeWrites {
                tree: "7".to_owned(),
                entries: vec![
                    (b"0000001".to_vec(), b"80,".to_vec()),
                    (b"0000002".to_vec(), b"c0,".to_vec()),
                ],
            }])
            .expect("commit");
        assert_eq!(backend.scan("7").expect("scan").len(), 2);
        backend.remove("7", &[b"0000001".to_vec()]).expect("remove");
        assert_eq!(
            backend.scan("7").expect("scan"),
            vec![(b"0000002".to_vec(), b"c0,".to_vec())]
        );
    }

    #[test]
    fn reopen_with_other_layout_fails() {
        let dir = tempdir().expect("tempdir");
        let config = SledConfig::default();
        drop(
            SledBackend::open(dir.path(), shard(), BucketLayout::new(1, 0, 7), &config)
                .expect("open"),
        );
        let err = SledBackend::open(dir.path(), shard(), BucketLayout::new(1, 0, 8), &config)
            .expect_err("layout mismatch");
        assert!(matches!(err, HistoryError::LayoutMismatch { shard: 'c', .. }), "{err}");
    }
}
