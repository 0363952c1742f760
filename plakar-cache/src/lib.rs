//! Per-repository embedded caches.
//!
//! Each repository gets one sled database under the user cache directory,
//! holding the serialised aggregate state, per-path fingerprints for
//! unchanged-file reuse, and short-lived scan working sets keyed by a
//! random transaction identifier. sled holds an exclusive lock on the
//! database directory; a second opener surfaces `InUse`, which is how the
//! agentless CLI detects that an agent (or another process) owns the cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use plakar_types::{Mac, RepositoryError};

/// Stat fingerprint of a source path; when unchanged, the previous object
/// can be reused without re-chunking the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathFingerprint {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub inode: u64,
    pub object: Mac,
    pub entropy: f64,
    /// Exact serialized entry bytes, so the reused entry blob keeps its MAC.
    pub entry: String,
}

pub struct CacheManager {
    base: PathBuf,
}

impl CacheManager {
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Open (creating if needed) the cache of one repository.
    pub fn repository(&self, id: Uuid) -> Result<Arc<RepositoryCache>, Error> {
        let path = self.base.join("repositories").join(id.to_string());
        std::fs::create_dir_all(&path)
            .with_context(|| format!("unable to create cache directory {:?}", path))?;

        let db = match sled::Config::new().path(&path).open() {
            Ok(db) => db,
            Err(sled::Error::Io(err)) => {
                // sled holds a file lock on the database directory
                return Err(RepositoryError::InUse(format!(
                    "cache {:?} ({})",
                    path, err
                ))
                .into());
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Arc::new(RepositoryCache { db }))
    }
}

#[derive(Debug)]
pub struct RepositoryCache {
    db: sled::Db,
}

const AGGREGATE_TREE: &str = "aggregate";
const FINGERPRINT_TREE: &str = "fingerprints";

impl RepositoryCache {
    /// Load the cached aggregate state if it was built from exactly the
    /// given set of states (identified by `tag`).
    pub fn get_aggregate(&self, tag: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let tree = self.db.open_tree(AGGREGATE_TREE)?;
        match tree.get(b"tag")? {
            Some(stored) if stored.as_ref() == tag => {
                Ok(tree.get(b"data")?.map(|v| v.to_vec()))
            }
            _ => Ok(None),
        }
    }

    pub fn put_aggregate(&self, tag: &[u8], data: &[u8]) -> Result<(), Error> {
        let tree = self.db.open_tree(AGGREGATE_TREE)?;
        tree.insert(b"tag", tag)?;
        tree.insert(b"data", data)?;
        tree.flush()?;
        Ok(())
    }

    pub fn invalidate_aggregate(&self) -> Result<(), Error> {
        let tree = self.db.open_tree(AGGREGATE_TREE)?;
        tree.remove(b"tag")?;
        tree.remove(b"data")?;
        Ok(())
    }

    pub fn get_fingerprint(&self, path: &str) -> Result<Option<PathFingerprint>, Error> {
        let tree = self.db.open_tree(FINGERPRINT_TREE)?;
        match tree.get(path.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_fingerprint(&self, path: &str, fingerprint: &PathFingerprint) -> Result<(), Error> {
        let tree = self.db.open_tree(FINGERPRINT_TREE)?;
        tree.insert(path.as_bytes(), serde_json::to_vec(fingerprint)?)?;
        Ok(())
    }

    /// Open the scan working set of one backup transaction.
    pub fn scan_set(&self, txn: Uuid) -> Result<ScanSet, Error> {
        let name = format!("scan:{}", txn);
        Ok(ScanSet {
            tree: self.db.open_tree(name.as_bytes())?,
        })
    }

    /// Drop a transaction's working set (after commit or abort).
    pub fn delete_scan_set(&self, txn: Uuid) -> Result<(), Error> {
        let name = format!("scan:{}", txn);
        self.db.drop_tree(name.as_bytes())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }
}

/// Ordered path -> value working set; iteration follows sled's key order,
/// which is bytewise lexicographic over the path.
pub struct ScanSet {
    tree: sled::Tree,
}

impl ScanSet {
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>> {
        self.tree
            .iter()
            .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from))
    }

    pub fn iter_rev(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>> {
        self.tree
            .iter()
            .rev()
            .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aggregate_tag_check() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let manager = CacheManager::new(dir.path());
        let cache = manager.repository(Uuid::new_v4())?;

        assert!(cache.get_aggregate(b"tag-1")?.is_none());
        cache.put_aggregate(b"tag-1", b"payload")?;
        assert_eq!(cache.get_aggregate(b"tag-1")?.unwrap(), b"payload");
        // a different state set misses
        assert!(cache.get_aggregate(b"tag-2")?.is_none());
        Ok(())
    }

    #[test]
    fn scan_set_orders_paths() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let manager = CacheManager::new(dir.path());
        let cache = manager.repository(Uuid::new_v4())?;

        let txn = Uuid::new_v4();
        let set = cache.scan_set(txn)?;
        set.put(b"/b", b"2")?;
        set.put(b"/a/x", b"1")?;
        set.put(b"/a", b"0")?;

        let keys: Vec<Vec<u8>> = set.iter().map(|item| item.unwrap().0).collect();
        assert_eq!(keys, vec![b"/a".to_vec(), b"/a/x".to_vec(), b"/b".to_vec()]);

        let reversed: Vec<Vec<u8>> = set.iter_rev().map(|item| item.unwrap().0).collect();
        assert_eq!(reversed, vec![b"/b".to_vec(), b"/a/x".to_vec(), b"/a".to_vec()]);

        cache.delete_scan_set(txn)?;
        let set = cache.scan_set(txn)?;
        assert!(set.is_empty());
        Ok(())
    }

    #[test]
    fn concurrent_open_is_in_use() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let manager = CacheManager::new(dir.path());
        let id = Uuid::new_v4();

        let _first = manager.repository(id)?;
        let err = manager.repository(id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepositoryError>(),
            Some(RepositoryError::InUse(_))
        ));
        Ok(())
    }
}
