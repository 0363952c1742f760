//! Content-addressed, immutable B+tree.
//!
//! Both snapshot trees (path -> entry MAC) and error trees (path ->
//! message) are stored as B+tree nodes, each node its own blob. Trees are
//! bulk-built from keys arriving in ascending order and never mutated;
//! lookups descend from the root, iteration walks the leaves in order.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use plakar_repository::{Repository, Transaction};
use plakar_types::{Mac, ResourceType};

/// Maximum number of keys per node.
const ORDER: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub level: u32,
    pub keys: Vec<String>,
    /// Leaf nodes carry payloads, internal nodes carry child MACs in hex.
    pub values: Vec<String>,
}

impl Node {
    fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        let node: Node = serde_json::from_slice(data)?;
        if node.keys.len() != node.values.len() {
            bail!("corrupt btree node: {} keys, {} values", node.keys.len(), node.values.len());
        }
        Ok(node)
    }
}

/// Root descriptor returned by the writer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BtreeInfo {
    pub root: Mac,
    pub depth: u32,
    pub count: u64,
}

pub struct BtreeWriter<'a> {
    txn: &'a Transaction,
    resource: ResourceType,
    leaf: Node,
    /// Pending `(first key, node MAC)` pairs per level above the leaves.
    levels: Vec<Vec<(String, Mac)>>,
    last_key: Option<String>,
    count: u64,
}

impl<'a> BtreeWriter<'a> {
    pub fn new(txn: &'a Transaction, resource: ResourceType) -> Self {
        Self {
            txn,
            resource,
            leaf: Node {
                level: 0,
                keys: Vec::new(),
                values: Vec::new(),
            },
            levels: Vec::new(),
            last_key: None,
            count: 0,
        }
    }

    /// Insert the next key; keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if let Some(last) = &self.last_key {
            if key <= last.as_str() {
                bail!("btree keys out of order: '{}' after '{}'", key, last);
            }
        }
        self.last_key = Some(key.to_string());
        self.leaf.keys.push(key.to_string());
        self.leaf.values.push(value.to_string());
        self.count += 1;

        if self.leaf.keys.len() >= ORDER {
            self.flush_leaf()?;
        }
        Ok(())
    }

    fn flush_leaf(&mut self) -> Result<(), Error> {
        if self.leaf.keys.is_empty() {
            return Ok(());
        }
        let node = std::mem::replace(
            &mut self.leaf,
            Node {
                level: 0,
                keys: Vec::new(),
                values: Vec::new(),
            },
        );
        let first = node.keys[0].clone();
        let mac = self.write_node(&node)?;
        self.push_up(0, first, mac)
    }

    fn push_up(&mut self, level: usize, first: String, mac: Mac) -> Result<(), Error> {
        if self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push((first, mac));

        if self.levels[level].len() >= ORDER {
            let children = std::mem::take(&mut self.levels[level]);
            let (first, mac) = self.write_internal(level as u32 + 1, children)?;
            self.push_up(level + 1, first, mac)?;
        }
        Ok(())
    }

    fn write_internal(
        &self,
        level: u32,
        children: Vec<(String, Mac)>,
    ) -> Result<(String, Mac), Error> {
        let node = Node {
            level,
            keys: children.iter().map(|(key, _)| key.clone()).collect(),
            values: children.iter().map(|(_, mac)| mac.to_string()).collect(),
        };
        let first = node.keys[0].clone();
        let mac = self.write_node(&node)?;
        Ok((first, mac))
    }

    fn write_node(&self, node: &Node) -> Result<Mac, Error> {
        let (mac, _) = self.txn.put_blob(self.resource, &node.serialize()?)?;
        Ok(mac)
    }

    /// Flush all partial nodes and return the root descriptor.
    pub fn finish(mut self) -> Result<BtreeInfo, Error> {
        self.flush_leaf()?;

        if self.levels.is_empty() {
            // empty tree: a single empty leaf is the root
            let node = Node {
                level: 0,
                keys: Vec::new(),
                values: Vec::new(),
            };
            let mac = self.write_node(&node)?;
            return Ok(BtreeInfo {
                root: mac,
                depth: 1,
                count: 0,
            });
        }

        let mut level = 0;
        loop {
            let is_top = level + 1 >= self.levels.len();
            let pending = std::mem::take(&mut self.levels[level]);
            match (pending.len(), is_top) {
                (0, _) => {}
                (1, true) => {
                    return Ok(BtreeInfo {
                        root: pending[0].1,
                        depth: level as u32 + 1,
                        count: self.count,
                    });
                }
                (_, _) => {
                    let (first, mac) = self.write_internal(level as u32 + 1, pending)?;
                    if self.levels.len() <= level + 1 {
                        self.levels.push(Vec::new());
                    }
                    self.levels[level + 1].push((first, mac));
                }
            }
            level += 1;
            if level >= self.levels.len() {
                bail!("btree writer finished without a root");
            }
        }
    }
}

#[derive(Clone, Copy)]
pub struct BtreeReader<'a> {
    repo: &'a Repository,
}

impl<'a> BtreeReader<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    fn load(&self, mac: &Mac) -> Result<Node, Error> {
        Node::deserialize(&self.repo.resolve(mac)?)
    }

    /// Look up one key, descending from the root.
    pub fn lookup(&self, root: &Mac, key: &str) -> Result<Option<String>, Error> {
        let mut node = self.load(root)?;
        loop {
            if node.level == 0 {
                return Ok(match node.keys.binary_search_by(|probe| probe.as_str().cmp(key)) {
                    Ok(idx) => Some(node.values[idx].clone()),
                    Err(_) => None,
                });
            }
            // descend into the rightmost child whose first key is <= key
            let idx = match node.keys.binary_search_by(|probe| probe.as_str().cmp(key)) {
                Ok(idx) => idx,
                Err(0) => return Ok(None),
                Err(idx) => idx - 1,
            };
            let child: Mac = node.values[idx].parse()?;
            node = self.load(&child)?;
        }
    }

    /// In-order iteration over every `(key, value)` pair.
    pub fn iter(&self, root: &Mac) -> BtreeIter<'a> {
        BtreeIter {
            reader: *self,
            stack: vec![(*root, 0)],
            current: None,
        }
    }

    /// Every node MAC in the tree, the root included (used by reachability
    /// walks).
    pub fn node_macs(&self, root: &Mac) -> Result<Vec<Mac>, Error> {
        let mut result = vec![*root];
        let mut queue = vec![*root];
        while let Some(mac) = queue.pop() {
            let node = self.load(&mac)?;
            if node.level > 0 {
                for value in &node.values {
                    let child: Mac = value.parse()?;
                    result.push(child);
                    queue.push(child);
                }
            }
        }
        Ok(result)
    }
}

pub struct BtreeIter<'a> {
    reader: BtreeReader<'a>,
    /// Internal node positions still to visit.
    stack: Vec<(Mac, usize)>,
    current: Option<(Node, usize)>,
}

impl Iterator for BtreeIter<'_> {
    type Item = Result<(String, String), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((node, idx)) = &mut self.current {
                if *idx < node.keys.len() {
                    let item = (node.keys[*idx].clone(), node.values[*idx].clone());
                    *idx += 1;
                    return Some(Ok(item));
                }
                self.current = None;
            }

            let (mac, child_idx) = self.stack.pop()?;
            let node = match self.reader.load(&mac) {
                Ok(node) => node,
                Err(err) => return Some(Err(err)),
            };
            if node.level == 0 {
                self.current = Some((node, 0));
                continue;
            }
            if child_idx < node.values.len() {
                let child: Mac = match node.values[child_idx].parse() {
                    Ok(mac) => mac,
                    Err(err) => return Some(Err(err)),
                };
                self.stack.push((mac, child_idx + 1));
                self.stack.push((child, 0));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    use plakar_cache::CacheManager;
    use plakar_store::StoreRegistry;
    use plakar_types::CancelToken;

    fn scratch_repo() -> (tempfile::TempDir, Arc<Repository>) {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::default();
        let cache = CacheManager::new(dir.path().join("cache"));
        let location = dir.path().join("repo").to_string_lossy().to_string();
        let repo =
            Arc::new(Repository::create(&registry, &location, &cache, None, true).unwrap());
        (dir, repo)
    }

    #[test]
    fn build_lookup_iterate() -> Result<(), Error> {
        let (_dir, repo) = scratch_repo();
        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;

        let keys: Vec<String> = (0..500).map(|n| format!("/path/{:05}", n)).collect();
        let mut writer = BtreeWriter::new(&txn, ResourceType::VfsBtree);
        for key in &keys {
            writer.add(key, &format!("value-of-{}", key))?;
        }
        let info = writer.finish()?;
        assert_eq!(info.count, 500);
        assert!(info.depth >= 2);
        txn.commit()?;

        let reader = BtreeReader::new(&repo);
        assert_eq!(
            reader.lookup(&info.root, "/path/00042")?.unwrap(),
            "value-of-/path/00042"
        );
        assert!(reader.lookup(&info.root, "/path/99999")?.is_none());
        assert!(reader.lookup(&info.root, "/aaa")?.is_none());

        let walked: Vec<String> = reader
            .iter(&info.root)
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(walked, keys);
        Ok(())
    }

    #[test]
    fn empty_tree_has_a_root() -> Result<(), Error> {
        let (_dir, repo) = scratch_repo();
        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;
        let info = BtreeWriter::new(&txn, ResourceType::ErrorBtree).finish()?;
        assert_eq!(info.count, 0);
        txn.commit()?;

        let reader = BtreeReader::new(&repo);
        assert!(reader.lookup(&info.root, "/any")?.is_none());
        assert_eq!(reader.iter(&info.root).count(), 0);
        Ok(())
    }

    #[test]
    fn rejects_unsorted_keys() -> Result<(), Error> {
        let (_dir, repo) = scratch_repo();
        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;
        let mut writer = BtreeWriter::new(&txn, ResourceType::VfsBtree);
        writer.add("/b", "1")?;
        assert!(writer.add("/a", "2").is_err());
        txn.rollback();
        Ok(())
    }
}
