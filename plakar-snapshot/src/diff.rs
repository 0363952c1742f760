//! Compare two snapshots entry by entry.

use anyhow::Error;

use crate::entry::Entry;
use crate::vfs::Snapshot;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffChange {
    Added(String),
    Removed(String),
    Modified(String),
}

impl DiffChange {
    pub fn path(&self) -> &str {
        match self {
            DiffChange::Added(path) | DiffChange::Removed(path) | DiffChange::Modified(path) => {
                path
            }
        }
    }
}

/// Paths that differ between `old` and `new`, in path order.
///
/// Both entry streams are already sorted, so this is a linear merge.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Result<Vec<DiffChange>, Error> {
    let mut changes = Vec::new();

    let mut old_iter = old.entries().peekable();
    let mut new_iter = new.entries().peekable();

    loop {
        let advance = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(Err(_)), _) => {
                old_iter.next().transpose()?;
                unreachable!();
            }
            (_, Some(Err(_))) => {
                new_iter.next().transpose()?;
                unreachable!();
            }
            (Some(Ok((old_path, _))), None) => (Some(old_path.clone()), None),
            (None, Some(Ok((new_path, _)))) => (None, Some(new_path.clone())),
            (Some(Ok((old_path, _))), Some(Ok((new_path, _)))) => {
                if old_path < new_path {
                    (Some(old_path.clone()), None)
                } else if old_path > new_path {
                    (None, Some(new_path.clone()))
                } else {
                    (Some(old_path.clone()), Some(new_path.clone()))
                }
            }
        };

        match advance {
            (Some(path), None) => {
                old_iter.next();
                changes.push(DiffChange::Removed(path));
            }
            (None, Some(path)) => {
                new_iter.next();
                changes.push(DiffChange::Added(path));
            }
            (Some(path), Some(_)) => {
                let (_, old_entry) = old_iter.next().unwrap()?;
                let (_, new_entry) = new_iter.next().unwrap()?;
                if entries_differ(&old_entry, &new_entry) {
                    changes.push(DiffChange::Modified(path));
                }
            }
            (None, None) => unreachable!(),
        }
    }

    Ok(changes)
}

fn entries_differ(old: &Entry, new: &Entry) -> bool {
    old.kind != new.kind
        || old.object != new.object
        || old.link_target != new.link_target
        || old.stat.mode != new.stat.mode
        || old.stat.size != new.stat.size
        || old.stat.uid != new.stat.uid
        || old.stat.gid != new.stat.gid
}
