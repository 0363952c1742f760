//! Snapshot removal and garbage collection.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Error;

use plakar_repository::{Repository, StateRecord};
use plakar_types::{CancelToken, Event, EventSink, Mac, RepositoryError};

use crate::btree::BtreeReader;
use crate::vfs::Snapshot;

/// Tombstone snapshot root blobs; the data they reference is reclaimed by
/// [`garbage_collect`].
pub fn remove_snapshots(repo: &Arc<Repository>, snapshots: &[Mac]) -> Result<Mac, Error> {
    let mut records = Vec::with_capacity(snapshots.len());
    for mac in snapshots {
        if !repo.has_blob(mac) {
            return Err(RepositoryError::SnapshotNotFound(mac.to_string()).into());
        }
        records.push(StateRecord::Tombstone { blob: *mac });
    }
    repo.write_state(records)
}

/// Every blob MAC reachable from one snapshot root.
pub fn reachable_blobs(
    repo: &Arc<Repository>,
    snapshot_id: Mac,
    cancel: &CancelToken,
) -> Result<HashSet<Mac>, Error> {
    let snapshot = Snapshot::load(repo, snapshot_id)?;
    let mut reachable = HashSet::new();
    reachable.insert(snapshot_id);

    let reader = BtreeReader::new(repo);
    for tree in [&snapshot.header().vfs, &snapshot.header().errors] {
        for mac in reader.node_macs(&tree.root)? {
            cancel.check()?;
            reachable.insert(mac);
        }
    }

    for item in reader.iter(&snapshot.header().vfs.root) {
        cancel.check()?;
        let (_, value) = item?;
        let entry_mac: Mac = value.parse()?;
        reachable.insert(entry_mac);

        let entry = crate::entry::Entry::deserialize(&repo.resolve(&entry_mac)?)?;
        for xattr in &entry.xattrs {
            reachable.insert(xattr.blob);
        }
        if let Some(object_mac) = entry.object {
            reachable.insert(object_mac);
            let object = crate::object::Object::deserialize(&repo.resolve(&object_mac)?)?;
            for chunk in &object.chunks {
                reachable.insert(chunk.mac);
            }
        }
    }
    Ok(reachable)
}

pub struct MaintenanceReport {
    pub blobs_tombstoned: u64,
    pub packfiles_deleted: u64,
    pub states_pruned: u64,
}

/// Reachability GC.
///
/// Walks every live snapshot, tombstones blobs nothing references any
/// more, then deletes packfiles whose every blob is tombstoned. Fully
/// shadowed states (every record superseded) are pruned afterwards by
/// rewriting the survivor set into a fresh state.
pub fn garbage_collect(
    repo: &Arc<Repository>,
    cancel: &CancelToken,
    events: &dyn EventSink,
) -> Result<MaintenanceReport, Error> {
    let mut reachable: HashSet<Mac> = HashSet::new();
    for snapshot_id in repo.list_snapshots() {
        cancel.check()?;
        reachable.extend(reachable_blobs(repo, snapshot_id, cancel)?);
    }

    // tombstone everything unreachable
    let mut tombstones = Vec::new();
    for (mac, _) in repo.blobs_by_packfile().iter().flat_map(|(packfile, blobs)| {
        blobs.iter().map(move |blob| (*blob, *packfile))
    }) {
        if !reachable.contains(&mac) {
            tombstones.push(StateRecord::Tombstone { blob: mac });
        }
    }
    let blobs_tombstoned = tombstones.len() as u64;
    if !tombstones.is_empty() {
        repo.write_state(tombstones)?;
    }

    // delete packfiles with no live blob left
    let mut packfiles_deleted = 0;
    let live: HashSet<Mac> = repo
        .blobs_by_packfile()
        .keys()
        .copied()
        .collect();
    for packfile in repo.store().list_packfiles()? {
        cancel.check()?;
        if !live.contains(&packfile) {
            match repo.store().delete_packfile(&packfile) {
                Ok(()) => packfiles_deleted += 1,
                Err(err) => log::warn!("unable to delete packfile {} - {}", packfile.short(), err),
            }
        }
    }

    // squash the state history into one surviving state
    let mut states_pruned = 0;
    if packfiles_deleted > 0 || blobs_tombstoned > 0 {
        let old_states = repo.store().list_states()?;
        let survivors: Vec<StateRecord> = repo
            .blobs_by_packfile()
            .into_iter()
            .flat_map(|(_, blobs)| blobs)
            .filter_map(|blob| {
                repo.get_location(&blob)
                    .map(|location| StateRecord::Location { blob, location })
            })
            .collect();
        let fresh = repo.write_state(survivors)?;
        for state in old_states {
            if state == fresh {
                continue;
            }
            cancel.check()?;
            match repo.delete_state(&state) {
                Ok(()) => states_pruned += 1,
                Err(err) => log::warn!("unable to prune state {} - {}", state.short(), err),
            }
        }
        repo.rebuild_aggregate()?;
    }

    events.emit(Event::MaintenanceDone {
        packfiles_deleted,
        blobs_tombstoned,
    });
    Ok(MaintenanceReport {
        blobs_tombstoned,
        packfiles_deleted,
        states_pruned,
    })
}
