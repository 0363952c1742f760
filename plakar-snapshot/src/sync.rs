//! Synchronise snapshots between repositories.
//!
//! Blobs are re-wrapped for the destination's envelope: they are resolved
//! to plaintext on the source side and handed to a destination
//! transaction, so the two repositories may differ in compression and
//! packfile placement. Both must share the same MAC keyspace (same master
//! key, or both unencrypted), otherwise the copied graph's internal
//! references would dangle; this is verified blob by blob.

use std::sync::Arc;

use anyhow::{bail, Error};

use plakar_repository::{Repository, Transaction};
use plakar_types::{CancelToken, Mac};

use crate::maintenance::reachable_blobs;

pub struct SyncResult {
    pub snapshots: u64,
    pub blobs: u64,
}

/// Copy every snapshot present in `source` but absent from `target`.
pub fn sync(
    source: &Arc<Repository>,
    target: &Arc<Repository>,
    cancel: &CancelToken,
    concurrency: usize,
) -> Result<SyncResult, Error> {
    let known: Vec<Mac> = target.list_snapshots();
    let missing: Vec<Mac> = source
        .list_snapshots()
        .into_iter()
        .filter(|mac| !known.contains(mac))
        .collect();
    if missing.is_empty() {
        return Ok(SyncResult {
            snapshots: 0,
            blobs: 0,
        });
    }

    let txn = target.begin_transaction(cancel, concurrency)?;
    match copy_snapshots(source, target, &txn, &missing, cancel) {
        Ok(result) => {
            txn.commit()?;
            Ok(result)
        }
        Err(err) => {
            txn.rollback();
            Err(err)
        }
    }
}

fn copy_snapshots(
    source: &Arc<Repository>,
    target: &Arc<Repository>,
    txn: &Transaction,
    missing: &[Mac],
    cancel: &CancelToken,
) -> Result<SyncResult, Error> {
    let mut result = SyncResult {
        snapshots: 0,
        blobs: 0,
    };

    for snapshot_id in missing {
        cancel.check()?;
        log::info!("syncing snapshot {}", snapshot_id.short());

        let mut blobs: Vec<Mac> = reachable_blobs(source, *snapshot_id, cancel)?
            .into_iter()
            .collect();
        blobs.sort();
        for mac in blobs {
            cancel.check()?;
            if target.has_blob(&mac) || txn.has_blob(&mac) {
                continue;
            }
            let location = source
                .get_location(&mac)
                .ok_or(plakar_types::RepositoryError::BlobNotFound(mac))?;
            let payload = source.resolve(&mac)?;
            let (copied, _) = txn.put_blob(location.resource, &payload)?;
            if copied != mac {
                bail!("repositories use different MAC keys; refusing to sync");
            }
            result.blobs += 1;
        }
        result.snapshots += 1;
    }
    Ok(result)
}
