//! Integrity verification.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Error;

use plakar_repository::packfile::Packfile;
use plakar_repository::Repository;
use plakar_types::{CancelToken, Event, EventSink, Mac};

use crate::btree::BtreeReader;
use crate::vfs::Snapshot;

#[derive(Default)]
pub struct CheckReport {
    pub checked_blobs: u64,
    pub corrupt: Vec<(Mac, String)>,
    pub missing: Vec<Mac>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }

    fn blob(&mut self, repo: &Repository, mac: &Mac, fast: bool) {
        self.checked_blobs += 1;
        if fast {
            if !repo.has_blob(mac) {
                self.missing.push(*mac);
            }
            return;
        }
        match repo.resolve(mac) {
            Ok(_) => {}
            Err(err) => match err.downcast_ref::<plakar_types::RepositoryError>() {
                Some(plakar_types::RepositoryError::BlobNotFound(_)) => self.missing.push(*mac),
                _ => self.corrupt.push((*mac, err.to_string())),
            },
        }
    }
}

/// Verify that a snapshot's full blob graph is present (and, unless
/// `fast`, that every blob decodes and passes MAC verification).
pub fn check_snapshot(
    snapshot: &Snapshot,
    fast: bool,
    cancel: &CancelToken,
    events: &dyn EventSink,
) -> Result<CheckReport, Error> {
    events.emit(Event::CheckStarted {
        snapshot: snapshot.id(),
    });
    let repo = snapshot.repository();
    let mut report = CheckReport::default();
    let mut seen: HashSet<Mac> = HashSet::new();

    report.blob(repo, &snapshot.id(), fast);

    let reader = BtreeReader::new(repo);
    for tree in [&snapshot.header().vfs, &snapshot.header().errors] {
        for mac in reader.node_macs(&tree.root)? {
            cancel.check()?;
            if seen.insert(mac) {
                report.blob(repo, &mac, fast);
            }
        }
    }

    for item in snapshot.entries() {
        cancel.check()?;
        let (path, entry) = match item {
            Ok(item) => item,
            Err(err) => {
                log::warn!("unreadable entry while checking - {}", err);
                continue;
            }
        };

        for xattr in &entry.xattrs {
            if seen.insert(xattr.blob) {
                report.blob(repo, &xattr.blob, fast);
            }
        }
        let Some(object_mac) = entry.object else {
            continue;
        };
        if !seen.insert(object_mac) {
            continue;
        }
        report.blob(repo, &object_mac, fast);

        match snapshot.object_for(&path) {
            Ok(object) => {
                for chunk in &object.chunks {
                    cancel.check()?;
                    if seen.insert(chunk.mac) {
                        report.blob(repo, &chunk.mac, fast);
                    }
                }
            }
            Err(err) => {
                log::warn!("unreadable object for {} - {}", path, err);
            }
        }
    }

    for (mac, message) in &report.corrupt {
        events.emit(Event::BlobCorrupt {
            mac: *mac,
            message: message.clone(),
        });
    }
    Ok(report)
}

/// Parse every packfile, verify footer and index MAC, decode every blob
/// and recompute its MAC against the index record.
pub fn check_packfiles(
    repo: &Arc<Repository>,
    cancel: &CancelToken,
    events: &dyn EventSink,
) -> Result<CheckReport, Error> {
    let mut report = CheckReport::default();

    for packfile_mac in repo.store().list_packfiles()? {
        cancel.check()?;
        let raw = match repo.store().get_packfile(&packfile_mac) {
            Ok(raw) => raw,
            Err(err) => {
                report.corrupt.push((packfile_mac, err.to_string()));
                continue;
            }
        };
        let packfile = match Packfile::parse(repo.hasher(), &raw) {
            Ok(packfile) => packfile,
            Err(err) => {
                report.corrupt.push((packfile_mac, err.to_string()));
                continue;
            }
        };

        for record in &packfile.index {
            cancel.check()?;
            report.checked_blobs += 1;
            let raw_blob = packfile.get_blob(&record.mac).unwrap_or(&[]);
            match repo.decode_payload(raw_blob, record.flags) {
                Ok(payload) if repo.mac(&payload) == record.mac => {}
                Ok(_) => report.corrupt.push((
                    record.mac,
                    format!("MAC mismatch inside packfile {}", packfile_mac),
                )),
                Err(err) => report.corrupt.push((record.mac, err.to_string())),
            }
        }
    }

    for (mac, message) in &report.corrupt {
        events.emit(Event::BlobCorrupt {
            mac: *mac,
            message: message.clone(),
        });
    }
    Ok(report)
}
