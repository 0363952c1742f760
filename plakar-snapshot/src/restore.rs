//! Restore a snapshot subtree through an exporter.

use anyhow::Error;

use plakar_types::{CancelToken, Event, EventSink};

use crate::entry::EntryKind;
use crate::exporter::Exporter;
use crate::vfs::Snapshot;

pub struct RestoreResult {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Restore every entry under `base` (use `"/"` for the full snapshot).
pub fn restore(
    snapshot: &Snapshot,
    exporter: &dyn Exporter,
    base: &str,
    cancel: &CancelToken,
    events: &dyn EventSink,
) -> Result<RestoreResult, Error> {
    events.emit(Event::RestoreStarted {
        snapshot: snapshot.id(),
    });

    let mut result = RestoreResult {
        files: 0,
        directories: 0,
        bytes: 0,
        errors: 0,
    };

    // pass 1: content; pass 2 fixes directory modes bottom-up so a
    // read-only directory cannot block its own children
    let mut directories = Vec::new();
    for item in snapshot.entries() {
        cancel.check()?;
        let (path, entry) = item?;
        if !in_subtree(&path, base) {
            continue;
        }

        let outcome = match entry.kind {
            EntryKind::Directory => {
                directories.push((path.clone(), entry.stat.clone()));
                result.directories += 1;
                exporter.mkdir(&path)
            }
            EntryKind::Symlink => match &entry.link_target {
                Some(target) => exporter.symlink(&path, target),
                None => Ok(()),
            },
            EntryKind::File => match snapshot.read_file(&path) {
                Ok(mut reader) => exporter.write_file(&path, &mut reader).map(|written| {
                    result.files += 1;
                    result.bytes += written;
                    exporter
                        .chmod(&path, &entry.stat)
                        .unwrap_or_else(|err| log::warn!("chmod {} failed - {}", path, err));
                }),
                Err(err) => Err(err),
            },
            // device nodes are recorded but not recreated
            EntryKind::Device => Ok(()),
        };

        match outcome {
            Ok(_) => events.emit(Event::PathRestored { path }),
            Err(err) => {
                log::warn!("unable to restore {} - {}", path, err);
                result.errors += 1;
            }
        }
    }

    for (path, stat) in directories.iter().rev() {
        if let Err(err) = exporter.chmod(path, stat) {
            log::warn!("chmod {} failed - {}", path, err);
        }
    }

    Ok(result)
}

fn in_subtree(path: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    path == base || path.starts_with(&format!("{}/", base))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subtree_matching() {
        assert!(in_subtree("/a/b", "/"));
        assert!(in_subtree("/a/b", "/a"));
        assert!(in_subtree("/a", "/a"));
        assert!(!in_subtree("/ab", "/a"));
        assert!(!in_subtree("/b", "/a"));
    }
}
