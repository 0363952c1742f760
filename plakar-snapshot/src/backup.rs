//! Backup pipeline.
//!
//! Bounded-concurrency stages: the importer's scan stream feeds a worker
//! pool; each worker chunks, hashes, deduplicates and packs one file at a
//! time and records the resulting entry in the transaction's scan working
//! set. Finalisation iterates the working set in path order, rolls up
//! subtree summaries, builds the VFS and error B-trees, writes the
//! snapshot header and commits. Per-entry failures land in the error tree;
//! transaction-fatal failures abort without producing a snapshot MAC.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Context, Error};
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};

use plakar_cache::PathFingerprint;
use plakar_repository::{chunker, Repository, Transaction};
use plakar_types::{CancelToken, Event, EventSink, Mac, ResourceType};

use crate::btree::BtreeWriter;
use crate::entry::{mime_category, shannon_entropy, Entry, EntryKind, Summary, XattrRef};
use crate::header::{ClientInfo, ImporterInfo, SnapshotHeader};
use crate::importer::{Importer, ScanError, ScanRecord, ScanResult};
use crate::object::{ChunkRef, Object};

#[derive(Clone)]
pub struct BackupOptions {
    pub tags: Vec<String>,
    pub concurrency: usize,
    pub client_version: String,
}

impl Default for BackupOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            tags: Vec::new(),
            concurrency: cpus * 8 + 1,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct BackupResult {
    pub snapshot: Mac,
    pub header: SnapshotHeader,
    pub files: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Value stored in the scan working set for every scanned path.
#[derive(Serialize, Deserialize)]
struct ScanSetEntry {
    entry: Entry,
    /// Entry blob MAC; directories get theirs during finalisation.
    mac: Option<Mac>,
    entropy: f64,
    category: String,
}

pub fn backup(
    repo: &Arc<Repository>,
    importer: &dyn Importer,
    cancel: &CancelToken,
    events: &Arc<dyn EventSink>,
    options: &BackupOptions,
) -> Result<BackupResult, Error> {
    let started = std::time::Instant::now();
    let timestamp = plakar_repository::epoch_i64();

    let txn = repo.begin_transaction(cancel, options.concurrency)?;
    events.emit(Event::BackupStarted {
        root: importer.root(),
    });

    match run_pipeline(repo, &txn, importer, cancel, events, options) {
        Ok(outcome) => finalize(repo, txn, importer, outcome, options, timestamp, started, events),
        Err(err) => {
            txn.rollback();
            Err(err)
        }
    }
}

struct PipelineOutcome {
    errors: Vec<ScanError>,
    files: u64,
    bytes: u64,
}

fn run_pipeline(
    repo: &Arc<Repository>,
    txn: &Transaction,
    importer: &dyn Importer,
    cancel: &CancelToken,
    events: &Arc<dyn EventSink>,
    options: &BackupOptions,
) -> Result<PipelineOutcome, Error> {
    let scan_set = repo.cache().scan_set(txn.id())?;
    let errors: Mutex<Vec<ScanError>> = Mutex::new(Vec::new());
    let files = Mutex::new(0u64);
    let bytes = Mutex::new(0u64);
    let fatal: Mutex<Option<Error>> = Mutex::new(None);

    let workers = options.concurrency.clamp(1, 64);
    let (work_tx, work_rx) = bounded::<ScanRecord>(workers * 4);

    std::thread::scope(|scope| -> Result<(), Error> {
        let scan = importer.scan()?;

        // stage 1: scan producer
        let producer = {
            let errors = &errors;
            let events = Arc::clone(events);
            let cancel = cancel.clone();
            scope.spawn(move || {
                for result in scan {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match result {
                        ScanResult::Record(record) => {
                            if work_tx.send(record).is_err() {
                                break;
                            }
                        }
                        ScanResult::Error(error) => {
                            events.emit(Event::PathError {
                                path: error.path.clone(),
                                message: error.message.clone(),
                            });
                            errors.lock().unwrap().push(error);
                        }
                    }
                }
                // closing the channel ends the workers
                drop(work_tx);
            })
        };

        // stage 2..4: chunk, dedup/pack, object assembly
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let scan_set = &scan_set;
            let errors = &errors;
            let files = &files;
            let bytes = &bytes;
            let fatal = &fatal;
            let events = Arc::clone(events);
            let cancel = cancel.clone();
            handles.push(scope.spawn(move || {
                while let Ok(record) = work_rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match process_record(repo, txn, importer, &record, &events) {
                        Ok(Some(produced)) => {
                            let raw = match serde_json::to_vec(&produced) {
                                Ok(raw) => raw,
                                Err(err) => {
                                    set_fatal(fatal, err.into(), &cancel);
                                    break;
                                }
                            };
                            if let Err(err) = scan_set.put(record.path().as_bytes(), &raw) {
                                set_fatal(fatal, err, &cancel);
                                break;
                            }
                            if matches!(produced.entry.kind, EntryKind::File) {
                                *files.lock().unwrap() += 1;
                                *bytes.lock().unwrap() += produced.entry.stat.size;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            if plakar_types::is_cancelled(&err) {
                                break;
                            }
                            // per-entry failure: record and continue
                            let error = ScanError {
                                path: record.path().to_string(),
                                message: err.to_string(),
                            };
                            events.emit(Event::PathError {
                                path: error.path.clone(),
                                message: error.message.clone(),
                            });
                            errors.lock().unwrap().push(error);
                        }
                    }
                }
            }));
        }
        drop(work_rx);

        let _ = producer.join();
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    })?;

    if let Some(err) = fatal.lock().unwrap().take() {
        return Err(err);
    }
    cancel.check()?;

    Ok(PipelineOutcome {
        errors: errors.into_inner().unwrap(),
        files: files.into_inner().unwrap(),
        bytes: bytes.into_inner().unwrap(),
    })
}

fn set_fatal(slot: &Mutex<Option<Error>>, err: Error, cancel: &CancelToken) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
    cancel.cancel();
}

/// Process one scan record; returns the scan-set value, or `None` for
/// records that produce no entry.
fn process_record(
    repo: &Arc<Repository>,
    txn: &Transaction,
    importer: &dyn Importer,
    record: &ScanRecord,
    events: &Arc<dyn EventSink>,
) -> Result<Option<ScanSetEntry>, Error> {
    let produced = match record {
        ScanRecord::Directory { path, stat } => ScanSetEntry {
            entry: Entry {
                kind: EntryKind::Directory,
                name: basename(path),
                path: path.clone(),
                stat: stat.clone(),
                link_target: None,
                object: None,
                xattrs: Vec::new(),
                classifications: Vec::new(),
                summary: None,
            },
            mac: None,
            entropy: 0.0,
            category: String::new(),
        },
        ScanRecord::Symlink { path, stat, target } => {
            let entry = Entry {
                kind: EntryKind::Symlink,
                name: basename(path),
                path: path.clone(),
                stat: stat.clone(),
                link_target: Some(target.clone()),
                object: None,
                xattrs: Vec::new(),
                classifications: Vec::new(),
                summary: None,
            };
            let (mac, _) = txn.put_blob(ResourceType::File, &entry.serialize()?)?;
            ScanSetEntry {
                entry,
                mac: Some(mac),
                entropy: 0.0,
                category: String::new(),
            }
        }
        ScanRecord::Device { path, stat } => {
            let entry = Entry {
                kind: EntryKind::Device,
                name: basename(path),
                path: path.clone(),
                stat: stat.clone(),
                link_target: None,
                object: None,
                xattrs: Vec::new(),
                classifications: Vec::new(),
                summary: None,
            };
            let (mac, _) = txn.put_blob(ResourceType::File, &entry.serialize()?)?;
            ScanSetEntry {
                entry,
                mac: Some(mac),
                entropy: 0.0,
                category: String::new(),
            }
        }
        ScanRecord::File { path, stat } => {
            let produced = process_file(repo, txn, importer, path, stat)?;
            events.emit(Event::PathProcessed {
                path: path.clone(),
                size: stat.size,
            });
            produced
        }
    };
    Ok(Some(produced))
}

fn process_file(
    repo: &Arc<Repository>,
    txn: &Transaction,
    importer: &dyn Importer,
    path: &str,
    stat: &crate::entry::FileStat,
) -> Result<ScanSetEntry, Error> {
    // unchanged-file reuse: skip chunking when the stat fingerprint
    // matches and the previous object is still present
    if let Some(fingerprint) = repo.cache().get_fingerprint(path)? {
        if fingerprint.size == stat.size
            && fingerprint.mtime_secs == stat.mtime_secs
            && fingerprint.mtime_nanos == stat.mtime_nanos
            && fingerprint.inode == stat.inode
            && repo.has_blob(&fingerprint.object)
        {
            let entry = Entry::deserialize(fingerprint.entry.as_bytes())?;
            let (mac, _) = txn.put_blob(ResourceType::File, fingerprint.entry.as_bytes())?;
            let category = mime_category(&entry.name).to_string();
            return Ok(ScanSetEntry {
                entry,
                mac: Some(mac),
                entropy: fingerprint.entropy,
                category,
            });
        }
    }

    let mut reader = importer.open(path)?;
    let mut chunks: Vec<ChunkRef> = Vec::new();
    let mut digest = repo.hasher().streaming();
    let mut counts = [0u64; 256];
    let mut total = 0u64;

    for chunk in chunker::stream(&repo.configuration().chunking, &mut reader) {
        let chunk = chunk.with_context(|| format!("while chunking {}", path))?;
        digest.update(&chunk);
        for &byte in &chunk {
            counts[byte as usize] += 1;
        }
        total += chunk.len() as u64;

        let (mac, _) = txn.put_blob(ResourceType::Chunk, &chunk)?;
        chunks.push(ChunkRef {
            mac,
            length: chunk.len() as u32,
        });
    }

    let entropy = shannon_entropy(&counts, total);
    let category = mime_category(&basename(path)).to_string();
    let object = Object {
        chunks,
        digest: digest.finalize(),
        content_type: category.clone(),
        entropy,
    };
    let (object_mac, _) = txn.put_blob(ResourceType::Object, &object.serialize()?)?;

    let mut xattrs = Vec::new();
    for (name, value) in importer.xattrs(path).unwrap_or_default() {
        let (mac, _) = txn.put_blob(ResourceType::Xattr, &value)?;
        xattrs.push(XattrRef {
            name,
            size: value.len() as u64,
            blob: mac,
        });
    }

    let entry = Entry {
        kind: EntryKind::File,
        name: basename(path),
        path: path.to_string(),
        stat: stat.clone(),
        link_target: None,
        object: Some(object_mac),
        xattrs,
        classifications: vec![category.clone()],
        summary: None,
    };
    let raw_entry = entry.serialize()?;
    let (entry_mac, _) = txn.put_blob(ResourceType::File, &raw_entry)?;

    repo.cache().put_fingerprint(
        path,
        &PathFingerprint {
            size: stat.size,
            mtime_secs: stat.mtime_secs,
            mtime_nanos: stat.mtime_nanos,
            inode: stat.inode,
            object: object_mac,
            entropy,
            entry: String::from_utf8(raw_entry)?,
        },
    )?;

    Ok(ScanSetEntry {
        entry,
        mac: Some(entry_mac),
        entropy,
        category,
    })
}

#[allow(clippy::too_many_arguments)]
fn finalize(
    repo: &Arc<Repository>,
    txn: Transaction,
    importer: &dyn Importer,
    outcome: PipelineOutcome,
    options: &BackupOptions,
    timestamp: i64,
    started: std::time::Instant,
    events: &Arc<dyn EventSink>,
) -> Result<BackupResult, Error> {
    let result = build_and_commit(repo, &txn, importer, &outcome, options, timestamp, started);
    match result {
        Ok((snapshot, header)) => {
            txn.commit()?;
            events.emit(Event::SnapshotCreated { snapshot });
            log::info!(
                "snapshot {} created ({} files, {} bytes, {} errors)",
                snapshot.short(),
                outcome.files,
                outcome.bytes,
                outcome.errors.len()
            );
            Ok(BackupResult {
                snapshot,
                header,
                files: outcome.files,
                bytes: outcome.bytes,
                errors: outcome.errors.len() as u64,
            })
        }
        Err(err) => {
            txn.rollback();
            Err(err)
        }
    }
}

fn build_and_commit(
    repo: &Arc<Repository>,
    txn: &Transaction,
    importer: &dyn Importer,
    outcome: &PipelineOutcome,
    options: &BackupOptions,
    timestamp: i64,
    started: std::time::Instant,
) -> Result<(Mac, SnapshotHeader), Error> {
    let scan_set = repo.cache().scan_set(txn.id())?;

    // per-directory error counts, charged to the containing directory
    let mut error_counts: HashMap<String, u64> = HashMap::new();
    for error in &outcome.errors {
        let dir = parent_path(&error.path).unwrap_or_else(|| "/".to_string());
        *error_counts.entry(dir).or_insert(0) += 1;
    }

    // pass 1 (deepest first): roll up summaries, write directory entries
    let mut accumulators: HashMap<String, Summary> = HashMap::new();
    let mut root_summary = Summary::default();
    for item in scan_set.iter_rev() {
        let (key, value) = item?;
        let path = String::from_utf8(key)?;
        let mut stored: ScanSetEntry = serde_json::from_slice(&value)?;

        match stored.entry.kind {
            EntryKind::Directory => {
                let mut summary = accumulators.remove(&path).unwrap_or_default();
                summary.errors += error_counts.get(&path).copied().unwrap_or(0);
                stored.entry.summary = Some(summary.clone());

                let raw = stored.entry.serialize()?;
                let (mac, _) = txn.put_blob(ResourceType::Directory, &raw)?;
                stored.mac = Some(mac);
                scan_set.put(path.as_bytes(), &serde_json::to_vec(&stored)?)?;

                match parent_path(&path) {
                    Some(parent) => {
                        let up = accumulators.entry(parent).or_default();
                        up.merge(&summary);
                        up.directories += 1;
                    }
                    None => {
                        root_summary = summary;
                        root_summary.directories += 1;
                    }
                }
            }
            _ => {
                let parent = parent_path(&path).unwrap_or_else(|| "/".to_string());
                let up = accumulators.entry(parent).or_default();
                match stored.entry.kind {
                    EntryKind::File => {
                        up.record_file(stored.entry.stat.size, stored.entropy, &stored.category)
                    }
                    EntryKind::Symlink => up.symlinks += 1,
                    EntryKind::Device => up.devices += 1,
                    EntryKind::Directory => unreachable!(),
                }
            }
        }
    }

    // pass 2 (in order): build the path -> entry MAC tree
    let mut vfs_writer = BtreeWriter::new(txn, ResourceType::VfsBtree);
    for item in scan_set.iter() {
        let (key, value) = item?;
        let path = String::from_utf8(key)?;
        let stored: ScanSetEntry = serde_json::from_slice(&value)?;
        let mac = stored
            .mac
            .ok_or_else(|| format_err!("entry {} was never assigned a blob", path))?;
        vfs_writer.add(&path, &mac.to_string())?;
    }
    let vfs = vfs_writer.finish()?;

    // error tree
    let mut sorted_errors = outcome.errors.clone();
    sorted_errors.sort_by(|a, b| a.path.cmp(&b.path));
    sorted_errors.dedup_by(|a, b| a.path == b.path);
    let mut error_writer = BtreeWriter::new(txn, ResourceType::ErrorBtree);
    for error in &sorted_errors {
        error_writer.add(&error.path, &error.message)?;
    }
    let errors = error_writer.finish()?;

    let header = SnapshotHeader {
        version: SnapshotHeader::VERSION,
        timestamp,
        duration_secs: started.elapsed().as_secs_f64(),
        tags: options.tags.clone(),
        client: ClientInfo::collect(&options.client_version),
        importer: ImporterInfo {
            kind: importer.kind().to_string(),
            origin: importer.origin(),
            directory: importer.root(),
        },
        vfs,
        errors,
        summary: root_summary,
    };

    let (snapshot, _) = txn.put_blob(ResourceType::Snapshot, &header.serialize()?)?;
    Ok((snapshot, header))
}

fn basename(path: &str) -> String {
    match path.rsplit('/').next() {
        Some("") | None => "/".to_string(),
        Some(name) => name.to_string(),
    }
}

fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a").as_deref(), Some("/"));
        assert_eq!(parent_path("/a/b/c").as_deref(), Some("/a/b"));
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/"), "/");
    }
}
