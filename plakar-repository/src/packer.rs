//! Packer worker pool.
//!
//! Blobs are sharded over a fixed set of workers; each worker owns one
//! in-flight packfile buffer and never blocks its peers. When a buffer
//! reaches the configured size the packfile is sealed and uploaded, and its
//! index entries are handed to a single flusher that serialises appends to
//! the pending state delta. Upload failures retry with exponential backoff
//! and then poison the transaction.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};
use crossbeam_channel::{bounded, Receiver, Sender};

use plakar_store::Store;
use plakar_types::{CancelToken, Mac, RepositoryError, ResourceType};

use crate::hasher::MacHasher;
use crate::packfile::{BlobRecord, PackfileWriter};
use crate::state::{BlobLocation, StateRecord};

const QUEUE_DEPTH: usize = 64;
const UPLOAD_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

pub struct AddRequest {
    pub resource: ResourceType,
    pub version: u32,
    pub mac: Mac,
    pub data: Vec<u8>,
    pub flags: u32,
}

struct SealedPackfile {
    packfile: Mac,
    records: Vec<BlobRecord>,
}

pub struct PackerManager {
    store: Arc<dyn Store>,
    senders: Vec<Sender<AddRequest>>,
    workers: Vec<JoinHandle<()>>,
    flusher: Option<JoinHandle<(Vec<StateRecord>, Vec<Mac>)>>,
    failure: Arc<Mutex<Option<String>>>,
    cancel: CancelToken,
}

impl PackerManager {
    pub fn new(
        store: Arc<dyn Store>,
        hasher: MacHasher,
        max_size: u32,
        concurrency: usize,
        cancel: CancelToken,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let (sealed_tx, sealed_rx) = bounded::<SealedPackfile>(concurrency * 2);

        let mut senders = Vec::with_capacity(concurrency);
        let mut workers = Vec::with_capacity(concurrency);
        for n in 0..concurrency {
            let (tx, rx) = bounded::<AddRequest>(QUEUE_DEPTH);
            senders.push(tx);

            let store = Arc::clone(&store);
            let hasher = hasher.clone();
            let failure = Arc::clone(&failure);
            let cancel = cancel.clone();
            let sealed_tx = sealed_tx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("packer/{}", n))
                    .spawn(move || {
                        worker_loop(rx, store, hasher, max_size, cancel, failure, sealed_tx)
                    })
                    .expect("spawning packer worker"),
            );
        }
        drop(sealed_tx);

        let flusher = std::thread::Builder::new()
            .name("packer/flush".to_string())
            .spawn(move || flusher_loop(sealed_rx))
            .expect("spawning packer flusher");

        Self {
            store,
            senders,
            workers,
            flusher: Some(flusher),
            failure,
            cancel,
        }
    }

    /// Queue a blob; sharded by consistent hashing over the MAC.
    pub fn add(&self, request: AddRequest) -> Result<(), Error> {
        self.cancel.check()?;
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(format_err!("packer failed: {}", message));
        }

        let shard = u64::from_le_bytes(request.mac.as_bytes()[0..8].try_into().unwrap())
            as usize
            % self.senders.len();
        self.senders[shard]
            .send(request)
            .map_err(|_| format_err!("packer worker is gone"))?;
        Ok(())
    }

    /// Seal all partial packfiles and return the accumulated state delta.
    pub fn wait(mut self) -> Result<Vec<StateRecord>, Error> {
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let (delta, packfiles) = match self.flusher.take() {
            Some(flusher) => flusher.join().map_err(|_| format_err!("packer flusher panicked"))?,
            None => (Vec::new(), Vec::new()),
        };

        if self.cancel.is_cancelled() {
            self.remove_uploaded(&packfiles);
            return Err(RepositoryError::Cancelled.into());
        }
        if let Some(message) = self.failure.lock().unwrap().clone() {
            self.remove_uploaded(&packfiles);
            return Err(format_err!("packer failed: {}", message));
        }
        Ok(delta)
    }

    /// Discard partial packfiles and remove anything already uploaded;
    /// nothing of the transaction stays behind in the store.
    pub fn abort(mut self) {
        self.cancel.cancel();
        self.senders.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(flusher) = self.flusher.take() {
            if let Ok((_, packfiles)) = flusher.join() {
                self.remove_uploaded(&packfiles);
            }
        }
    }

    fn remove_uploaded(&self, packfiles: &[Mac]) {
        for mac in packfiles {
            if let Err(err) = self.store.delete_packfile(mac) {
                log::warn!("unable to remove aborted packfile {} - {}", mac.short(), err);
            }
        }
    }
}

fn worker_loop(
    rx: Receiver<AddRequest>,
    store: Arc<dyn Store>,
    hasher: MacHasher,
    max_size: u32,
    cancel: CancelToken,
    failure: Arc<Mutex<Option<String>>>,
    sealed_tx: Sender<SealedPackfile>,
) {
    let mut writer = PackfileWriter::new();

    let fail = |failure: &Arc<Mutex<Option<String>>>, cancel: &CancelToken, err: Error| {
        let mut slot = failure.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err.to_string());
        }
        cancel.cancel();
    };

    while let Ok(request) = rx.recv() {
        if cancel.is_cancelled() {
            // drain without packing; the transaction is dead
            continue;
        }

        writer.add_blob(
            request.resource,
            request.version,
            request.mac,
            &request.data,
            request.flags,
        );

        if writer.size() >= max_size as u64 {
            let full = std::mem::take(&mut writer);
            match seal_and_upload(&store, &hasher, full) {
                Ok(sealed) => {
                    if sealed_tx.send(sealed).is_err() {
                        return;
                    }
                }
                Err(err) => fail(&failure, &cancel, err),
            }
        }
    }

    // channel closed: seal the partial packfile unless aborted
    if !cancel.is_cancelled() && !writer.is_empty() {
        match seal_and_upload(&store, &hasher, writer) {
            Ok(sealed) => {
                let _ = sealed_tx.send(sealed);
            }
            Err(err) => fail(&failure, &cancel, err),
        }
    }
}

fn seal_and_upload(
    store: &Arc<dyn Store>,
    hasher: &MacHasher,
    writer: PackfileWriter,
) -> Result<SealedPackfile, Error> {
    let count = writer.blob_count();
    let (data, records) = writer.seal(hasher, crate::epoch_i64());
    let packfile = hasher.mac(&data);

    let mut attempt = 0;
    loop {
        match store.put_packfile(&packfile, &mut &data[..]) {
            Ok(written) => {
                log::debug!(
                    "sealed packfile {} ({} blobs, {} bytes)",
                    packfile.short(),
                    count,
                    written
                );
                return Ok(SealedPackfile { packfile, records });
            }
            Err(err) => {
                attempt += 1;
                if attempt >= UPLOAD_ATTEMPTS {
                    return Err(format_err!(
                        "upload of packfile {} failed after {} attempts - {}",
                        packfile,
                        attempt,
                        err
                    ));
                }
                let backoff = BACKOFF_BASE_MS * (1 << attempt);
                log::warn!(
                    "upload of packfile {} failed (attempt {}), retrying in {}ms - {}",
                    packfile.short(),
                    attempt,
                    backoff,
                    err
                );
                std::thread::sleep(Duration::from_millis(backoff));
            }
        }
    }
}

fn flusher_loop(rx: Receiver<SealedPackfile>) -> (Vec<StateRecord>, Vec<Mac>) {
    let mut delta = Vec::new();
    let mut packfiles = Vec::new();
    while let Ok(sealed) = rx.recv() {
        packfiles.push(sealed.packfile);
        for record in sealed.records {
            delta.push(StateRecord::Location {
                blob: record.mac,
                location: BlobLocation {
                    resource: record.resource,
                    version: record.version,
                    packfile: sealed.packfile,
                    offset: record.offset,
                    length: record.length,
                    flags: record.flags,
                },
            });
        }
    }
    (delta, packfiles)
}

#[cfg(test)]
mod test {
    use super::*;
    use plakar_store::FilesystemStore;

    fn test_store() -> (tempfile::TempDir, Arc<dyn Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::create(dir.path().join("repo"), b"cfg").unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn packs_and_reports_delta() -> Result<(), Error> {
        let (_dir, store) = test_store();
        let hasher = MacHasher::plain();
        let packer = PackerManager::new(
            Arc::clone(&store),
            hasher.clone(),
            1024,
            2,
            CancelToken::new(),
        );

        let mut macs = Vec::new();
        for n in 0u8..20 {
            let data = vec![n; 300];
            let mac = hasher.mac(&data);
            macs.push(mac);
            packer.add(AddRequest {
                resource: ResourceType::Chunk,
                version: 1,
                mac,
                data,
                flags: 0,
            })?;
        }

        let delta = packer.wait()?;
        assert_eq!(delta.len(), 20);

        // every reported location must resolve inside its packfile
        for record in &delta {
            let StateRecord::Location { blob, location } = record else {
                panic!("unexpected tombstone");
            };
            let raw = store.get_packfile(&location.packfile)?;
            let parsed = crate::packfile::Packfile::parse(&hasher, &raw)?;
            assert_eq!(parsed.get_blob(blob).unwrap().len(), location.length as usize);
        }
        // multiple packfiles were produced given the 1 KiB budget
        assert!(store.list_packfiles()?.len() > 1);
        Ok(())
    }

    #[test]
    fn abort_discards_partials() -> Result<(), Error> {
        let (_dir, store) = test_store();
        let packer = PackerManager::new(
            Arc::clone(&store),
            MacHasher::plain(),
            u32::MAX,
            2,
            CancelToken::new(),
        );
        packer.add(AddRequest {
            resource: ResourceType::Chunk,
            version: 1,
            mac: Mac::new([1; 32]),
            data: vec![0; 100],
            flags: 0,
        })?;
        packer.abort();
        assert!(store.list_packfiles()?.is_empty());
        Ok(())
    }
}
