//! Content-addressed repository.
//!
//! Composes a byte store, the packfile codec, the crypto envelope, the
//! chunker and the state logs into the object every higher layer talks to:
//! resolve a MAC to bytes, queue new blobs for packing, commit
//! transactions, rebuild the aggregate index.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, format_err, Context, Error};
use uuid::Uuid;

pub mod chunker;
pub mod crypt_config;
pub mod hasher;
pub mod lock;
pub mod packer;
pub mod packfile;
pub mod state;

pub use crypt_config::CryptConfig;
pub use hasher::MacHasher;
pub use state::{AggregateState, BlobLocation, State, StateRecord};

use plakar_cache::{CacheManager, RepositoryCache};
use plakar_store::{Store, StoreRegistry};
use plakar_types::config::Configuration;
use plakar_types::{CancelToken, Mac, RepositoryError, ResourceType, BLOB_FLAG_ENCRYPTED};

use lock::LockBody;
use packer::{AddRequest, PackerManager};

/// Seconds since the unix epoch.
pub fn epoch_i64() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Detached `type(4) | version(4)` header prepended to every object
/// written into the store namespaces.
pub fn wrap_envelope(resource: ResourceType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&resource.as_u32().to_le_bytes());
    out.extend_from_slice(&resource.version().to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn unwrap_envelope(resource: ResourceType, data: &[u8]) -> Result<(u32, Vec<u8>), Error> {
    if data.len() < 8 {
        bail!("object too short for a {} envelope", resource);
    }
    let tag = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let found = ResourceType::from_u32(tag)?;
    if found != resource {
        bail!("expected a {} envelope, found {}", resource, found);
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    Ok((version, data[8..].to_vec()))
}

/// Callback used to obtain a passphrase candidate; returning `None` gives
/// up (the CLI edge implements the three-attempts-on-a-tty policy).
pub type UnlockFn<'a> = dyn Fn(u32) -> Result<Option<String>, Error> + 'a;

pub struct Repository {
    store: Arc<dyn Store>,
    config: Configuration,
    hasher: MacHasher,
    crypt: Option<CryptConfig>,
    aggregate: RwLock<AggregateState>,
    state_macs: RwLock<Vec<Mac>>,
    cache: Arc<RepositoryCache>,
}

impl Repository {
    /// Create a new repository at `location`.
    pub fn create(
        registry: &StoreRegistry,
        location: &str,
        cache_manager: &CacheManager,
        passphrase: Option<&str>,
        compression: bool,
    ) -> Result<Self, Error> {
        let mut config = Configuration::new(epoch_i64());
        if !compression {
            config.compression = None;
        }

        let (hasher, crypt) = match passphrase {
            Some(passphrase) => {
                let (section, master_key) =
                    crypt_config::generate_encryption_config(passphrase.as_bytes())?;
                config.encryption = Some(section);
                (MacHasher::keyed(master_key), Some(CryptConfig::new(master_key)))
            }
            None => (MacHasher::plain(), None),
        };
        chunker::validate(&config.chunking)?;

        let wrapped = wrap_envelope(ResourceType::Config, &config.serialize()?);
        let store: Arc<dyn Store> = Arc::from(registry.create(location, &wrapped)?);
        let cache = cache_manager.repository(config.repository_id)?;

        log::info!(
            "created repository {} at {}",
            config.repository_id,
            location
        );
        Ok(Self {
            store,
            config,
            hasher,
            crypt,
            aggregate: RwLock::new(AggregateState::new()),
            state_macs: RwLock::new(Vec::new()),
            cache,
        })
    }

    /// Open an existing repository, unlocking it if encrypted and
    /// rebuilding (or reloading) the aggregate state.
    pub fn open(
        registry: &StoreRegistry,
        location: &str,
        cache_manager: &CacheManager,
        unlock: &UnlockFn,
    ) -> Result<Self, Error> {
        let (store, raw_config) = registry.open(location)?;
        let store: Arc<dyn Store> = Arc::from(store);

        let (_, payload) = unwrap_envelope(ResourceType::Config, &raw_config)?;
        let config = Configuration::deserialize(&payload)?;

        let (hasher, crypt) = match &config.encryption {
            Some(section) => {
                let mut attempt = 0u32;
                loop {
                    let passphrase = match unlock(attempt)? {
                        Some(passphrase) => passphrase,
                        None => return Err(RepositoryError::Unauthorized.into()),
                    };
                    let key = crypt_config::derive_key(&section.kdf_params, passphrase.as_bytes())?;
                    let candidate = CryptConfig::new(key);
                    if candidate.verify_canary(&section.canary) {
                        break (MacHasher::keyed(key), Some(candidate));
                    }
                    attempt += 1;
                }
            }
            None => (MacHasher::plain(), None),
        };

        let cache = cache_manager.repository(config.repository_id)?;
        let repository = Self {
            store,
            config,
            hasher,
            crypt,
            aggregate: RwLock::new(AggregateState::new()),
            state_macs: RwLock::new(Vec::new()),
            cache,
        };
        repository.rebuild_aggregate()?;
        Ok(repository)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn id(&self) -> Uuid {
        self.config.repository_id
    }

    pub fn store(&self) -> &(dyn Store + 'static) {
        &*self.store
    }

    pub fn hasher(&self) -> &MacHasher {
        &self.hasher
    }

    pub fn cache(&self) -> &Arc<RepositoryCache> {
        &self.cache
    }

    pub fn mac(&self, data: &[u8]) -> Mac {
        self.hasher.mac(data)
    }

    /// Rebuild the aggregate state by merging every state blob, reusing
    /// the cached aggregate when the state set is unchanged.
    pub fn rebuild_aggregate(&self) -> Result<(), Error> {
        let mut macs = self.store.list_states()?;
        macs.sort();
        let tag = state_set_tag(&macs);

        if let Some(raw) = self.cache.get_aggregate(&tag)? {
            if let Ok(aggregate) = AggregateState::deserialize(&raw) {
                log::debug!("aggregate state reloaded from cache ({} blobs)", aggregate.len());
                *self.aggregate.write().unwrap() = aggregate;
                *self.state_macs.write().unwrap() = macs;
                return Ok(());
            }
        }

        let mut aggregate = AggregateState::new();
        for mac in &macs {
            let state = self
                .read_state(mac)
                .with_context(|| format!("unable to read state {}", mac))?;
            aggregate.apply_state(&state);
        }
        log::info!(
            "aggregate state rebuilt from {} states ({} blobs)",
            macs.len(),
            aggregate.len()
        );

        self.cache.put_aggregate(&tag, &aggregate.serialize()?)?;
        *self.aggregate.write().unwrap() = aggregate;
        *self.state_macs.write().unwrap() = macs;
        Ok(())
    }

    pub fn read_state(&self, mac: &Mac) -> Result<State, Error> {
        let raw = self.store.get_state(mac)?;
        let (_, payload) = unwrap_envelope(ResourceType::State, &raw)?;
        let decoded = self.decode_payload(&payload, self.default_flags())?;
        State::deserialize(&decoded)
    }

    fn default_flags(&self) -> u32 {
        if self.crypt.is_some() {
            BLOB_FLAG_ENCRYPTED
        } else {
            0
        }
    }

    /// Compress and encrypt an inner payload per configuration.
    pub fn encode_payload(&self, payload: &[u8]) -> Result<(Vec<u8>, u32), Error> {
        let mut data = match &self.config.compression {
            Some(compression) => zstd::bulk::compress(payload, compression.level)?,
            None => payload.to_vec(),
        };
        let mut flags = 0;
        if let Some(crypt) = &self.crypt {
            data = crypt.encrypt_stream(&data)?;
            flags |= BLOB_FLAG_ENCRYPTED;
        }
        Ok((data, flags))
    }

    pub fn decode_payload(&self, data: &[u8], flags: u32) -> Result<Vec<u8>, Error> {
        let data = if flags & BLOB_FLAG_ENCRYPTED != 0 {
            match &self.crypt {
                Some(crypt) => crypt.decrypt_stream(data)?,
                None => return Err(RepositoryError::Unauthorized.into()),
            }
        } else {
            data.to_vec()
        };
        match &self.config.compression {
            Some(_) => Ok(zstd::stream::decode_all(&data[..])?),
            None => Ok(data),
        }
    }

    pub fn get_location(&self, mac: &Mac) -> Option<BlobLocation> {
        self.aggregate.read().unwrap().get(mac).copied()
    }

    pub fn has_blob(&self, mac: &Mac) -> bool {
        self.aggregate.read().unwrap().contains(mac)
    }

    /// Resolve a blob MAC to its plaintext bytes.
    pub fn resolve(&self, mac: &Mac) -> Result<Vec<u8>, Error> {
        let location = self
            .get_location(mac)
            .ok_or(RepositoryError::BlobNotFound(*mac))?;

        let raw = self
            .store
            .get_packfile_range(&location.packfile, location.offset, location.length)?;
        let payload = self.decode_payload(&raw, location.flags)?;

        if self.hasher.mac(&payload) != *mac {
            return Err(RepositoryError::Integrity(format!(
                "blob {} in packfile {} fails MAC verification",
                mac, location.packfile
            ))
            .into());
        }
        Ok(payload)
    }

    pub fn list_snapshots(&self) -> Vec<Mac> {
        self.aggregate
            .read()
            .unwrap()
            .list_resource(ResourceType::Snapshot)
    }

    pub fn list_resource(&self, resource: ResourceType) -> Vec<Mac> {
        self.aggregate.read().unwrap().list_resource(resource)
    }

    pub fn blobs_by_packfile(&self) -> std::collections::HashMap<Mac, Vec<Mac>> {
        self.aggregate.read().unwrap().blobs_by_packfile()
    }

    pub fn aggregate_len(&self) -> usize {
        self.aggregate.read().unwrap().len()
    }

    /// Find the unique snapshot whose hex MAC starts with `prefix`.
    pub fn resolve_snapshot_prefix(&self, prefix: &str) -> Result<Mac, Error> {
        let prefix = prefix.to_lowercase();
        let matches: Vec<Mac> = self
            .list_snapshots()
            .into_iter()
            .filter(|mac| mac.to_string().starts_with(&prefix))
            .collect();
        match matches.len() {
            0 => Err(RepositoryError::SnapshotNotFound(prefix).into()),
            1 => Ok(matches[0]),
            n => bail!("snapshot prefix '{}' is ambiguous ({} matches)", prefix, n),
        }
    }

    /// Write a state blob directly (tombstones, sync); returns its MAC.
    pub fn write_state(&self, records: Vec<StateRecord>) -> Result<Mac, Error> {
        let serial = self.aggregate.read().unwrap().max_serial() + 1;
        let state = State::new(serial, epoch_i64(), records);

        let (payload, _) = self.encode_payload(&state.serialize())?;
        let wrapped = wrap_envelope(ResourceType::State, &payload);
        let mac = self.hasher.mac(&wrapped);
        self.store.put_state(&mac, &mut &wrapped[..])?;

        let mut aggregate = self.aggregate.write().unwrap();
        aggregate.apply_state(&state);
        let mut macs = self.state_macs.write().unwrap();
        macs.push(mac);
        macs.sort();
        self.cache
            .put_aggregate(&state_set_tag(&macs), &aggregate.serialize()?)?;
        Ok(mac)
    }

    /// Remove a state blob after maintenance determined it is fully
    /// shadowed.
    pub fn delete_state(&self, mac: &Mac) -> Result<(), Error> {
        self.store.delete_state(mac)?;
        let mut macs = self.state_macs.write().unwrap();
        macs.retain(|known| known != mac);
        Ok(())
    }

    pub fn begin_transaction(
        self: &Arc<Self>,
        cancel: &CancelToken,
        concurrency: usize,
    ) -> Result<Transaction, Error> {
        if !self.store.mode().contains(plakar_store::Mode::WRITE) {
            return Err(RepositoryError::NotWritable.into());
        }

        let lock_mac = self.acquire_lock()?;
        let cancel = cancel.child();
        let packer = PackerManager::new(
            Arc::clone(&self.store),
            self.hasher.clone(),
            self.config.packfile.max_size,
            concurrency,
            cancel.clone(),
        );

        Ok(Transaction {
            repo: Arc::clone(self),
            id: Uuid::new_v4(),
            packer: Mutex::new(Some(packer)),
            pending: Mutex::new(HashSet::new()),
            lock_mac,
            cancel,
        })
    }

    fn acquire_lock(&self) -> Result<Mac, Error> {
        let owner = Uuid::new_v4();
        let body = LockBody::new(owner, epoch_i64());
        let mac = self.hasher.mac(owner.as_bytes());

        let (payload, _) = self.encode_payload(&body.serialize()?)?;
        let wrapped = wrap_envelope(ResourceType::Lock, &payload);
        self.store.put_lock(&mac, &mut &wrapped[..])?;

        let now = epoch_i64();
        for other in self.store.list_locks()? {
            if other == mac {
                continue;
            }
            match self.read_lock(&other) {
                Ok(existing) if existing.is_stale(now) => {
                    log::warn!("reaping stale lock {} ({})", other.short(), existing.hostname);
                    let _ = self.store.delete_lock(&other);
                }
                Ok(existing) => {
                    let _ = self.store.delete_lock(&mac);
                    return Err(RepositoryError::InUse(format!(
                        "repository locked by {}:{}",
                        existing.hostname, existing.pid
                    ))
                    .into());
                }
                Err(_) => {
                    // unreadable lock: treat as alien garbage, reap it
                    let _ = self.store.delete_lock(&other);
                }
            }
        }
        Ok(mac)
    }

    fn read_lock(&self, mac: &Mac) -> Result<LockBody, Error> {
        let raw = self.store.get_lock(mac)?;
        let (_, payload) = unwrap_envelope(ResourceType::Lock, &raw)?;
        LockBody::deserialize(&self.decode_payload(&payload, self.default_flags())?)
    }

    fn release_lock(&self, mac: &Mac) {
        if let Err(err) = self.store.delete_lock(mac) {
            log::warn!("unable to release lock {} - {}", mac.short(), err);
        }
    }

    pub fn close(&self) -> Result<(), Error> {
        self.cache.flush()?;
        self.store.close()
    }
}

fn state_set_tag(macs: &[Mac]) -> Vec<u8> {
    let mut sha = openssl::sha::Sha256::new();
    for mac in macs {
        sha.update(mac.as_bytes());
    }
    sha.finish().to_vec()
}

/// The scope of one writer, from the first `put_blob` to `commit`.
pub struct Transaction {
    repo: Arc<Repository>,
    id: Uuid,
    packer: Mutex<Option<PackerManager>>,
    pending: Mutex<HashSet<Mac>>,
    lock_mac: Mac,
    cancel: CancelToken,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Queue a blob for packing; returns its MAC and whether it was new.
    /// Already-known blobs are deduplicated and their payload dropped.
    pub fn put_blob(&self, resource: ResourceType, payload: &[u8]) -> Result<(Mac, bool), Error> {
        self.cancel.check()?;
        let mac = self.repo.hasher.mac(payload);

        if self.repo.has_blob(&mac) {
            return Ok((mac, false));
        }
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.insert(mac) {
                return Ok((mac, false));
            }
        }

        let (data, flags) = self.repo.encode_payload(payload)?;
        let packer = self.packer.lock().unwrap();
        packer
            .as_ref()
            .ok_or_else(|| format_err!("transaction already finished"))?
            .add(AddRequest {
                resource,
                version: resource.version(),
                mac,
                data,
                flags,
            })?;
        Ok((mac, true))
    }

    /// Whether this transaction already carries (or the repository already
    /// knows) a blob.
    pub fn has_blob(&self, mac: &Mac) -> bool {
        self.repo.has_blob(mac) || self.pending.lock().unwrap().contains(mac)
    }

    /// Drain the packers, write the state delta and release the lock.
    /// Returns the new state MAC, or `None` when nothing was written.
    pub fn commit(self) -> Result<Option<Mac>, Error> {
        let packer = self
            .packer
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| format_err!("transaction already finished"))?;
        let result = packer.wait().and_then(|records| {
            if records.is_empty() {
                Ok(None)
            } else {
                self.repo.write_state(records).map(Some)
            }
        });

        self.repo.release_lock(&self.lock_mac);
        let _ = self.repo.cache.delete_scan_set(self.id);
        result
    }

    /// Abort: discard partial packfiles, release the lock. Nothing of the
    /// transaction becomes visible.
    pub fn rollback(self) {
        if let Some(packer) = self.packer.lock().unwrap().take() {
            packer.abort();
        }
        self.repo.release_lock(&self.lock_mac);
        let _ = self.repo.cache.delete_scan_set(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unlock_with(passphrase: &str) -> impl Fn(u32) -> Result<Option<String>, Error> + '_ {
        move |attempt| {
            if attempt == 0 {
                Ok(Some(passphrase.to_string()))
            } else {
                Ok(None)
            }
        }
    }

    fn scratch() -> (tempfile::TempDir, StoreRegistry, CacheManager, String) {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::default();
        let cache = CacheManager::new(dir.path().join("cache"));
        let location = dir.path().join("repo").to_string_lossy().to_string();
        (dir, registry, cache, location)
    }

    #[test]
    fn put_resolve_round_trip() -> Result<(), Error> {
        let (_dir, registry, cache, location) = scratch();
        let repo = Arc::new(Repository::create(&registry, &location, &cache, None, true)?);

        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;
        let (mac, new) = txn.put_blob(ResourceType::Chunk, b"hello dummy")?;
        assert!(new);
        // same payload dedups inside the transaction
        let (again, new) = txn.put_blob(ResourceType::Chunk, b"hello dummy")?;
        assert_eq!(mac, again);
        assert!(!new);
        let state = txn.commit()?;
        assert!(state.is_some());

        assert_eq!(repo.resolve(&mac)?, b"hello dummy");
        Ok(())
    }

    #[test]
    fn dedup_across_transactions() -> Result<(), Error> {
        let (_dir, registry, cache, location) = scratch();
        let repo = Arc::new(Repository::create(&registry, &location, &cache, None, true)?);

        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;
        let (mac, _) = txn.put_blob(ResourceType::Chunk, b"shared payload")?;
        txn.commit()?;
        let packfiles_before = repo.store().list_packfiles()?.len();

        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;
        let (again, new) = txn.put_blob(ResourceType::Chunk, b"shared payload")?;
        assert_eq!(mac, again);
        assert!(!new);
        assert!(txn.commit()?.is_none());
        assert_eq!(repo.store().list_packfiles()?.len(), packfiles_before);
        Ok(())
    }

    #[test]
    fn encrypted_repository_unlocks_with_the_right_passphrase() -> Result<(), Error> {
        let (_dir, registry, cache, location) = scratch();
        let mac = {
            let repo = Arc::new(Repository::create(
                &registry,
                &location,
                &cache,
                Some("hunter2"),
                true,
            )?);
            let txn = repo.begin_transaction(&CancelToken::new(), 1)?;
            let (mac, _) = txn.put_blob(ResourceType::Chunk, b"classified")?;
            txn.commit()?;
            repo.close()?;
            mac
        };

        let err = Repository::open(&registry, &location, &cache, &unlock_with("wrong"))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<RepositoryError>(),
            Some(RepositoryError::Unauthorized)
        ));

        let repo = Repository::open(&registry, &location, &cache, &unlock_with("hunter2"))?;
        assert_eq!(repo.resolve(&mac)?, b"classified");
        Ok(())
    }

    #[test]
    fn rollback_leaves_no_trace() -> Result<(), Error> {
        let (_dir, registry, cache, location) = scratch();
        let repo = Arc::new(Repository::create(&registry, &location, &cache, None, true)?);

        let txn = repo.begin_transaction(&CancelToken::new(), 2)?;
        txn.put_blob(ResourceType::Chunk, b"doomed")?;
        txn.rollback();

        assert!(repo.store().list_packfiles()?.is_empty());
        assert!(repo.store().list_states()?.is_empty());
        assert!(repo.store().list_locks()?.is_empty());
        Ok(())
    }

    #[test]
    fn cancellation_fails_commit() -> Result<(), Error> {
        let (_dir, registry, cache, location) = scratch();
        let repo = Arc::new(Repository::create(&registry, &location, &cache, None, true)?);

        let cancel = CancelToken::new();
        let txn = repo.begin_transaction(&cancel, 2)?;
        txn.put_blob(ResourceType::Chunk, b"late")?;
        cancel.cancel();
        assert!(txn.put_blob(ResourceType::Chunk, b"later").is_err());
        Ok(())
    }
}
