//! Byte-level storage backends.
//!
//! A [`Store`] exposes three flat namespaces (`packfiles`, `states`,
//! `locks`) plus a single `CONFIG` object. All operations are blocking;
//! implementations must be internally thread-safe for concurrent reads and
//! for writes to distinct MACs. Writes are atomic: an object is either
//! fully present under its name or absent.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use url::Url;

use plakar_types::{Mac, RepositoryError};

mod filesystem;
mod ptar;
mod sqlite;

pub use filesystem::FilesystemStore;
pub use ptar::PtarStore;
pub use sqlite::SqliteStore;

bitflags::bitflags! {
    /// Capability of an open store.
    pub struct Mode: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Namespaces a store manages besides the configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Packfiles,
    States,
    Locks,
}

impl Namespace {
    pub fn name(self) -> &'static str {
        match self {
            Namespace::Packfiles => "packfiles",
            Namespace::States => "states",
            Namespace::Locks => "locks",
        }
    }

    /// Packfile and state namespaces are bucketed by the first MAC byte on
    /// filesystem-like backends to avoid huge directories.
    pub fn bucketed(self) -> bool {
        !matches!(self, Namespace::Locks)
    }
}

pub trait Store: Send + Sync {
    fn location(&self) -> &str;

    fn mode(&self) -> Mode;

    fn get_config(&self) -> Result<Vec<u8>, Error>;

    fn list(&self, ns: Namespace) -> Result<Vec<Mac>, Error>;

    fn get(&self, ns: Namespace, mac: &Mac) -> Result<Vec<u8>, Error>;

    /// Fetch `length` bytes starting at `offset`. Backends without a
    /// native range read emulate it with a full fetch plus slice.
    fn get_range(&self, ns: Namespace, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>, Error>;

    /// Atomic write; returns the number of bytes written.
    fn put(&self, ns: Namespace, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error>;

    fn delete(&self, ns: Namespace, mac: &Mac) -> Result<(), Error>;

    /// Total size of all stored objects in bytes.
    fn size(&self) -> Result<u64, Error>;

    fn close(&self) -> Result<(), Error>;
}

/// Convenience wrappers mirroring the per-namespace operations.
impl dyn Store {
    pub fn list_packfiles(&self) -> Result<Vec<Mac>, Error> {
        self.list(Namespace::Packfiles)
    }

    pub fn get_packfile(&self, mac: &Mac) -> Result<Vec<u8>, Error> {
        self.get(Namespace::Packfiles, mac)
    }

    pub fn get_packfile_range(&self, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
        self.get_range(Namespace::Packfiles, mac, offset, length)
    }

    pub fn put_packfile(&self, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error> {
        self.check_writable()?;
        self.put(Namespace::Packfiles, mac, reader)
    }

    pub fn delete_packfile(&self, mac: &Mac) -> Result<(), Error> {
        self.check_writable()?;
        self.delete(Namespace::Packfiles, mac)
    }

    pub fn list_states(&self) -> Result<Vec<Mac>, Error> {
        self.list(Namespace::States)
    }

    pub fn get_state(&self, mac: &Mac) -> Result<Vec<u8>, Error> {
        self.get(Namespace::States, mac)
    }

    pub fn put_state(&self, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error> {
        self.check_writable()?;
        self.put(Namespace::States, mac, reader)
    }

    pub fn delete_state(&self, mac: &Mac) -> Result<(), Error> {
        self.check_writable()?;
        self.delete(Namespace::States, mac)
    }

    pub fn list_locks(&self) -> Result<Vec<Mac>, Error> {
        self.list(Namespace::Locks)
    }

    pub fn get_lock(&self, mac: &Mac) -> Result<Vec<u8>, Error> {
        self.get(Namespace::Locks, mac)
    }

    pub fn put_lock(&self, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error> {
        self.check_writable()?;
        self.put(Namespace::Locks, mac, reader)
    }

    pub fn delete_lock(&self, mac: &Mac) -> Result<(), Error> {
        self.check_writable()?;
        self.delete(Namespace::Locks, mac)
    }

    fn check_writable(&self) -> Result<(), Error> {
        if !self.mode().contains(Mode::WRITE) {
            return Err(RepositoryError::NotWritable.into());
        }
        Ok(())
    }
}

/// Parsed store location.
///
/// Bare paths are treated as `fs://`; everything else must carry a scheme
/// known to the registry.
#[derive(Clone, Debug)]
pub struct Location {
    pub scheme: String,
    pub path: String,
}

impl Location {
    pub fn parse(location: &str) -> Result<Self, Error> {
        if let Ok(url) = Url::parse(location) {
            if url.scheme().len() > 1 {
                let path = match url.scheme() {
                    "fs" | "sqlite" | "ptar" => url.path().to_string(),
                    _ => url.as_str().to_string(),
                };
                return Ok(Self {
                    scheme: url.scheme().to_string(),
                    path,
                });
            }
        }
        Ok(Self {
            scheme: "fs".to_string(),
            path: location.to_string(),
        })
    }
}

type OpenFn = fn(&Location) -> Result<Box<dyn Store>, Error>;
type CreateFn = fn(&Location, &[u8]) -> Result<Box<dyn Store>, Error>;

struct Backend {
    open: OpenFn,
    create: CreateFn,
}

/// Explicit backend registry, passed through the application context.
///
/// Out-of-tree backends (s3, sftp, http) plug in through [`register`]
/// at program start.
///
/// [`register`]: StoreRegistry::register
#[derive(Clone)]
pub struct StoreRegistry {
    backends: Arc<HashMap<String, Backend>>,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        let mut registry = StoreRegistryBuilder::new();
        registry.register("fs", FilesystemStore::open_boxed, FilesystemStore::create_boxed);
        registry.register("sqlite", SqliteStore::open_boxed, SqliteStore::create_boxed);
        registry.register("ptar", PtarStore::open_boxed, PtarStore::create_boxed);
        registry.build()
    }
}

pub struct StoreRegistryBuilder {
    backends: HashMap<String, Backend>,
}

impl StoreRegistryBuilder {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, scheme: &str, open: OpenFn, create: CreateFn) {
        self.backends
            .insert(scheme.to_string(), Backend { open, create });
    }

    pub fn build(self) -> StoreRegistry {
        StoreRegistry {
            backends: Arc::new(self.backends),
        }
    }
}

impl StoreRegistry {
    fn backend(&self, scheme: &str) -> Result<&Backend, Error> {
        self.backends
            .get(scheme)
            .ok_or_else(|| format_err!("no store backend registered for scheme '{}'", scheme))
    }

    /// Open an existing store and read back its configuration blob.
    pub fn open(&self, location: &str) -> Result<(Box<dyn Store>, Vec<u8>), Error> {
        let location = Location::parse(location)?;
        let store = (self.backend(&location.scheme)?.open)(&location)?;
        let config = store.get_config()?;
        Ok((store, config))
    }

    /// Create a new store at `location` holding `config`.
    pub fn create(&self, location: &str, config: &[u8]) -> Result<Box<dyn Store>, Error> {
        if config.is_empty() {
            bail!("refusing to create store with empty configuration");
        }
        let location = Location::parse(location)?;
        (self.backend(&location.scheme)?.create)(&location, config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn location_parsing() {
        let plain = Location::parse("/tmp/repo").unwrap();
        assert_eq!(plain.scheme, "fs");
        assert_eq!(plain.path, "/tmp/repo");

        let fs = Location::parse("fs:///var/backups").unwrap();
        assert_eq!(fs.scheme, "fs");
        assert_eq!(fs.path, "/var/backups");

        let sqlite = Location::parse("sqlite:///tmp/repo.db").unwrap();
        assert_eq!(sqlite.scheme, "sqlite");
        assert_eq!(sqlite.path, "/tmp/repo.db");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let registry = StoreRegistry::default();
        assert!(registry.open("gopher://example").is_err());
    }
}
