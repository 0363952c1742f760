//! Read-side view of a committed snapshot.

use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Error};

use plakar_repository::Repository;
use plakar_types::{Mac, RepositoryError};

use crate::btree::BtreeReader;
use crate::entry::{Entry, EntryKind};
use crate::header::SnapshotHeader;
use crate::object::Object;

pub struct Snapshot {
    repo: Arc<Repository>,
    id: Mac,
    header: SnapshotHeader,
}

impl Snapshot {
    /// Load a snapshot by its identifier (the header blob's MAC).
    pub fn load(repo: &Arc<Repository>, id: Mac) -> Result<Self, Error> {
        let raw = repo.resolve(&id).map_err(|err| {
            match err.downcast_ref::<RepositoryError>() {
                Some(RepositoryError::BlobNotFound(_)) => {
                    RepositoryError::SnapshotNotFound(id.to_string()).into()
                }
                _ => err,
            }
        })?;
        let header = SnapshotHeader::deserialize(&raw)?;
        Ok(Self {
            repo: Arc::clone(repo),
            id,
            header,
        })
    }

    pub fn id(&self) -> Mac {
        self.id
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Look up one entry by absolute path inside the snapshot.
    pub fn get_entry(&self, path: &str) -> Result<Entry, Error> {
        let reader = BtreeReader::new(&self.repo);
        let value = reader
            .lookup(&self.header.vfs.root, path)?
            .ok_or_else(|| RepositoryError::EntryNotFound(path.to_string()))?;
        let mac: Mac = value.parse()?;
        Entry::deserialize(&self.repo.resolve(&mac)?)
    }

    /// All `(path, entry)` pairs in path order.
    pub fn entries(&self) -> impl Iterator<Item = Result<(String, Entry), Error>> + '_ {
        let reader = BtreeReader::new(&self.repo);
        reader.iter(&self.header.vfs.root).map(move |item| {
            let (path, value) = item?;
            let mac: Mac = value.parse()?;
            let entry = Entry::deserialize(&self.repo.resolve(&mac)?)?;
            Ok((path, entry))
        })
    }

    /// All `(path, message)` pairs recorded in the error tree.
    pub fn errors(&self) -> impl Iterator<Item = Result<(String, String), Error>> + '_ {
        BtreeReader::new(&self.repo).iter(&self.header.errors.root)
    }

    pub fn object_for(&self, path: &str) -> Result<Object, Error> {
        let entry = self.get_entry(path)?;
        let mac = match entry.object {
            Some(mac) => mac,
            None => bail!("{} is not a regular file", path),
        };
        Object::deserialize(&self.repo.resolve(&mac)?)
    }

    /// Stream the content of a regular file.
    pub fn read_file(&self, path: &str) -> Result<FileReader, Error> {
        let entry = self.get_entry(path)?;
        if entry.kind != EntryKind::File {
            bail!("{} is not a regular file", path);
        }
        let object = self.object_for(path)?;
        Ok(FileReader {
            repo: Arc::clone(&self.repo),
            object,
            next_chunk: 0,
            buffer: Vec::new(),
            buffer_pos: 0,
        })
    }
}

/// Sequential reader over an object's chunk list.
pub struct FileReader {
    repo: Arc<Repository>,
    object: Object,
    next_chunk: usize,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl Read for FileReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.buffer_pos < self.buffer.len() {
                let take = std::cmp::min(out.len(), self.buffer.len() - self.buffer_pos);
                out[..take].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + take]);
                self.buffer_pos += take;
                return Ok(take);
            }
            if self.next_chunk >= self.object.chunks.len() {
                return Ok(0);
            }
            let mac = self.object.chunks[self.next_chunk].mac;
            self.next_chunk += 1;
            self.buffer = self
                .repo
                .resolve(&mac)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
            self.buffer_pos = 0;
        }
    }
}
