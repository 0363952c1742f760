//! Single-file `.ptar` archive backend.
//!
//! Concatenates every object into one file with a trailing index:
//!
//! ```text
//! [ MAGIC(8) | config_len(4) | config ]
//! [ object bytes ... ]
//! [ index: count x { ns(1) mac(32) offset(8) length(8) } ]
//! [ trailer: index_offset(8) count(4) index_crc(4) MAGIC(8) ]
//! ```
//!
//! An archive is built append-only and sealed on close; once sealed it is
//! strictly read-only. Packfiles inside an archive are effectively
//! unbounded in size, so writers feed it a single large packfile.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

use plakar_types::{Mac, RepositoryError};

use crate::{Location, Mode, Namespace, Store};

const PTAR_MAGIC: [u8; 8] = *b"PLKRPTAR";
const TRAILER_SIZE: u64 = 8 + 4 + 4 + 8;
const INDEX_ENTRY_SIZE: usize = 1 + 32 + 8 + 8;

fn ns_tag(ns: Namespace) -> u8 {
    match ns {
        Namespace::Packfiles => 0,
        Namespace::States => 1,
        Namespace::Locks => 2,
    }
}

fn ns_from_tag(tag: u8) -> Result<Namespace, Error> {
    Ok(match tag {
        0 => Namespace::Packfiles,
        1 => Namespace::States,
        2 => Namespace::Locks,
        other => bail!("corrupt ptar index: unknown namespace tag {}", other),
    })
}

#[derive(Debug)]
struct Inner {
    file: File,
    index: BTreeMap<(u8, Mac), (u64, u64)>,
    write_offset: u64,
    sealed: bool,
}

#[derive(Debug)]
pub struct PtarStore {
    location: String,
    config: Vec<u8>,
    inner: Mutex<Inner>,
}

impl PtarStore {
    pub fn create<P: Into<PathBuf>>(path: P, config: &[u8]) -> Result<Self, Error> {
        let path: PathBuf = path.into();
        if path.exists() {
            bail!("refusing to create archive at {:?}: file exists", path);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.write_all(&PTAR_MAGIC)?;
        file.write_all(&(config.len() as u32).to_le_bytes())?;
        file.write_all(config)?;
        let write_offset = 8 + 4 + config.len() as u64;

        Ok(Self {
            location: path.to_string_lossy().to_string(),
            config: config.to_vec(),
            inner: Mutex::new(Inner {
                file,
                index: BTreeMap::new(),
                write_offset,
                sealed: false,
            }),
        })
    }

    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path: PathBuf = path.into();
        let mut file = File::open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < 8 + 4 + TRAILER_SIZE {
            bail!("{:?} is too short to be a plakar archive", path);
        }

        let mut head = [0u8; 12];
        file.read_exact(&mut head)?;
        if head[0..8] != PTAR_MAGIC {
            bail!("{:?} is not a plakar archive (bad magic)", path);
        }
        let config_len = u32::from_le_bytes(head[8..12].try_into().unwrap()) as usize;
        let mut config = vec![0u8; config_len];
        file.read_exact(&mut config)?;

        file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
        let mut trailer = [0u8; TRAILER_SIZE as usize];
        file.read_exact(&mut trailer)?;
        if trailer[16..24] != PTAR_MAGIC {
            bail!("{:?} has no archive trailer (unsealed?)", path);
        }
        let index_offset = u64::from_le_bytes(trailer[0..8].try_into().unwrap());
        let count = u32::from_le_bytes(trailer[8..12].try_into().unwrap()) as usize;
        let index_crc = u32::from_le_bytes(trailer[12..16].try_into().unwrap());

        let index_len = count
            .checked_mul(INDEX_ENTRY_SIZE)
            .ok_or_else(|| format_err!("corrupt ptar trailer"))?;
        if index_offset + index_len as u64 + TRAILER_SIZE != file_len {
            return Err(RepositoryError::Integrity(format!(
                "ptar index does not line up with trailer in {:?}",
                path
            ))
            .into());
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let mut raw_index = vec![0u8; index_len];
        file.read_exact(&mut raw_index)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw_index);
        if hasher.finalize() != index_crc {
            return Err(RepositoryError::Integrity(format!(
                "ptar index checksum mismatch in {:?}",
                path
            ))
            .into());
        }

        let mut index = BTreeMap::new();
        for entry in raw_index.chunks_exact(INDEX_ENTRY_SIZE) {
            let ns = entry[0];
            ns_from_tag(ns)?;
            let mac = Mac::from_slice(&entry[1..33])?;
            let offset = u64::from_le_bytes(entry[33..41].try_into().unwrap());
            let length = u64::from_le_bytes(entry[41..49].try_into().unwrap());
            index.insert((ns, mac), (offset, length));
        }

        Ok(Self {
            location: path.to_string_lossy().to_string(),
            config,
            inner: Mutex::new(Inner {
                file,
                index,
                write_offset: index_offset,
                sealed: true,
            }),
        })
    }

    pub fn open_boxed(location: &Location) -> Result<Box<dyn Store>, Error> {
        Ok(Box::new(Self::open(&location.path)?))
    }

    pub fn create_boxed(location: &Location, config: &[u8]) -> Result<Box<dyn Store>, Error> {
        Ok(Box::new(Self::create(&location.path, config)?))
    }

    fn seal(inner: &mut Inner) -> Result<(), Error> {
        let mut raw_index = Vec::with_capacity(inner.index.len() * INDEX_ENTRY_SIZE);
        for ((ns, mac), (offset, length)) in inner.index.iter() {
            raw_index.push(*ns);
            raw_index.extend_from_slice(mac.as_bytes());
            raw_index.extend_from_slice(&offset.to_le_bytes());
            raw_index.extend_from_slice(&length.to_le_bytes());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw_index);
        let index_crc = hasher.finalize();

        inner.file.seek(SeekFrom::Start(inner.write_offset))?;
        inner.file.write_all(&raw_index)?;
        inner.file.write_all(&inner.write_offset.to_le_bytes())?;
        inner
            .file
            .write_all(&(inner.index.len() as u32).to_le_bytes())?;
        inner.file.write_all(&index_crc.to_le_bytes())?;
        inner.file.write_all(&PTAR_MAGIC)?;
        inner.file.sync_data()?;
        inner.sealed = true;
        Ok(())
    }

    fn lookup(inner: &Inner, ns: Namespace, mac: &Mac) -> Result<(u64, u64), Error> {
        inner
            .index
            .get(&(ns_tag(ns), *mac))
            .copied()
            .ok_or_else(|| match ns {
                Namespace::Packfiles => RepositoryError::PackfileNotFound(*mac).into(),
                Namespace::States => RepositoryError::StateNotFound(*mac).into(),
                Namespace::Locks => RepositoryError::BlobNotFound(*mac).into(),
            })
    }
}

impl Store for PtarStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn mode(&self) -> Mode {
        if self.inner.lock().unwrap().sealed {
            Mode::READ
        } else {
            Mode::READ | Mode::WRITE
        }
    }

    fn get_config(&self) -> Result<Vec<u8>, Error> {
        Ok(self.config.clone())
    }

    fn list(&self, ns: Namespace) -> Result<Vec<Mac>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index
            .keys()
            .filter(|(tag, _)| *tag == ns_tag(ns))
            .map(|(_, mac)| *mac)
            .collect())
    }

    fn get(&self, ns: Namespace, mac: &Mac) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let (offset, length) = Self::lookup(&inner, ns, mac)?;
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; length as usize];
        inner.file.read_exact(&mut data)?;
        Ok(data)
    }

    fn get_range(&self, ns: Namespace, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
        let mut inner = self.inner.lock().unwrap();
        let (base, total) = Self::lookup(&inner, ns, mac)?;
        if offset + length as u64 > total {
            bail!("range {}+{} outside of object {}", offset, length, mac);
        }
        inner.file.seek(SeekFrom::Start(base + offset))?;
        let mut data = vec![0u8; length as usize];
        inner.file.read_exact(&mut data)?;
        Ok(data)
    }

    fn put(&self, ns: Namespace, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.sealed {
            return Err(RepositoryError::NotWritable.into());
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let offset = inner.write_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&data)?;
        inner.write_offset += data.len() as u64;
        inner
            .index
            .insert((ns_tag(ns), *mac), (offset, data.len() as u64));
        Ok(data.len() as u64)
    }

    fn delete(&self, _ns: Namespace, _mac: &Mac) -> Result<(), Error> {
        Err(RepositoryError::NotWritable.into())
    }

    fn size(&self) -> Result<u64, Error> {
        Ok(self.inner.lock().unwrap().write_offset)
    }

    fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sealed {
            Self::seal(&mut inner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_seal_reopen() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backup.ptar");

        let store = PtarStore::create(&path, b"cfg")?;
        let mac_a = Mac::new([1u8; 32]);
        let mac_b = Mac::new([2u8; 32]);
        store.put(Namespace::Packfiles, &mac_a, &mut &b"aaaa"[..])?;
        store.put(Namespace::States, &mac_b, &mut &b"bbbbbb"[..])?;
        store.close()?;

        let archive = PtarStore::open(&path)?;
        assert_eq!(archive.mode(), Mode::READ);
        assert_eq!(archive.get_config()?, b"cfg");
        assert_eq!(archive.get(Namespace::Packfiles, &mac_a)?, b"aaaa");
        assert_eq!(archive.get_range(Namespace::States, &mac_b, 2, 3)?, b"bbb");
        assert!(archive
            .put(Namespace::Packfiles, &mac_a, &mut &b"x"[..])
            .is_err());
        Ok(())
    }

    #[test]
    fn corrupt_index_is_detected() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backup.ptar");

        let store = PtarStore::create(&path, b"cfg")?;
        store.put(Namespace::Packfiles, &Mac::new([3u8; 32]), &mut &b"data"[..])?;
        store.close()?;

        // flip a byte inside the trailing index
        let mut raw = std::fs::read(&path)?;
        let position = raw.len() - TRAILER_SIZE as usize - 10;
        raw[position] ^= 0xff;
        std::fs::write(&path, &raw)?;

        let err = PtarStore::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepositoryError>(),
            Some(RepositoryError::Integrity(_))
        ));
        Ok(())
    }
}
