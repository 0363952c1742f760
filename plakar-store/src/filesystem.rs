//! Canonical filesystem backend.
//!
//! Layout:
//! ```text
//! <root>/CONFIG
//! <root>/packfiles/<bb>/<MAC>
//! <root>/states/<bb>/<MAC>
//! <root>/locks/<MAC>
//! ```
//! `bb` is the first byte of the MAC in lowercase hex. Writes land in a
//! temporary file first and are renamed into place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};

use plakar_types::{Mac, RepositoryError};

use crate::{Location, Mode, Namespace, Store};

pub struct FilesystemStore {
    location: String,
    root: PathBuf,
    mode: Mode,
}

const CONFIG_NAME: &str = "CONFIG";

fn tmp_name() -> Result<String, Error> {
    let mut random = [0u8; 8];
    openssl::rand::rand_bytes(&mut random)?;
    Ok(format!(".tmp_{}", hex::encode(random)))
}

impl FilesystemStore {
    pub fn create<P: Into<PathBuf>>(path: P, config: &[u8]) -> Result<Self, Error> {
        let root: PathBuf = path.into();

        if root.exists() && root.read_dir()?.next().is_some() {
            bail!("refusing to create repository at {:?}: not empty", root);
        }
        std::fs::create_dir_all(&root)
            .with_context(|| format!("unable to create store at {:?}", root))?;

        for ns in [Namespace::Packfiles, Namespace::States, Namespace::Locks] {
            std::fs::create_dir(root.join(ns.name()))?;
        }

        let store = Self {
            location: root.to_string_lossy().to_string(),
            root,
            mode: Mode::READ | Mode::WRITE,
        };
        store.write_atomic(&store.root.join(CONFIG_NAME), config)?;
        Ok(store)
    }

    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let root: PathBuf = path.into();

        if !root.join(CONFIG_NAME).exists() {
            bail!("no repository found at {:?}", root);
        }

        let writable = !std::fs::metadata(&root)?.permissions().readonly();
        let mode = if writable {
            Mode::READ | Mode::WRITE
        } else {
            Mode::READ
        };

        Ok(Self {
            location: root.to_string_lossy().to_string(),
            root,
            mode,
        })
    }

    pub fn open_boxed(location: &Location) -> Result<Box<dyn Store>, Error> {
        Ok(Box::new(Self::open(&location.path)?))
    }

    pub fn create_boxed(location: &Location, config: &[u8]) -> Result<Box<dyn Store>, Error> {
        Ok(Box::new(Self::create(&location.path, config)?))
    }

    fn object_path(&self, ns: Namespace, mac: &Mac) -> PathBuf {
        let mut path = self.root.join(ns.name());
        if ns.bucketed() {
            path.push(mac.prefix());
        }
        path.push(mac.to_string());
        path
    }

    fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<(), Error> {
        let dir = target
            .parent()
            .ok_or_else(|| format_err!("invalid target path {:?}", target))?;
        let tmp_path = dir.join(tmp_name()?);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        if let Err(err) = file.write_all(data).and_then(|_| file.sync_data()) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        drop(file);

        if let Err(err) = std::fs::rename(&tmp_path, target) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn not_found(ns: Namespace, mac: &Mac) -> Error {
        match ns {
            Namespace::Packfiles => RepositoryError::PackfileNotFound(*mac).into(),
            Namespace::States => RepositoryError::StateNotFound(*mac).into(),
            Namespace::Locks => RepositoryError::BlobNotFound(*mac).into(),
        }
    }

    fn dir_size(path: &Path) -> Result<u64, Error> {
        let mut total = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += Self::dir_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

impl Store for FilesystemStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn get_config(&self) -> Result<Vec<u8>, Error> {
        Ok(std::fs::read(self.root.join(CONFIG_NAME))
            .with_context(|| format!("unable to read repository config at {:?}", self.root))?)
    }

    fn list(&self, ns: Namespace) -> Result<Vec<Mac>, Error> {
        let base = self.root.join(ns.name());
        let mut result = Vec::new();

        let mut dirs = vec![base];
        while let Some(dir) = dirs.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    dirs.push(entry.path());
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(".tmp_") {
                    continue;
                }
                match name.parse::<Mac>() {
                    Ok(mac) => result.push(mac),
                    Err(_) => log::warn!("skipping alien file {:?} in {:?}", name, dir),
                }
            }
        }
        result.sort();
        Ok(result)
    }

    fn get(&self, ns: Namespace, mac: &Mac) -> Result<Vec<u8>, Error> {
        match std::fs::read(self.object_path(ns, mac)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Self::not_found(ns, mac))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get_range(&self, ns: Namespace, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
        let mut file = match File::open(self.object_path(ns, mac)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::not_found(ns, mac));
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).map_err(|err| {
            format_err!("short read at {}+{} in {} - {}", offset, length, mac, err)
        })?;
        Ok(buffer)
    }

    fn put(&self, ns: Namespace, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error> {
        let target = self.object_path(ns, mac);
        if ns.bucketed() {
            // bucket directories are created lazily
            std::fs::create_dir_all(target.parent().unwrap())?;
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.write_atomic(&target, &data)?;
        Ok(data.len() as u64)
    }

    fn delete(&self, ns: Namespace, mac: &Mac) -> Result<(), Error> {
        match std::fs::remove_file(self.object_path(ns, mac)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Self::not_found(ns, mac))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn size(&self) -> Result<u64, Error> {
        Self::dir_size(&self.root)
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
