//! Importer capability set and the built-in filesystem importer.
//!
//! Importers produce a lazy stream of scan results; anything else (cloud
//! buckets, sftp, tarballs, stdin) plugs in through the same trait.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};

use crate::entry::FileStat;

#[derive(Clone, Debug)]
pub enum ScanRecord {
    Directory {
        path: String,
        stat: FileStat,
    },
    File {
        path: String,
        stat: FileStat,
    },
    Symlink {
        path: String,
        stat: FileStat,
        target: String,
    },
    Device {
        path: String,
        stat: FileStat,
    },
}

impl ScanRecord {
    pub fn path(&self) -> &str {
        match self {
            ScanRecord::Directory { path, .. }
            | ScanRecord::File { path, .. }
            | ScanRecord::Symlink { path, .. }
            | ScanRecord::Device { path, .. } => path,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScanError {
    pub path: String,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum ScanResult {
    Record(ScanRecord),
    Error(ScanError),
}

pub trait Importer: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Source description recorded in the snapshot header.
    fn origin(&self) -> String;

    /// Root directory of the scan, as recorded in the header.
    fn root(&self) -> String;

    /// Lazy scan stream; per-entry failures are yielded as errors, not
    /// returned.
    fn scan(&self) -> Result<Box<dyn Iterator<Item = ScanResult> + Send>, Error>;

    /// Open one regular file for reading, by snapshot-relative path.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, Error>;

    /// Extended attributes of one path.
    fn xattrs(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, Error>;
}

/// Resolves uid/gid to names, memoised.
#[derive(Default)]
struct IdResolver {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl IdResolver {
    fn username(&mut self, uid: u32) -> String {
        self.users
            .entry(uid)
            .or_insert_with(|| {
                nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|user| user.name)
                    .unwrap_or_default()
            })
            .clone()
    }

    fn groupname(&mut self, gid: u32) -> String {
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|group| group.name)
                    .unwrap_or_default()
            })
            .clone()
    }
}

pub struct FsImporter {
    base: PathBuf,
}

impl FsImporter {
    pub fn new<P: Into<PathBuf>>(base: P) -> Result<Self, Error> {
        let base: PathBuf = base.into();
        let base = base
            .canonicalize()
            .with_context(|| format!("unable to access {:?}", base))?;
        Ok(Self { base })
    }

    fn absolute(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.base.clone()
        } else {
            self.base.join(relative)
        }
    }

    fn relative(base: &Path, path: &Path) -> String {
        match path.strip_prefix(base) {
            Ok(rest) if rest.as_os_str().is_empty() => "/".to_string(),
            Ok(rest) => format!("/{}", rest.to_string_lossy()),
            Err(_) => path.to_string_lossy().to_string(),
        }
    }

    fn stat_of(meta: &std::fs::Metadata, resolver: &mut IdResolver) -> FileStat {
        use std::os::unix::fs::MetadataExt;
        FileStat {
            mode: meta.mode(),
            size: meta.len(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime_secs: meta.mtime(),
            mtime_nanos: meta.mtime_nsec() as u32,
            nlink: meta.nlink(),
            device: meta.dev(),
            inode: meta.ino(),
            username: resolver.username(meta.uid()),
            groupname: resolver.groupname(meta.gid()),
        }
    }
}

impl Importer for FsImporter {
    fn kind(&self) -> &'static str {
        "fs"
    }

    fn origin(&self) -> String {
        let hostname = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        hostname
    }

    fn root(&self) -> String {
        self.base.to_string_lossy().to_string()
    }

    fn scan(&self) -> Result<Box<dyn Iterator<Item = ScanResult> + Send>, Error> {
        let base = self.base.clone();
        let mut resolver = IdResolver::default();

        let walker = walkdir::WalkDir::new(&self.base)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter();

        Ok(Box::new(walker.map(move |item| {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| Self::relative(&base, p))
                        .unwrap_or_else(|| "/".to_string());
                    return ScanResult::Error(ScanError {
                        path,
                        message: err.to_string(),
                    });
                }
            };

            let path = Self::relative(&base, entry.path());
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    return ScanResult::Error(ScanError {
                        path,
                        message: format!("stat failed - {}", err),
                    });
                }
            };
            let stat = Self::stat_of(&meta, &mut resolver);

            let file_type = entry.file_type();
            let record = if file_type.is_dir() {
                ScanRecord::Directory { path, stat }
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map(|t| t.to_string_lossy().to_string())
                    .unwrap_or_default();
                ScanRecord::Symlink { path, stat, target }
            } else if file_type.is_file() {
                ScanRecord::File { path, stat }
            } else {
                ScanRecord::Device { path, stat }
            };
            ScanResult::Record(record)
        })))
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, Error> {
        let absolute = self.absolute(path);
        let file = std::fs::File::open(&absolute)
            .with_context(|| format!("unable to open {:?}", absolute))?;
        Ok(Box::new(file))
    }

    #[cfg(target_os = "linux")]
    fn xattrs(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        xattr::list(&self.absolute(path))
    }

    #[cfg(not(target_os = "linux"))]
    fn xattrs(&self, _path: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        Ok(Vec::new())
    }
}

/// Thin wrappers over the llistxattr/lgetxattr syscalls.
#[cfg(target_os = "linux")]
mod xattr {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    pub fn list(path: &Path) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format_err!("path contains NUL byte"))?;

        let size = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                // filesystem without xattr support
                Some(libc::ENOTSUP) => Ok(Vec::new()),
                _ => Err(err.into()),
            };
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut names = vec![0u8; size as usize];
        let size = unsafe {
            libc::llistxattr(c_path.as_ptr(), names.as_mut_ptr() as *mut libc::c_char, names.len())
        };
        if size < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        names.truncate(size as usize);

        let mut result = Vec::new();
        for raw_name in names.split(|byte| *byte == 0) {
            if raw_name.is_empty() {
                continue;
            }
            let name = String::from_utf8_lossy(raw_name).to_string();
            let c_name = CString::new(raw_name)?;
            let value = get(&c_path, &c_name)?;
            result.push((name, value));
        }
        Ok(result)
    }

    fn get(path: &CString, name: &CString) -> Result<Vec<u8>, Error> {
        let size = unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut value = vec![0u8; size as usize];
        if size > 0 {
            let size = unsafe {
                libc::lgetxattr(
                    path.as_ptr(),
                    name.as_ptr(),
                    value.as_mut_ptr() as *mut libc::c_void,
                    value.len(),
                )
            };
            if size < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            value.truncate(size as usize);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scans_a_small_tree_in_order() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("subdir"))?;
        std::fs::write(dir.path().join("subdir/dummy.txt"), b"hello dummy")?;
        std::fs::write(dir.path().join("subdir/foo.txt"), b"hello foo")?;
        std::fs::create_dir(dir.path().join("another_subdir"))?;
        std::fs::write(dir.path().join("another_subdir/bar.txt"), b"hello bar")?;

        let importer = FsImporter::new(dir.path())?;
        let paths: Vec<String> = importer
            .scan()?
            .map(|result| match result {
                ScanResult::Record(record) => record.path().to_string(),
                ScanResult::Error(err) => panic!("scan error: {}", err.message),
            })
            .collect();

        assert_eq!(
            paths,
            vec![
                "/",
                "/another_subdir",
                "/another_subdir/bar.txt",
                "/subdir",
                "/subdir/dummy.txt",
                "/subdir/foo.txt",
            ]
        );

        let mut content = String::new();
        importer
            .open("/subdir/dummy.txt")?
            .read_to_string(&mut content)?;
        assert_eq!(content, "hello dummy");
        Ok(())
    }
}
