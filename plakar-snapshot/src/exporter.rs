//! Exporter capability set and the built-in filesystem exporter.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Error};

use crate::entry::FileStat;

pub trait Exporter: Send + Sync {
    fn kind(&self) -> &'static str;

    fn root(&self) -> String;

    fn mkdir(&self, path: &str) -> Result<(), Error>;

    fn write_file(&self, path: &str, reader: &mut dyn Read) -> Result<u64, Error>;

    fn symlink(&self, path: &str, target: &str) -> Result<(), Error>;

    /// Apply mode (and best-effort ownership) after content is in place.
    fn chmod(&self, path: &str, stat: &FileStat) -> Result<(), Error>;
}

pub struct FsExporter {
    base: PathBuf,
}

impl FsExporter {
    pub fn new<P: Into<PathBuf>>(base: P) -> Result<Self, Error> {
        let base: PathBuf = base.into();
        std::fs::create_dir_all(&base)
            .with_context(|| format!("unable to create target directory {:?}", base))?;
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
}

impl Exporter for FsExporter {
    fn kind(&self) -> &'static str {
        "fs"
    }

    fn root(&self) -> String {
        self.base.to_string_lossy().to_string()
    }

    fn mkdir(&self, path: &str) -> Result<(), Error> {
        let absolute = self.absolute(path);
        std::fs::create_dir_all(&absolute)
            .with_context(|| format!("unable to create {:?}", absolute))?;
        Ok(())
    }

    fn write_file(&self, path: &str, reader: &mut dyn Read) -> Result<u64, Error> {
        let absolute = self.absolute(path);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&absolute)
            .with_context(|| format!("unable to create {:?}", absolute))?;
        let written = std::io::copy(reader, &mut file)?;
        Ok(written)
    }

    fn symlink(&self, path: &str, target: &str) -> Result<(), Error> {
        let absolute = self.absolute(path);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, &absolute)
            .with_context(|| format!("unable to create symlink {:?}", absolute))?;
        Ok(())
    }

    fn chmod(&self, path: &str, stat: &FileStat) -> Result<(), Error> {
        use std::os::unix::fs::PermissionsExt;
        let absolute = self.absolute(path);
        std::fs::set_permissions(&absolute, std::fs::Permissions::from_mode(stat.mode & 0o7777))
            .with_context(|| format!("unable to chmod {:?}", absolute))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_files_and_modes() -> Result<(), Error> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let exporter = FsExporter::new(dir.path().join("out"))?;

        exporter.mkdir("/subdir")?;
        exporter.write_file("/subdir/dummy.txt", &mut &b"hello dummy"[..])?;
        exporter.chmod(
            "/subdir/dummy.txt",
            &FileStat {
                mode: 0o100600,
                ..Default::default()
            },
        )?;

        let target = dir.path().join("out/subdir/dummy.txt");
        assert_eq!(std::fs::read(&target)?, b"hello dummy");
        assert_eq!(std::fs::metadata(&target)?.permissions().mode() & 0o777, 0o600);
        Ok(())
    }
}
