//! SQLite single-file backend.
//!
//! Replicates the logical namespaces as one table per namespace with the
//! MAC as primary key. Inserts are transactional, which gives the atomic
//! `put` semantics for free.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};

use plakar_types::{Mac, RepositoryError};

use crate::{Location, Mode, Namespace, Store};

pub struct SqliteStore {
    location: String,
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS configuration (id INTEGER PRIMARY KEY CHECK (id = 0), data BLOB NOT NULL);
CREATE TABLE IF NOT EXISTS packfiles (mac BLOB PRIMARY KEY, data BLOB NOT NULL) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS states (mac BLOB PRIMARY KEY, data BLOB NOT NULL) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS locks (mac BLOB PRIMARY KEY, data BLOB NOT NULL) WITHOUT ROWID;
";

impl SqliteStore {
    pub fn create<P: Into<PathBuf>>(path: P, config: &[u8]) -> Result<Self, Error> {
        let path: PathBuf = path.into();
        if path.exists() {
            bail!("refusing to create repository at {:?}: file exists", path);
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT INTO configuration (id, data) VALUES (0, ?1)",
            params![config],
        )?;

        Ok(Self {
            location: path.to_string_lossy().to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path: PathBuf = path.into();
        if !path.exists() {
            bail!("no repository found at {:?}", path);
        }
        let conn = Connection::open(&path)?;
        Ok(Self {
            location: path.to_string_lossy().to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_boxed(location: &Location) -> Result<Box<dyn Store>, Error> {
        Ok(Box::new(Self::open(&location.path)?))
    }

    pub fn create_boxed(location: &Location, config: &[u8]) -> Result<Box<dyn Store>, Error> {
        Ok(Box::new(Self::create(&location.path, config)?))
    }

    fn not_found(ns: Namespace, mac: &Mac) -> Error {
        match ns {
            Namespace::Packfiles => RepositoryError::PackfileNotFound(*mac).into(),
            Namespace::States => RepositoryError::StateNotFound(*mac).into(),
            Namespace::Locks => RepositoryError::BlobNotFound(*mac).into(),
        }
    }
}

impl Store for SqliteStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn mode(&self) -> Mode {
        Mode::READ | Mode::WRITE
    }

    fn get_config(&self) -> Result<Vec<u8>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT data FROM configuration WHERE id = 0", [], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| format_err!("store at {} has no configuration", self.location))
    }

    fn list(&self, ns: Namespace) -> Result<Vec<Mac>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT mac FROM {} ORDER BY mac", ns.name()))?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(Mac::from_slice(&row?)?);
        }
        Ok(result)
    }

    fn get(&self, ns: Namespace, mac: &Mac) -> Result<Vec<u8>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT data FROM {} WHERE mac = ?1", ns.name()),
            params![&mac.as_bytes()[..]],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Self::not_found(ns, mac))
    }

    fn get_range(&self, ns: Namespace, mac: &Mac, offset: u64, length: u32) -> Result<Vec<u8>, Error> {
        // sqlite's substr is 1-indexed
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT substr(data, ?2, ?3) FROM {} WHERE mac = ?1",
                ns.name()
            ),
            params![&mac.as_bytes()[..], (offset + 1) as i64, length as i64],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| Self::not_found(ns, mac))
    }

    fn put(&self, ns: Namespace, mac: &Mac, reader: &mut dyn Read) -> Result<u64, Error> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (mac, data) VALUES (?1, ?2)",
                ns.name()
            ),
            params![&mac.as_bytes()[..], &data],
        )?;
        Ok(data.len() as u64)
    }

    fn delete(&self, ns: Namespace, mac: &Mac) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE mac = ?1", ns.name()),
            params![&mac.as_bytes()[..]],
        )?;
        if deleted == 0 {
            return Err(Self::not_found(ns, mac));
        }
        Ok(())
    }

    fn size(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let mut total = 0u64;
        for ns in [Namespace::Packfiles, Namespace::States, Namespace::Locks] {
            let size: i64 = conn.query_row(
                &format!("SELECT COALESCE(SUM(LENGTH(data)), 0) FROM {}", ns.name()),
                [],
                |row| row.get(0),
            )?;
            total += size as u64;
        }
        Ok(total)
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_and_ranges() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("repo.db");
        let store = SqliteStore::create(&path, b"cfg")?;

        let mac = Mac::new([7u8; 32]);
        store.put(Namespace::States, &mac, &mut &b"hello state"[..])?;
        assert_eq!(store.get(Namespace::States, &mac)?, b"hello state");
        assert_eq!(store.get_range(Namespace::States, &mac, 6, 5)?, b"state");
        assert_eq!(store.list(Namespace::States)?, vec![mac]);
        assert_eq!(store.get_config()?, b"cfg");

        drop(store);
        let reopened = SqliteStore::open(&path)?;
        assert_eq!(reopened.get(Namespace::States, &mac)?, b"hello state");
        Ok(())
    }
}
