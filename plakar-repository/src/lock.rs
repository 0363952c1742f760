//! Exclusive writer locks.
//!
//! A lock is a short-lived `LOCK` blob whose MAC identifies the holder.
//! Stale locks (older than the TTL) are reaped by contenders; the
//! timestamp heuristic keeps a crashed writer from wedging the repository.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locks older than this are considered abandoned.
pub const LOCK_TTL_SECONDS: i64 = 15 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockBody {
    pub owner: Uuid,
    pub hostname: String,
    pub pid: u32,
    pub created: i64,
}

impl LockBody {
    pub fn new(owner: Uuid, created: i64) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            owner,
            hostname,
            pid: std::process::id(),
            created,
        }
    }

    pub fn is_stale(&self, now: i64) -> bool {
        now - self.created > LOCK_TTL_SECONDS
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn staleness_heuristic() {
        let body = LockBody::new(Uuid::new_v4(), 1000);
        assert!(!body.is_stale(1000 + LOCK_TTL_SECONDS));
        assert!(body.is_stale(1001 + LOCK_TTL_SECONDS));
    }

    #[test]
    fn round_trip() -> Result<(), Error> {
        let body = LockBody::new(Uuid::new_v4(), 42);
        let parsed = LockBody::deserialize(&body.serialize()?)?;
        assert_eq!(parsed.owner, body.owner);
        assert_eq!(parsed.pid, body.pid);
        Ok(())
    }
}
