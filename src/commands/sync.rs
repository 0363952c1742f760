use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;

use crate::context::AppContext;

/// Push snapshots missing from the peer repository.
pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    peer: &str,
    peer_secret: Option<&str>,
) -> Result<i32, Error> {
    let unlock = |attempt: u32| -> Result<Option<String>, Error> {
        match peer_secret {
            Some(secret) if attempt == 0 => Ok(Some(secret.to_string())),
            _ => Ok(None),
        }
    };
    let peer_repo = Arc::new(Repository::open(
        &ctx.registry,
        peer,
        &ctx.cache,
        &unlock,
    )?);

    let result = plakar_snapshot::sync(repo, &peer_repo, &ctx.cancel, ctx.max_concurrency)?;
    ctx.println(&format!(
        "synced {} snapshots ({} blobs) to {}",
        result.snapshots, result.blobs, peer
    ));
    peer_repo.close()?;
    Ok(0)
}
