use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;

use crate::commands::load_snapshot;
use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: &str,
    path: &str,
) -> Result<i32, Error> {
    let snapshot = load_snapshot(repo, snapshot)?;
    let mut reader = snapshot.read_file(path)?;
    ctx.stream_stdout(&mut reader)?;
    Ok(0)
}
