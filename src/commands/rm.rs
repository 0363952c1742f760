use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::remove_snapshots;
use plakar_types::Mac;

use crate::context::AppContext;

pub fn run(ctx: &Arc<AppContext>, repo: &Arc<Repository>, snapshots: &[String]) -> Result<i32, Error> {
    let mut macs: Vec<Mac> = Vec::with_capacity(snapshots.len());
    for prefix in snapshots {
        macs.push(repo.resolve_snapshot_prefix(prefix)?);
    }

    remove_snapshots(repo, &macs)?;
    for mac in &macs {
        ctx.println(&format!("removed snapshot {}", mac));
    }
    Ok(0)
}
