use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::garbage_collect;

use crate::context::AppContext;

pub fn run(ctx: &Arc<AppContext>, repo: &Arc<Repository>) -> Result<i32, Error> {
    let report = garbage_collect(repo, &ctx.cancel, &*ctx.events)?;
    ctx.println(&format!(
        "maintenance: {} blobs tombstoned, {} packfiles deleted, {} states pruned",
        report.blobs_tombstoned, report.packfiles_deleted, report.states_pruned
    ));
    Ok(0)
}
