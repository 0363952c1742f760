use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::{diff, DiffChange};

use crate::commands::load_snapshot;
use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    old: &str,
    new: &str,
) -> Result<i32, Error> {
    let old = load_snapshot(repo, old)?;
    let new = load_snapshot(repo, new)?;

    let changes = diff(&old, &new)?;
    for change in &changes {
        let marker = match change {
            DiffChange::Added(_) => '+',
            DiffChange::Removed(_) => '-',
            DiffChange::Modified(_) => 'M',
        };
        ctx.println(&format!("{} {}", marker, change.path()));
    }
    Ok(0)
}
