use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::{restore, FsExporter};

use crate::commands::load_snapshot;
use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: &str,
    path: Option<&str>,
    to: &str,
) -> Result<i32, Error> {
    let snapshot = load_snapshot(repo, snapshot)?;
    let exporter = FsExporter::new(to)?;

    let result = restore(
        &snapshot,
        &exporter,
        path.unwrap_or("/"),
        &ctx.cancel,
        &*ctx.events,
    )?;

    ctx.println(&format!(
        "restored {} files / {} directories ({} bytes, {} errors) to {}",
        result.files, result.directories, result.bytes, result.errors, to
    ));
    Ok(if result.errors > 0 { 2 } else { 0 })
}
