use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::{backup, BackupOptions, FsImporter};
use plakar_types::EventSink;

use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    path: &str,
    tags: &[String],
) -> Result<i32, Error> {
    let importer = FsImporter::new(path)?;
    let options = BackupOptions {
        tags: tags.to_vec(),
        concurrency: ctx.max_concurrency,
        client_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let events: Arc<dyn EventSink> = Arc::clone(&ctx.events) as Arc<dyn EventSink>;
    let result = backup(repo, &importer, &ctx.cancel, &events, &options)?;

    ctx.println(&format!(
        "created snapshot {} ({} files, {} bytes, {} errors)",
        result.snapshot, result.files, result.bytes, result.errors
    ));

    // per-entry errors were recorded in the snapshot: partial success
    Ok(if result.errors > 0 { 2 } else { 0 })
}
