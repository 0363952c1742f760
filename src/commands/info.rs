use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_types::ResourceType;

use crate::commands::{load_snapshot, ls::format_time};
use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: Option<&str>,
) -> Result<i32, Error> {
    match snapshot {
        Some(prefix) => snapshot_info(ctx, repo, prefix),
        None => repository_info(ctx, repo),
    }
}

fn repository_info(ctx: &Arc<AppContext>, repo: &Arc<Repository>) -> Result<i32, Error> {
    let config = repo.configuration();
    ctx.println(&format!("RepositoryID: {}", config.repository_id));
    ctx.println(&format!("Created: {}", format_time(config.timestamp)));
    ctx.println(&format!(
        "Hashing: {} ({} bits)",
        config.hashing.algorithm, config.hashing.bits
    ));
    ctx.println(&format!(
        "Chunking: {} ({}/{}/{})",
        config.chunking.algorithm,
        config.chunking.min_size,
        config.chunking.avg_size,
        config.chunking.max_size
    ));
    match &config.compression {
        Some(compression) => ctx.println(&format!(
            "Compression: {} (level {})",
            compression.algorithm, compression.level
        )),
        None => ctx.println("Compression: none"),
    }
    match &config.encryption {
        Some(encryption) => ctx.println(&format!(
            "Encryption: {} ({})",
            encryption.algorithm, encryption.kdf
        )),
        None => ctx.println("Encryption: none"),
    }

    let packfiles = repo.store().list_packfiles()?;
    let states = repo.store().list_states()?;
    ctx.println(&format!("Snapshots: {}", repo.list_snapshots().len()));
    ctx.println(&format!("Packfiles: {}", packfiles.len()));
    ctx.println(&format!("States: {}", states.len()));
    ctx.println(&format!("Chunks: {}", repo.list_resource(ResourceType::Chunk).len()));
    ctx.println(&format!("Size: {} bytes", repo.store().size()?));
    Ok(0)
}

fn snapshot_info(ctx: &Arc<AppContext>, repo: &Arc<Repository>, prefix: &str) -> Result<i32, Error> {
    let snapshot = load_snapshot(repo, prefix)?;
    let header = snapshot.header();

    ctx.println(&format!("SnapshotID: {}", snapshot.id()));
    ctx.println(&format!("Timestamp: {}", format_time(header.timestamp)));
    ctx.println(&format!("Duration: {:.3}s", header.duration_secs));
    if !header.tags.is_empty() {
        ctx.println(&format!("Tags: {}", header.tags.join(", ")));
    }
    ctx.println(&format!(
        "Client: {} on {}/{}",
        header.client.version, header.client.os, header.client.arch
    ));
    ctx.println(&format!(
        "Host: {}@{}",
        header.client.username, header.client.hostname
    ));
    ctx.println(&format!(
        "Importer: {} ({})",
        header.importer.kind, header.importer.directory
    ));
    ctx.println(&format!(
        "Contents: {} files, {} directories, {} symlinks ({} bytes)",
        header.summary.files,
        header.summary.directories,
        header.summary.symlinks,
        header.summary.size
    ));
    ctx.println(&format!("Mean entropy: {:.3}", header.summary.mean_entropy()));
    if header.summary.errors > 0 {
        ctx.println(&format!("Errors: {}", header.summary.errors));
        for item in snapshot.errors() {
            let (path, message) = item?;
            ctx.println(&format!("  {}: {}", path, message));
        }
    }
    Ok(0)
}
