//! Subcommand implementations shared by the agent and the agentless CLI.

use std::sync::Arc;

use anyhow::{bail, Error};

use plakar_repository::Repository;
use plakar_snapshot::Snapshot;
use plakar_types::Mac;

use crate::agent::protocol::{CommandRequest, Request};
use crate::agent::server::{open_repository, RepositoryMap};
use crate::context::AppContext;

pub mod backup;
pub mod cat;
pub mod check;
pub mod clone;
pub mod diff;
pub mod digest;
pub mod info;
pub mod locate;
pub mod ls;
pub mod maintenance;
pub mod restore;
pub mod rm;
pub mod sync;

/// Dispatch one request. `repositories` is the agent's handle cache;
/// agentless callers pass `None` and get a fresh open.
pub fn execute(
    ctx: &Arc<AppContext>,
    request: &Request,
    repositories: Option<&RepositoryMap>,
) -> Result<i32, Error> {
    let started = std::time::Instant::now();
    let name = request.command.name();

    // clone copies raw store objects and never unlocks the source
    let result = if let CommandRequest::Clone { target } = &request.command {
        clone::run(ctx, &request.store_location, target)
    } else {
        let repo = open_repository(ctx, &request.store_location, repositories)?;
        dispatch(ctx, &repo, &request.command)
    };

    match &result {
        Ok(code) => log::info!(
            "{} finished with status {} in {:.3}s",
            name,
            code,
            started.elapsed().as_secs_f64()
        ),
        Err(err) => log::info!(
            "{} failed in {:.3}s - {}",
            name,
            started.elapsed().as_secs_f64(),
            err
        ),
    }
    result
}

fn dispatch(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    command: &CommandRequest,
) -> Result<i32, Error> {
    match command {
        CommandRequest::Backup { path, tags } => backup::run(ctx, repo, path, tags),
        CommandRequest::Check { snapshot, fast } => {
            check::run(ctx, repo, snapshot.as_deref(), *fast)
        }
        CommandRequest::Ls {
            snapshot,
            path,
            long,
        } => ls::run(ctx, repo, snapshot, path.as_deref(), *long),
        CommandRequest::Cat { snapshot, path } => cat::run(ctx, repo, snapshot, path),
        CommandRequest::Restore { snapshot, path, to } => {
            restore::run(ctx, repo, snapshot, path.as_deref(), to)
        }
        CommandRequest::Rm { snapshots } => rm::run(ctx, repo, snapshots),
        CommandRequest::Info { snapshot } => info::run(ctx, repo, snapshot.as_deref()),
        CommandRequest::Locate { pattern } => locate::run(ctx, repo, pattern),
        CommandRequest::Checksum {
            snapshot,
            paths,
            fast,
        } => digest::run_checksum(ctx, repo, snapshot, paths, *fast),
        CommandRequest::Digest { snapshot, paths } => digest::run_digest(ctx, repo, snapshot, paths),
        CommandRequest::Diff { old, new } => diff::run(ctx, repo, old, new),
        CommandRequest::Sync { peer, peer_secret } => {
            sync::run(ctx, repo, peer, peer_secret.as_deref())
        }
        CommandRequest::Maintenance {} => maintenance::run(ctx, repo),
        CommandRequest::Clone { .. } => unreachable!("handled before unlock"),
    }
}

/// Load a snapshot referenced by a hex prefix.
pub fn load_snapshot(repo: &Arc<Repository>, prefix: &str) -> Result<Snapshot, Error> {
    let mac: Mac = repo.resolve_snapshot_prefix(prefix)?;
    Snapshot::load(repo, mac)
}

/// Split a `<snapshot>:<path>` target; the path defaults to `/`.
pub fn parse_target(target: &str) -> Result<(String, String), Error> {
    match target.split_once(':') {
        Some((snapshot, path)) if !snapshot.is_empty() => {
            let path = if path.is_empty() { "/" } else { path };
            if !path.starts_with('/') {
                bail!("snapshot path '{}' must be absolute", path);
            }
            Ok((snapshot.to_string(), path.to_string()))
        }
        _ => Ok((target.to_string(), "/".to_string())),
    }
}

/// Render a unix mode the way `ls -l` does.
pub fn format_mode(kind: plakar_snapshot::EntryKind, mode: u32) -> String {
    use plakar_snapshot::EntryKind;
    let mut out = String::with_capacity(10);
    out.push(match kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::Device => 'b',
        EntryKind::File => '-',
    });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_parsing() -> Result<(), Error> {
        assert_eq!(
            parse_target("ab12:/subdir/dummy.txt")?,
            ("ab12".to_string(), "/subdir/dummy.txt".to_string())
        );
        assert_eq!(parse_target("ab12")?, ("ab12".to_string(), "/".to_string()));
        assert_eq!(parse_target("ab12:")?, ("ab12".to_string(), "/".to_string()));
        assert!(parse_target("ab12:relative").is_err());
        Ok(())
    }

    #[test]
    fn mode_rendering() {
        assert_eq!(
            format_mode(plakar_snapshot::EntryKind::File, 0o100644),
            "-rw-r--r--"
        );
        assert_eq!(
            format_mode(plakar_snapshot::EntryKind::Directory, 0o40755),
            "drwxr-xr-x"
        );
    }
}
