use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::{check_packfiles, check_snapshot, CheckReport};

use crate::commands::load_snapshot;
use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: Option<&str>,
    fast: bool,
) -> Result<i32, Error> {
    let mut clean = true;

    match snapshot {
        Some(prefix) => {
            let snapshot = load_snapshot(repo, prefix)?;
            let report = check_snapshot(&snapshot, fast, &ctx.cancel, &*ctx.events)?;
            clean &= print_report(ctx, &format!("snapshot {}", snapshot.id().short()), &report);
        }
        None => {
            // full check: container-level first, then every snapshot graph
            let report = check_packfiles(repo, &ctx.cancel, &*ctx.events)?;
            clean &= print_report(ctx, "packfiles", &report);

            for id in repo.list_snapshots() {
                ctx.cancel.check()?;
                let snapshot = plakar_snapshot::Snapshot::load(repo, id)?;
                let report = check_snapshot(&snapshot, fast, &ctx.cancel, &*ctx.events)?;
                clean &= print_report(ctx, &format!("snapshot {}", id.short()), &report);
            }
        }
    }

    Ok(if clean { 0 } else { 1 })
}

fn print_report(ctx: &AppContext, what: &str, report: &CheckReport) -> bool {
    if report.is_clean() {
        ctx.println(&format!("{}: OK ({} blobs)", what, report.checked_blobs));
        return true;
    }
    for (mac, message) in &report.corrupt {
        ctx.println(&format!("{}: corrupt blob {} - {}", what, mac, message));
    }
    for mac in &report.missing {
        ctx.println(&format!("{}: missing blob {}", what, mac));
    }
    false
}
