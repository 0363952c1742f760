use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;

use crate::commands::{format_mode, load_snapshot};
use crate::context::AppContext;

pub fn run(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: &str,
    path: Option<&str>,
    long: bool,
) -> Result<i32, Error> {
    // without a snapshot argument, list the snapshots themselves
    if snapshot.is_empty() {
        for id in repo.list_snapshots() {
            let snapshot = plakar_snapshot::Snapshot::load(repo, id)?;
            let header = snapshot.header();
            ctx.println(&format!(
                "{} {} {:>8} files {:>12} bytes {}",
                format_time(header.timestamp),
                id,
                header.summary.files,
                header.summary.size,
                header.importer.directory
            ));
        }
        return Ok(0);
    }

    let snapshot = load_snapshot(repo, snapshot)?;
    let base = path.unwrap_or("/");

    for item in snapshot.entries() {
        ctx.cancel.check()?;
        let (entry_path, entry) = item?;
        if !under(&entry_path, base) || entry_path == "/" {
            continue;
        }

        if long {
            let mac = entry
                .object
                .map(|mac| mac.short())
                .unwrap_or_else(|| "-".repeat(8));
            ctx.println(&format!(
                "{} {:>8} {:>8} {:>10} {} {} {}",
                format_mode(entry.kind, entry.stat.mode),
                entry.stat.username,
                entry.stat.groupname,
                entry.stat.size,
                format_time(entry.stat.mtime_secs),
                mac,
                entry_path
            ));
        } else {
            ctx.println(&entry_path);
        }
    }
    Ok(0)
}

fn under(path: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    path == base || path.starts_with(&format!("{}/", base))
}

/// `YYYY-MM-DD HH:MM:SS` from a unix timestamp, without a timezone
/// database (UTC).
pub fn format_time(epoch: i64) -> String {
    let days = epoch.div_euclid(86400);
    let secs = epoch.rem_euclid(86400);

    // civil-from-days (Howard Hinnant's algorithm)
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_rendering() {
        assert_eq!(format_time(0), "1970-01-01 00:00:00");
        assert_eq!(format_time(1700000000), "2023-11-14 22:13:20");
    }
}
