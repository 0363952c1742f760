use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;
use plakar_snapshot::Snapshot;

use crate::context::AppContext;

/// Find pathnames matching a glob-like pattern (`*`, `?`) across every
/// snapshot. Patterns without a wildcard match by substring.
pub fn run(ctx: &Arc<AppContext>, repo: &Arc<Repository>, pattern: &str) -> Result<i32, Error> {
    let mut matched = false;

    for id in repo.list_snapshots() {
        ctx.cancel.check()?;
        let snapshot = Snapshot::load(repo, id)?;
        for item in snapshot.entries() {
            ctx.cancel.check()?;
            let (path, _) = item?;
            let hit = if pattern.contains('*') || pattern.contains('?') {
                glob_match(pattern, &path) || glob_match(pattern, basename(&path))
            } else {
                path.contains(pattern)
            };
            if hit {
                ctx.println(&format!("{}:{}", id.short(), path));
                matched = true;
            }
        }
    }
    Ok(if matched { 0 } else { 1 })
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Iterative `*`/`?` glob match over bytes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn glob_semantics() {
        assert!(glob_match("*.txt", "dummy.txt"));
        assert!(glob_match("/subdir/*", "/subdir/foo.txt"));
        assert!(glob_match("f?o.txt", "foo.txt"));
        assert!(!glob_match("*.txt", "dummy.log"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("f?o", "fooo"));
    }
}
