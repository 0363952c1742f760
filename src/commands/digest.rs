use std::io::Read;
use std::sync::Arc;

use anyhow::Error;

use plakar_repository::Repository;

use crate::commands::load_snapshot;
use crate::context::AppContext;

/// `checksum`: print content MACs. With `fast` the stored object digest
/// is printed without reading data; otherwise the content is re-read
/// through the repository hasher and verified against it.
pub fn run_checksum(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: &str,
    paths: &[String],
    fast: bool,
) -> Result<i32, Error> {
    let snapshot = load_snapshot(repo, snapshot)?;
    let mut mismatches = 0;

    for path in paths {
        ctx.cancel.check()?;
        let object = snapshot.object_for(path)?;

        if fast {
            ctx.println(&format!("{}  {}", object.digest, path));
            continue;
        }

        let mut stream = repo.hasher().streaming();
        let mut reader = snapshot.read_file(path)?;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            stream.update(&buffer[..read]);
        }
        let digest = stream.finalize();
        if digest != object.digest {
            ctx.eprintln(&format!(
                "{}: digest mismatch (stored {}, computed {})",
                path, object.digest, digest
            ));
            mismatches += 1;
        } else {
            ctx.println(&format!("{}  {}", digest, path));
        }
    }
    Ok(if mismatches > 0 { 1 } else { 0 })
}

/// `digest`: print the stored object digest and content category.
pub fn run_digest(
    ctx: &Arc<AppContext>,
    repo: &Arc<Repository>,
    snapshot: &str,
    paths: &[String],
) -> Result<i32, Error> {
    let snapshot = load_snapshot(repo, snapshot)?;
    for path in paths {
        let object = snapshot.object_for(path)?;
        ctx.println(&format!(
            "{}  {}  {}  {} chunks",
            object.digest,
            object.content_type,
            path,
            object.chunks.len()
        ));
    }
    Ok(0)
}
