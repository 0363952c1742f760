use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use plakar::agent::protocol::{CommandRequest, Request};
use plakar::commands;
use plakar::context::AppContext;
use plakar_cache::CacheManager;
use plakar_repository::Repository;

/// Captures a virtual stdout/stderr stream.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Cli {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    base: Arc<AppContext>,
    location: String,
}

impl Cli {
    fn new() -> Result<Self, Error> {
        let dir = tempfile::tempdir()?;
        let cache = Arc::new(CacheManager::new(dir.path().join("cache")));
        let base = Arc::new(AppContext::new(cache));
        let location = dir.path().join("repo").to_string_lossy().to_string();

        let repo = Repository::create(&base.registry, &location, &base.cache, None, true)?;
        repo.close()?;
        drop(repo);

        Ok(Self {
            dir,
            base,
            location,
        })
    }

    /// Run one command agentless, returning `(exit code, stdout)`.
    fn run(&self, command: CommandRequest) -> Result<(i32, String), Error> {
        let stdout = Capture::default();
        let stderr = Capture::default();
        let ctx = Arc::new(self.base.child(
            Box::new(stdout.clone()),
            Box::new(stderr.clone()),
            None,
        ));
        let request = Request {
            store_location: self.location.clone(),
            secret: None,
            command,
        };
        let code = commands::execute(&ctx, &request, None)?;
        Ok((code, stdout.contents()))
    }

    fn sample_source(&self) -> Result<String, Error> {
        let source = self.dir.path().join("source");
        std::fs::create_dir_all(source.join("subdir"))?;
        std::fs::create_dir_all(source.join("another_subdir"))?;
        std::fs::write(source.join("subdir/dummy.txt"), b"hello dummy")?;
        std::fs::write(source.join("subdir/foo.txt"), b"hello foo")?;
        std::fs::write(source.join("another_subdir/bar.txt"), b"hello bar")?;
        Ok(source.to_string_lossy().to_string())
    }

    fn backup(&self) -> Result<String, Error> {
        let source = self.sample_source()?;
        let (code, output) = self.run(CommandRequest::Backup {
            path: source,
            tags: Vec::new(),
        })?;
        assert_eq!(code, 0);
        // "created snapshot <mac> (...)"
        let id = output
            .split_whitespace()
            .nth(2)
            .expect("backup output carries the snapshot id")
            .to_string();
        assert_eq!(id.len(), 64);
        Ok(id)
    }
}

#[test]
fn backup_ls_cat_checksum_restore() -> Result<(), Error> {
    let cli = Cli::new()?;
    let snapshot = cli.backup()?;

    // bare ls enumerates snapshots
    let (code, snapshots) = cli.run(CommandRequest::Ls {
        snapshot: String::new(),
        path: None,
        long: false,
    })?;
    assert_eq!(code, 0);
    assert!(snapshots.contains(&snapshot), "{}", snapshots);

    let (code, listing) = cli.run(CommandRequest::Ls {
        snapshot: snapshot.clone(),
        path: None,
        long: false,
    })?;
    assert_eq!(code, 0);
    for path in [
        "/subdir/dummy.txt",
        "/subdir/foo.txt",
        "/another_subdir/bar.txt",
    ] {
        assert!(listing.contains(path), "missing {} in: {}", path, listing);
    }

    let (code, content) = cli.run(CommandRequest::Cat {
        snapshot: snapshot.clone(),
        path: "/subdir/dummy.txt".into(),
    })?;
    assert_eq!(code, 0);
    assert_eq!(content, "hello dummy");

    let (code, checksum) = cli.run(CommandRequest::Checksum {
        snapshot: snapshot.clone(),
        paths: vec!["/subdir/foo.txt".into()],
        fast: true,
    })?;
    assert_eq!(code, 0);
    let mac = checksum.split_whitespace().next().unwrap();
    assert_eq!(mac.len(), 64);
    assert!(mac.chars().all(|c| c.is_ascii_hexdigit()));
    // equals the (single) chunk MAC of the content
    assert_eq!(mac, openssl_sha256_hex(b"hello foo"));

    // slow checksum recomputes and agrees
    let (code, recomputed) = cli.run(CommandRequest::Checksum {
        snapshot: snapshot.clone(),
        paths: vec!["/subdir/foo.txt".into()],
        fast: false,
    })?;
    assert_eq!(code, 0);
    assert!(recomputed.starts_with(mac));

    let out = cli.dir.path().join("out");
    let (code, _) = cli.run(CommandRequest::Restore {
        snapshot: snapshot.clone(),
        path: None,
        to: out.to_string_lossy().to_string(),
    })?;
    assert_eq!(code, 0);
    assert_eq!(std::fs::read(out.join("subdir/dummy.txt"))?, b"hello dummy");
    assert_eq!(std::fs::read(out.join("subdir/foo.txt"))?, b"hello foo");
    assert_eq!(
        std::fs::read(out.join("another_subdir/bar.txt"))?,
        b"hello bar"
    );
    Ok(())
}

fn openssl_sha256_hex(data: &[u8]) -> String {
    // the repository is unencrypted, so MACs are plain SHA-256
    use std::fmt::Write;
    let digest = {
        let mut hasher = plakar_repository::MacHasher::plain().streaming();
        hasher.update(data);
        hasher.finalize()
    };
    let mut out = String::new();
    write!(out, "{}", digest).unwrap();
    out
}

#[test]
fn check_info_diff_locate() -> Result<(), Error> {
    let cli = Cli::new()?;
    let first = cli.backup()?;

    // a second identical backup dedups; diff is empty
    std::fs::write(
        cli.dir.path().join("source/subdir/new.txt"),
        b"fresh content",
    )?;
    let second = cli.backup()?;

    let (code, _) = cli.run(CommandRequest::Check {
        snapshot: Some(first.clone()),
        fast: false,
    })?;
    assert_eq!(code, 0);

    let (code, info) = cli.run(CommandRequest::Info { snapshot: None })?;
    assert_eq!(code, 0);
    assert!(info.contains("Snapshots: 2"), "{}", info);

    let (code, changes) = cli.run(CommandRequest::Diff {
        old: first.clone(),
        new: second.clone(),
    })?;
    assert_eq!(code, 0);
    assert!(changes.contains("+ /subdir/new.txt"), "{}", changes);
    assert!(!changes.contains("/subdir/foo.txt"), "{}", changes);

    let (code, hits) = cli.run(CommandRequest::Locate {
        pattern: "*.txt".into(),
    })?;
    assert_eq!(code, 0);
    assert!(hits.contains("/subdir/dummy.txt"), "{}", hits);
    Ok(())
}

#[test]
fn rm_and_maintenance_reclaim_space() -> Result<(), Error> {
    let cli = Cli::new()?;
    let first = cli.backup()?;

    let (code, _) = cli.run(CommandRequest::Rm {
        snapshots: vec![first[..12].to_string()],
    })?;
    assert_eq!(code, 0);

    let (code, output) = cli.run(CommandRequest::Maintenance {})?;
    assert_eq!(code, 0);
    assert!(output.contains("packfiles deleted"), "{}", output);

    let (_, info) = cli.run(CommandRequest::Info { snapshot: None })?;
    assert!(info.contains("Snapshots: 0"), "{}", info);
    assert!(info.contains("Packfiles: 0"), "{}", info);
    Ok(())
}

#[test]
fn clone_preserves_everything() -> Result<(), Error> {
    let cli = Cli::new()?;
    let snapshot = cli.backup()?;

    let target = cli.dir.path().join("mirror").to_string_lossy().to_string();
    let (code, _) = cli.run(CommandRequest::Clone {
        target: target.clone(),
    })?;
    assert_eq!(code, 0);

    // read the clone directly
    let stdout = Capture::default();
    let ctx = Arc::new(cli.base.child(
        Box::new(stdout.clone()),
        Box::new(Capture::default()),
        None,
    ));
    let request = Request {
        store_location: target,
        secret: None,
        command: CommandRequest::Cat {
            snapshot,
            path: "/subdir/dummy.txt".into(),
        },
    };
    assert_eq!(commands::execute(&ctx, &request, None)?, 0);
    assert_eq!(stdout.contents(), "hello dummy");
    Ok(())
}
