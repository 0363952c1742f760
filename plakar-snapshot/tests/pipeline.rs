use std::io::Read;
use std::sync::Arc;

use anyhow::Error;

use plakar_cache::CacheManager;
use plakar_repository::Repository;
use plakar_snapshot::{
    backup, check_packfiles, check_snapshot, diff, garbage_collect, remove_snapshots, restore,
    BackupOptions, EntryKind, FsExporter, FsImporter, Snapshot,
};
use plakar_store::StoreRegistry;
use plakar_types::{CancelToken, EventSink, NullSink};

struct Env {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    registry: StoreRegistry,
    cache: CacheManager,
    location: String,
}

fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let registry = StoreRegistry::default();
    let cache = CacheManager::new(dir.path().join("cache"));
    let location = dir.path().join("repo").to_string_lossy().to_string();
    Env {
        dir,
        registry,
        cache,
        location,
    }
}

fn sample_tree(base: &std::path::Path) {
    std::fs::create_dir_all(base.join("subdir")).unwrap();
    std::fs::create_dir_all(base.join("another_subdir")).unwrap();
    std::fs::write(base.join("subdir/dummy.txt"), b"hello dummy").unwrap();
    std::fs::write(base.join("subdir/foo.txt"), b"hello foo").unwrap();
    std::fs::write(base.join("another_subdir/bar.txt"), b"hello bar").unwrap();
}

fn run_backup(env: &Env, repo: &Arc<Repository>, source: &std::path::Path) -> plakar_snapshot::BackupResult {
    let _ = env;
    let importer = FsImporter::new(source).unwrap();
    let events: Arc<dyn EventSink> = Arc::new(NullSink);
    let options = BackupOptions {
        concurrency: 4,
        ..Default::default()
    };
    backup(repo, &importer, &CancelToken::new(), &events, &options).unwrap()
}

#[test]
fn round_trip_tiny_tree() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let repo = Arc::new(Repository::create(
        &env.registry,
        &env.location,
        &env.cache,
        None,
        true,
    )?);
    let result = run_backup(&env, &repo, &source);
    assert_eq!(result.files, 3);
    assert_eq!(result.errors, 0);

    // listing yields the three files at their relative paths
    let snapshot = Snapshot::load(&repo, result.snapshot)?;
    let files: Vec<String> = snapshot
        .entries()
        .filter_map(|item| {
            let (path, entry) = item.unwrap();
            matches!(entry.kind, EntryKind::File).then_some(path)
        })
        .collect();
    assert_eq!(
        files,
        vec![
            "/another_subdir/bar.txt".to_string(),
            "/subdir/dummy.txt".to_string(),
            "/subdir/foo.txt".to_string(),
        ]
    );

    // cat returns the exact content
    let mut content = String::new();
    snapshot
        .read_file("/subdir/dummy.txt")?
        .read_to_string(&mut content)?;
    assert_eq!(content, "hello dummy");

    // a small file is a single chunk, so the object digest equals the
    // chunk MAC
    let object = snapshot.object_for("/subdir/foo.txt")?;
    assert_eq!(object.chunks.len(), 1);
    assert_eq!(object.digest, object.chunks[0].mac);
    assert_eq!(object.digest, repo.mac(b"hello foo"));

    // restore reconstructs byte-identical files
    let out = env.dir.path().join("out");
    let exporter = FsExporter::new(&out)?;
    let restored = restore(&snapshot, &exporter, "/", &CancelToken::new(), &NullSink)?;
    assert_eq!(restored.files, 3);
    assert_eq!(restored.errors, 0);
    assert_eq!(std::fs::read(out.join("subdir/dummy.txt"))?, b"hello dummy");
    assert_eq!(std::fs::read(out.join("another_subdir/bar.txt"))?, b"hello bar");

    // summaries rolled up to the root
    assert_eq!(snapshot.header().summary.files, 3);
    assert_eq!(
        snapshot.header().summary.size,
        ("hello dummy".len() + "hello foo".len() + "hello bar".len()) as u64
    );
    Ok(())
}

#[test]
fn second_backup_deduplicates() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let repo = Arc::new(Repository::create(
        &env.registry,
        &env.location,
        &env.cache,
        None,
        true,
    )?);
    let first = run_backup(&env, &repo, &source);
    let packfiles_after_first = repo.store().list_packfiles()?.len();

    let second = run_backup(&env, &repo, &source);
    assert_ne!(first.snapshot, second.snapshot); // headers differ by timestamp

    // only snapshot-metadata blobs needed new packfiles
    let packfiles_after_second = repo.store().list_packfiles()?.len();
    assert!(packfiles_after_second <= packfiles_after_first + 1);

    // every file object of snapshot 1 is present in snapshot 2's tree
    let snap1 = Snapshot::load(&repo, first.snapshot)?;
    let snap2 = Snapshot::load(&repo, second.snapshot)?;
    for item in snap1.entries() {
        let (path, entry) = item?;
        if entry.object.is_some() {
            assert_eq!(snap2.get_entry(&path)?.object, entry.object);
        }
    }

    // no content differences between the two snapshots
    assert!(diff(&snap1, &snap2)?.is_empty());
    Ok(())
}

#[test]
fn encrypted_end_to_end() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let snapshot_id = {
        let repo = Arc::new(Repository::create(
            &env.registry,
            &env.location,
            &env.cache,
            Some("hunter2"),
            true,
        )?);
        let result = run_backup(&env, &repo, &source);
        repo.close()?;
        result.snapshot
    };

    let unlock = |pass: &'static str| {
        move |attempt: u32| {
            if attempt == 0 {
                Ok(Some(pass.to_string()))
            } else {
                Ok(None)
            }
        }
    };

    assert!(Repository::open(&env.registry, &env.location, &env.cache, &unlock("wrong")).is_err());

    let repo = Repository::open(&env.registry, &env.location, &env.cache, &unlock("hunter2"))?;
    let repo = Arc::new(repo);
    let snapshot = Snapshot::load(&repo, snapshot_id)?;
    let mut content = String::new();
    snapshot
        .read_file("/subdir/dummy.txt")?
        .read_to_string(&mut content)?;
    assert_eq!(content, "hello dummy");
    Ok(())
}

#[test]
fn corruption_is_detected_and_attributed() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let repo = Arc::new(Repository::create(
        &env.registry,
        &env.location,
        &env.cache,
        None,
        true,
    )?);
    let result = run_backup(&env, &repo, &source);
    let snapshot = Snapshot::load(&repo, result.snapshot)?;

    let clean = check_snapshot(&snapshot, false, &CancelToken::new(), &NullSink)?;
    assert!(clean.is_clean());

    // flip one byte inside a packfile's blob region
    let packfiles = repo.store().list_packfiles()?;
    let victim = packfiles[0];
    let mut raw = repo.store().get_packfile(&victim)?;
    raw[0] ^= 0xff;
    repo.store().put(plakar_store::Namespace::Packfiles, &victim, &mut &raw[..])?;

    let report = check_packfiles(&repo, &CancelToken::new(), &NullSink)?;
    assert!(!report.is_clean());
    Ok(())
}

#[test]
fn cancellation_leaves_the_repository_untouched() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let repo = Arc::new(Repository::create(
        &env.registry,
        &env.location,
        &env.cache,
        None,
        true,
    )?);

    let importer = FsImporter::new(&source)?;
    let events: Arc<dyn EventSink> = Arc::new(NullSink);
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = backup(
        &repo,
        &importer,
        &cancel,
        &events,
        &BackupOptions {
            concurrency: 2,
            ..Default::default()
        },
    );
    assert!(result.is_err());

    // no snapshot MAC, no state, no partial packfiles, no leaked locks
    assert!(repo.list_snapshots().is_empty());
    assert!(repo.store().list_states()?.is_empty());
    assert!(repo.store().list_packfiles()?.is_empty());
    assert!(repo.store().list_locks()?.is_empty());
    Ok(())
}

#[test]
fn removed_snapshots_are_garbage_collected() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let repo = Arc::new(Repository::create(
        &env.registry,
        &env.location,
        &env.cache,
        None,
        true,
    )?);
    let result = run_backup(&env, &repo, &source);
    assert_eq!(repo.list_snapshots().len(), 1);

    remove_snapshots(&repo, &[result.snapshot])?;
    assert!(repo.list_snapshots().is_empty());

    let report = garbage_collect(&repo, &CancelToken::new(), &NullSink)?;
    assert!(report.blobs_tombstoned > 0);
    assert!(report.packfiles_deleted > 0);
    assert!(repo.store().list_packfiles()?.is_empty());
    Ok(())
}

#[test]
fn sync_copies_missing_snapshots() -> Result<(), Error> {
    let env = env();
    let source = env.dir.path().join("source");
    sample_tree(&source);

    let repo = Arc::new(Repository::create(
        &env.registry,
        &env.location,
        &env.cache,
        None,
        true,
    )?);
    let result = run_backup(&env, &repo, &source);

    let target_location = env.dir.path().join("mirror").to_string_lossy().to_string();
    let target = Arc::new(Repository::create(
        &env.registry,
        &target_location,
        &env.cache,
        None,
        true,
    )?);

    let synced = plakar_snapshot::sync(&repo, &target, &CancelToken::new(), 2)?;
    assert_eq!(synced.snapshots, 1);
    assert!(synced.blobs > 0);

    let mirrored = Snapshot::load(&target, result.snapshot)?;
    let mut content = String::new();
    mirrored
        .read_file("/another_subdir/bar.txt")?
        .read_to_string(&mut content)?;
    assert_eq!(content, "hello bar");
    Ok(())
}
