use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};

use plakar::agent::protocol::{
    read_frame, write_frame, CommandRequest, Packet, Request, PROTOCOL_VERSION,
};
use plakar::agent::server::Agent;
use plakar::context::AppContext;
use plakar_cache::CacheManager;
use plakar_repository::Repository;
use plakar_snapshot::{backup, BackupOptions, FsImporter};
use plakar_types::{CancelToken, EventSink, NullSink};

struct AgentEnv {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    location: String,
    snapshot: String,
}

/// Create a repository with one snapshot, then start an agent on a
/// scratch cache directory.
fn start_agent() -> Result<AgentEnv, Error> {
    let dir = tempfile::tempdir()?;
    let cache_base = dir.path().join("cache");
    let location = dir.path().join("repo").to_string_lossy().to_string();

    let source = dir.path().join("source");
    std::fs::create_dir_all(source.join("subdir"))?;
    std::fs::write(source.join("subdir/dummy.txt"), b"hello dummy")?;
    std::fs::write(source.join("top.txt"), b"top level")?;

    let snapshot = {
        let registry = plakar_store::StoreRegistry::default();
        let cache = CacheManager::new(&cache_base);
        let repo = Arc::new(Repository::create(&registry, &location, &cache, None, true)?);
        let importer = FsImporter::new(&source)?;
        let events: Arc<dyn EventSink> = Arc::new(NullSink);
        let result = backup(
            &repo,
            &importer,
            &CancelToken::new(),
            &events,
            &BackupOptions {
                concurrency: 2,
                ..Default::default()
            },
        )?;
        repo.close()?;
        result.snapshot.to_string()
    };

    let ctx = Arc::new(AppContext::new(Arc::new(CacheManager::new(&cache_base))));
    let socket = plakar::agent::socket_path(&cache_base);
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let _ = runtime.block_on(async { Agent::new(ctx).serve().await });
    });

    for _ in 0..100 {
        if socket.exists() && UnixStream::connect(&socket).is_ok() {
            return Ok(AgentEnv {
                dir,
                socket,
                location,
                snapshot,
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("agent did not come up");
}

/// Raw protocol exchange: handshake, request, pump packets to exit.
fn call(socket: &std::path::Path, request: &Request) -> Result<(i32, Vec<u8>), Error> {
    let mut conn = UnixStream::connect(socket)?;
    write_frame(&mut conn, &PROTOCOL_VERSION.to_string())?;
    let _server_version: String = read_frame(&mut conn)?;
    write_frame(&mut conn, request)?;

    let mut stdout = Vec::new();
    loop {
        match read_frame::<_, Packet>(&mut conn)? {
            Packet::Stdout { data } => stdout.extend_from_slice(&data),
            Packet::Stderr { data } => {
                std::io::stderr().write_all(&data)?;
            }
            Packet::Event { .. } => {}
            Packet::Exit { exit_code, .. } => return Ok((exit_code, stdout)),
        }
    }
}

#[test]
fn concurrent_clients_share_one_repository() -> Result<(), Error> {
    let env = start_agent()?;

    // socket must not be world-accessible
    let mode = std::fs::metadata(&env.socket)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    let request = Request {
        store_location: env.location.clone(),
        secret: None,
        command: CommandRequest::Ls {
            snapshot: env.snapshot.clone(),
            path: None,
            long: false,
        },
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let socket = env.socket.clone();
        let request = request.clone();
        handles.push(std::thread::spawn(move || call(&socket, &request)));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        let (code, stdout) = handle.join().unwrap()?;
        assert_eq!(code, 0);
        outputs.push(String::from_utf8(stdout)?);
    }
    // every client observed the same listing
    for output in &outputs {
        assert_eq!(output, &outputs[0]);
        assert!(output.contains("/subdir/dummy.txt"));
        assert!(output.contains("/top.txt"));
    }
    Ok(())
}

#[test]
fn cat_streams_exact_bytes() -> Result<(), Error> {
    let env = start_agent()?;
    let request = Request {
        store_location: env.location.clone(),
        secret: None,
        command: CommandRequest::Cat {
            snapshot: env.snapshot.clone(),
            path: "/subdir/dummy.txt".into(),
        },
    };
    let (code, stdout) = call(&env.socket, &request)?;
    assert_eq!(code, 0);
    assert_eq!(stdout, b"hello dummy");
    Ok(())
}

#[test]
fn failures_are_reported_not_fatal() -> Result<(), Error> {
    let env = start_agent()?;

    // bogus snapshot prefix: the request fails
    let request = Request {
        store_location: env.location.clone(),
        secret: None,
        command: CommandRequest::Ls {
            snapshot: "ffffffff".into(),
            path: None,
            long: false,
        },
    };
    let (code, _) = call(&env.socket, &request)?;
    assert_eq!(code, 1);

    // and the agent keeps serving
    let request = Request {
        store_location: env.location.clone(),
        secret: None,
        command: CommandRequest::Info { snapshot: None },
    };
    let (code, info) = call(&env.socket, &request)?;
    assert_eq!(code, 0);
    assert!(String::from_utf8(info)?.contains("Snapshots: 1"));
    Ok(())
}
