//! Agent server: accept loop and per-connection request handlers.
//!
//! Each connection is handshaked, decoded into a typed request, then the
//! subcommand executes on a blocking thread with virtual stdout/stderr
//! writers that frame every write back to the client. A background read on
//! the same socket detects disconnects and cancels the request's context;
//! the agent never exits on behalf of a client.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use plakar_repository::Repository;
use plakar_types::RepositoryError;

use crate::agent::protocol::{self, Packet, Request, PROTOCOL_VERSION};
use crate::commands;
use crate::context::AppContext;

/// Repository handles are opened once per `(location, secret)` pair and
/// kept for the life of the agent, so later requests skip the aggregate
/// rebuild entirely.
pub type RepositoryMap = Mutex<HashMap<(String, Option<String>), Arc<Repository>>>;

pub struct Agent {
    ctx: Arc<AppContext>,
    repositories: Arc<RepositoryMap>,
}

impl Agent {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            repositories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind the socket and serve until cancelled. Refuses to start when a
    /// live agent already answers on the socket.
    pub async fn serve(&self) -> Result<(), Error> {
        let path = super::socket_path(self.ctx.cache.base());
        std::fs::create_dir_all(self.ctx.cache.base())?;

        if path.exists() {
            match std::os::unix::net::UnixStream::connect(&path) {
                Ok(_) => {
                    return Err(RepositoryError::InUse(format!(
                        "agent already listening on {:?}",
                        path
                    ))
                    .into());
                }
                Err(_) => {
                    // stale socket from a dead agent
                    std::fs::remove_file(&path)?;
                }
            }
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("unable to bind agent socket {:?}", path))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        log::info!("agent listening on {:?}", path);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, _addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::warn!("accept failed on agent socket - {}", err);
                            continue;
                        }
                    };
                    let ctx = Arc::clone(&self.ctx);
                    let repositories = Arc::clone(&self.repositories);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(conn, ctx, repositories).await {
                            log::warn!("connection handler failed - {}", err);
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("agent shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}

async fn read_raw_frame(conn: &mut tokio::net::unix::OwnedReadHalf) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; 4];
    conn.read_exact(&mut header).await?;
    let length = u32::from_le_bytes(header);
    if length > protocol::frame_size_limit() {
        return Err(RepositoryError::Protocol(format!("oversized frame ({} bytes)", length)).into());
    }
    let mut body = vec![0u8; length as usize];
    conn.read_exact(&mut body).await?;
    Ok(body)
}

async fn handle_connection(
    conn: UnixStream,
    ctx: Arc<AppContext>,
    repositories: Arc<RepositoryMap>,
) -> Result<(), Error> {
    let (mut reader, mut writer) = conn.into_split();

    // version handshake: client first, then our own version
    let client_version: String = protocol::decode_body(&read_raw_frame(&mut reader).await?)?;
    writer
        .write_all(&protocol::encode_frame(&PROTOCOL_VERSION.to_string())?)
        .await?;
    if client_version.split('.').next() != PROTOCOL_VERSION.split('.').next() {
        return Err(RepositoryError::Protocol(format!(
            "incompatible client version {}",
            client_version
        ))
        .into());
    }

    let request: Request = protocol::decode_body(&read_raw_frame(&mut reader).await?)?;
    log::info!(
        "request: {} on {}",
        request.command.name(),
        request.store_location
    );

    // serialised packet writer; after the first encode failure every
    // further write is suppressed to avoid partial frames
    let (packet_tx, mut packet_rx) = mpsc::channel::<Packet>(256);
    let writer_task = tokio::spawn(async move {
        let mut broken = false;
        while let Some(packet) = packet_rx.recv().await {
            if broken {
                continue;
            }
            let frame = match protocol::encode_frame(&packet) {
                Ok(frame) => frame,
                Err(_) => {
                    broken = true;
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() {
                broken = true;
            }
        }
        let _ = writer.shutdown().await;
    });

    // per-request context with virtual writers and its own event bus
    let request_ctx = Arc::new(ctx.child(
        Box::new(PacketWriter::stdout(packet_tx.clone())),
        Box::new(PacketWriter::stderr(packet_tx.clone())),
        request.secret.clone(),
    ));

    // disconnect detection: EOF on the read half cancels the request
    let disconnect_cancel = request_ctx.cancel.clone();
    let disconnect_task = tokio::spawn(async move {
        let mut scratch = [0u8; 64];
        loop {
            match reader.read(&mut scratch).await {
                Ok(0) | Err(_) => {
                    disconnect_cancel.cancel();
                    break;
                }
                Ok(_) => {} // protocol has no client frames past the request
            }
        }
    });

    // event forwarding
    let event_rx = request_ctx.events.subscribe();
    let event_tx = packet_tx.clone();
    let event_task = tokio::task::spawn_blocking(move || {
        while let Ok(event) = event_rx.recv() {
            if event_tx.blocking_send(Packet::Event { event }).is_err() {
                break;
            }
        }
    });

    // execute the subcommand on a blocking thread
    let exec_ctx = Arc::clone(&request_ctx);
    let exec_request = request.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        commands::execute(&exec_ctx, &exec_request, Some(&*repositories))
    })
    .await;

    let (exit_code, err) = match outcome {
        Ok(Ok(code)) => (code, None),
        Ok(Err(err)) => (1, Some(format!("{:#}", err))),
        Err(join_err) => (1, Some(format!("command panicked - {}", join_err))),
    };

    // drain events before the exit packet
    request_ctx.events.close();
    let _ = event_task.await;
    disconnect_task.abort();

    let _ = packet_tx.send(Packet::Exit { exit_code, err }).await;
    // the virtual writers inside the request context hold packet senders;
    // the writer task only ends once every sender is gone
    drop(packet_tx);
    drop(request_ctx);
    let _ = writer_task.await;
    Ok(())
}

/// `Write` implementation framing every write as a stdout/stderr packet.
struct PacketWriter {
    tx: mpsc::Sender<Packet>,
    is_stderr: bool,
}

impl PacketWriter {
    fn stdout(tx: mpsc::Sender<Packet>) -> Self {
        Self {
            tx,
            is_stderr: false,
        }
    }

    fn stderr(tx: mpsc::Sender<Packet>) -> Self {
        Self {
            tx,
            is_stderr: true,
        }
    }
}

impl Write for PacketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let packet = if self.is_stderr {
            Packet::Stderr { data: buf.to_vec() }
        } else {
            Packet::Stdout { data: buf.to_vec() }
        };
        self.tx
            .blocking_send(packet)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Open (or reuse) the repository a request targets.
pub fn open_repository(
    ctx: &AppContext,
    location: &str,
    repositories: Option<&RepositoryMap>,
) -> Result<Arc<Repository>, Error> {
    if let Some(repositories) = repositories {
        let key = (location.to_string(), ctx.secret.clone());
        // the lock is held across the open: concurrent first requests
        // must not race each other into the repository cache
        let mut map = repositories.lock().unwrap();
        if let Some(repo) = map.get(&key) {
            return Ok(Arc::clone(repo));
        }
        let repo = Arc::new(Repository::open(
            &ctx.registry,
            location,
            &ctx.cache,
            &ctx.unlock(),
        )?);
        map.insert(key, Arc::clone(&repo));
        return Ok(repo);
    }

    Ok(Arc::new(Repository::open(
        &ctx.registry,
        location,
        &ctx.cache,
        &ctx.unlock(),
    )?))
}
