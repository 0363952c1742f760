//! Agent lifecycle: start (daemonise), stop, restart.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Error};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::agent::server::Agent;
use crate::context::AppContext;

/// Internal marker: set in the child so the re-executed binary knows it
/// is the daemon and must run the server loop directly.
pub const REEXEC_ENV: &str = "REEXEC";

/// Start the agent. Without `foreground` the process fork-execs itself
/// with `REEXEC=1`, detaches stdio and returns immediately.
pub fn start(ctx: Arc<AppContext>, foreground: bool) -> Result<i32, Error> {
    let socket = super::socket_path(ctx.cache.base());
    if crate::agent::client::agent_available(&socket) {
        bail!("agent already running on {:?}", socket);
    }

    if !foreground && std::env::var(REEXEC_ENV).is_err() {
        let exe = std::env::current_exe().context("unable to locate own binary")?;
        let child = std::process::Command::new(exe)
            .args(["agent", "start"])
            .env(REEXEC_ENV, "1")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("unable to daemonise agent")?;
        println!("agent started (pid {})", child.id());
        return Ok(0);
    }

    // daemon child (or foreground run): own session, pidfile, serve
    if std::env::var(REEXEC_ENV).is_ok() {
        let _ = nix::unistd::setsid();
    }
    std::fs::create_dir_all(ctx.cache.base())?;
    let pidfile = super::pidfile_path(ctx.cache.base());
    std::fs::write(&pidfile, std::process::id().to_string())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async { Agent::new(ctx).serve().await });

    let _ = std::fs::remove_file(&pidfile);
    result.map(|_| 0)
}

/// Signal the daemonised agent to terminate.
pub fn stop(cache_base: &Path) -> Result<i32, Error> {
    let pidfile = super::pidfile_path(cache_base);
    let raw = match std::fs::read_to_string(&pidfile) {
        Ok(raw) => raw,
        Err(_) => bail!("no agent appears to be running (no pidfile)"),
    };
    let pid: i32 = raw.trim().parse().context("corrupt pidfile")?;

    kill(Pid::from_raw(pid), Signal::SIGINT)
        .with_context(|| format!("unable to signal agent (pid {})", pid))?;
    let _ = std::fs::remove_file(&pidfile);
    let _ = std::fs::remove_file(super::socket_path(cache_base));
    println!("agent stopped (pid {})", pid);
    Ok(0)
}

/// Stop the running agent and start a fresh one from the current binary.
pub fn restart(ctx: Arc<AppContext>) -> Result<i32, Error> {
    let _ = stop(ctx.cache.base());
    // give the old process a moment to release the socket
    std::thread::sleep(std::time::Duration::from_millis(200));
    start(ctx, false)
}
