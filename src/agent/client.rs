//! Blocking client side of the agent protocol.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Error};

use crate::agent::protocol::{read_frame, write_frame, Packet, Request, PROTOCOL_VERSION};

/// Whether a live agent answers on the socket.
pub fn agent_available(socket: &Path) -> bool {
    socket.exists() && UnixStream::connect(socket).is_ok()
}

/// Run one request through the agent, pumping stdout/stderr/events until
/// the exit packet arrives. Returns the remote exit code.
pub fn run(socket: &Path, request: &Request) -> Result<i32, Error> {
    let mut conn = UnixStream::connect(socket)?;

    write_frame(&mut conn, &PROTOCOL_VERSION.to_string())?;
    let server_version: String = read_frame(&mut conn)?;
    if server_version.split('.').next() != PROTOCOL_VERSION.split('.').next() {
        bail!("agent speaks incompatible protocol version {}", server_version);
    }

    write_frame(&mut conn, request)?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    loop {
        let packet: Packet = read_frame(&mut conn)?;
        match packet {
            Packet::Stdout { data } => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            Packet::Stderr { data } => {
                stderr.write_all(&data)?;
                stderr.flush()?;
            }
            Packet::Event { event } => {
                log::debug!("event: {:?}", event);
            }
            Packet::Exit { exit_code, err } => {
                if let Some(err) = err {
                    eprintln!("plakar: {}", err);
                }
                return Ok(exit_code);
            }
        }
    }
}
