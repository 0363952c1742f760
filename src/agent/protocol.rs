//! Agent wire protocol.
//!
//! Unix stream socket, length-prefixed MessagePack frames. Sequence:
//! client sends its version string, server replies with its own, client
//! sends one [`Request`], server streams [`Packet`]s ending with
//! `Packet::Exit`.

use std::io::{Read, Write};

use anyhow::{format_err, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use plakar_types::{Event, RepositoryError};

/// Bumped on incompatible protocol changes; exchanged in the handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub store_location: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub secret: Option<String>,
    pub command: CommandRequest,
}

/// Tagged union of subcommand parameter structs; the wire `name` selects
/// the variant. Unknown names fail decoding and surface as protocol
/// errors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum CommandRequest {
    Backup {
        path: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    Check {
        #[serde(default)]
        snapshot: Option<String>,
        #[serde(default)]
        fast: bool,
    },
    Ls {
        snapshot: String,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        long: bool,
    },
    Cat {
        snapshot: String,
        path: String,
    },
    Restore {
        snapshot: String,
        #[serde(default)]
        path: Option<String>,
        to: String,
    },
    Rm {
        snapshots: Vec<String>,
    },
    Info {
        #[serde(default)]
        snapshot: Option<String>,
    },
    Locate {
        pattern: String,
    },
    Checksum {
        snapshot: String,
        paths: Vec<String>,
        #[serde(default)]
        fast: bool,
    },
    Digest {
        snapshot: String,
        paths: Vec<String>,
    },
    Diff {
        old: String,
        new: String,
    },
    Sync {
        peer: String,
        #[serde(default)]
        peer_secret: Option<String>,
    },
    Clone {
        target: String,
    },
    Maintenance {},
}

impl CommandRequest {
    pub fn name(&self) -> &'static str {
        match self {
            CommandRequest::Backup { .. } => "backup",
            CommandRequest::Check { .. } => "check",
            CommandRequest::Ls { .. } => "ls",
            CommandRequest::Cat { .. } => "cat",
            CommandRequest::Restore { .. } => "restore",
            CommandRequest::Rm { .. } => "rm",
            CommandRequest::Info { .. } => "info",
            CommandRequest::Locate { .. } => "locate",
            CommandRequest::Checksum { .. } => "checksum",
            CommandRequest::Digest { .. } => "digest",
            CommandRequest::Diff { .. } => "diff",
            CommandRequest::Sync { .. } => "sync",
            CommandRequest::Clone { .. } => "clone",
            CommandRequest::Maintenance {} => "maintenance",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Stdout {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Stderr {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Event {
        event: Event,
    },
    Exit {
        exit_code: i32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        err: Option<String>,
    },
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let body = rmp_serde::to_vec_named(value)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    rmp_serde::from_slice(body)
        .map_err(|err| RepositoryError::Protocol(format!("malformed frame - {}", err)).into())
}

/// Blocking frame I/O for the client side.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), Error> {
    let frame = encode_frame(value)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, Error> {
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .map_err(|err| format_err!("connection closed - {}", err))?;
    let length = u32::from_le_bytes(header);
    if length > MAX_FRAME_SIZE {
        return Err(RepositoryError::Protocol(format!("oversized frame ({} bytes)", length)).into());
    }
    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body)?;
    decode_body(&body)
}

pub fn frame_size_limit() -> u32 {
    MAX_FRAME_SIZE
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() -> Result<(), Error> {
        let request = Request {
            store_location: "/tmp/repo".into(),
            secret: None,
            command: CommandRequest::Ls {
                snapshot: "abcd".into(),
                path: None,
                long: true,
            },
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request)?;
        let parsed: Request = read_frame(&mut &buffer[..])?;
        assert_eq!(parsed.store_location, "/tmp/repo");
        assert!(matches!(parsed.command, CommandRequest::Ls { long: true, .. }));
        Ok(())
    }

    #[test]
    fn unknown_command_is_a_protocol_error() {
        // a frame carrying an unknown command name must not decode
        let body = rmp_serde::to_vec_named(&serde_json::json!({
            "store_location": "/tmp/repo",
            "command": {"name": "frobnicate"}
        }))
        .unwrap();
        let err = decode_body::<Request>(&body).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepositoryError>(),
            Some(RepositoryError::Protocol(_))
        ));
    }

    #[test]
    fn binary_payload_survives() -> Result<(), Error> {
        let packet = Packet::Stdout {
            data: vec![0, 159, 146, 150, 255],
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &packet)?;
        let parsed: Packet = read_frame(&mut &buffer[..])?;
        let Packet::Stdout { data } = parsed else {
            panic!("wrong packet type");
        };
        assert_eq!(data, vec![0, 159, 146, 150, 255]);
        Ok(())
    }
}
