//! The client wire protocol: little-endian, length-prefixed messages over a
//! Unix stream socket. Every message starts with a fixed header; device fds
//! travel as ancillary data on `DEVICE_OPENED` responses.

use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use thiserror::Error;

pub const MAX_SEAT_LEN: usize = 16;
pub const MAX_PATH_LEN: usize = 256;

pub const HEADER_SIZE: usize = 4;

// Requests (client -> server).
pub const CLIENT_OPEN_SEAT: u16 = 1;
pub const CLIENT_CLOSE_SEAT: u16 = 2;
pub const CLIENT_OPEN_DEVICE: u16 = 3;
pub const CLIENT_CLOSE_DEVICE: u16 = 4;
pub const CLIENT_SWITCH_SESSION: u16 = 5;
pub const CLIENT_DISABLE_SEAT: u16 = 6;
pub const CLIENT_PING: u16 = 7;

// Responses and events (server -> client).
pub const SERVER_ERROR: u16 = 1;
pub const SERVER_SEAT_OPENED: u16 = 2;
pub const SERVER_SEAT_CLOSED: u16 = 3;
pub const SERVER_DEVICE_OPENED: u16 = 4;
pub const SERVER_DEVICE_CLOSED: u16 = 5;
pub const SERVER_SESSION_SWITCHED: u16 = 6;
pub const SERVER_SEAT_DISABLED: u16 = 7;
pub const SERVER_PONG: u16 = 8;
pub const SERVER_DISABLE_SEAT: u16 = 9;
pub const SERVER_ENABLE_SEAT: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u16,
    pub size: u16,
}

impl Header {
    pub fn new(opcode: u16, size: u16) -> Self {
        Self { opcode, size }
    }

    pub fn encode(self) -> [u8; HEADER_SIZE] {
        let opcode = self.opcode.to_le_bytes();
        let size = self.size.to_le_bytes();
        [opcode[0], opcode[1], size[0], size[1]]
    }

    pub fn decode(raw: [u8; HEADER_SIZE]) -> Self {
        Self {
            opcode: u16::from_le_bytes([raw[0], raw[1]]),
            size: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("size {size} does not match opcode {opcode}")]
    SizeMismatch { opcode: u16, size: u16 },
    #[error("device path is not a well-formed null-terminated string")]
    MalformedPath,
    #[error("device path of {0} bytes exceeds the path limit")]
    PathTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    OpenSeat,
    CloseSeat,
    OpenDevice { path: PathBuf },
    CloseDevice { device_id: i32 },
    SwitchSession { session: i32 },
    DisableSeat,
    Ping,
}

impl Request {
    /// Encode the request as a complete frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::OpenSeat => Header::new(CLIENT_OPEN_SEAT, 0).encode().to_vec(),
            Request::CloseSeat => Header::new(CLIENT_CLOSE_SEAT, 0).encode().to_vec(),
            Request::DisableSeat => Header::new(CLIENT_DISABLE_SEAT, 0).encode().to_vec(),
            Request::Ping => Header::new(CLIENT_PING, 0).encode().to_vec(),
            Request::CloseDevice { device_id } => {
                let mut frame = Header::new(CLIENT_CLOSE_DEVICE, 4).encode().to_vec();
                frame.extend_from_slice(&device_id.to_le_bytes());
                frame
            }
            Request::SwitchSession { session } => {
                let mut frame = Header::new(CLIENT_SWITCH_SESSION, 4).encode().to_vec();
                frame.extend_from_slice(&session.to_le_bytes());
                frame
            }
            Request::OpenDevice { path } => {
                let bytes = path.as_os_str().as_bytes();
                let path_len = (bytes.len() + 1) as u16;
                let mut frame = Header::new(CLIENT_OPEN_DEVICE, 2 + path_len).encode().to_vec();
                frame.extend_from_slice(&path_len.to_le_bytes());
                frame.extend_from_slice(bytes);
                frame.push(0);
                frame
            }
        }
    }
}

/// Parse a request body. `body` must hold exactly `header.size` bytes.
pub fn parse_request(header: Header, body: &[u8]) -> Result<Request, DecodeError> {
    debug_assert_eq!(body.len(), header.size as usize);
    let mismatch = || DecodeError::SizeMismatch {
        opcode: header.opcode,
        size: header.size,
    };
    match header.opcode {
        CLIENT_OPEN_SEAT if body.is_empty() => Ok(Request::OpenSeat),
        CLIENT_CLOSE_SEAT if body.is_empty() => Ok(Request::CloseSeat),
        CLIENT_DISABLE_SEAT if body.is_empty() => Ok(Request::DisableSeat),
        CLIENT_PING if body.is_empty() => Ok(Request::Ping),
        CLIENT_OPEN_SEAT | CLIENT_CLOSE_SEAT | CLIENT_DISABLE_SEAT | CLIENT_PING => {
            Err(mismatch())
        }
        CLIENT_CLOSE_DEVICE => {
            let raw: [u8; 4] = body.try_into().map_err(|_| mismatch())?;
            Ok(Request::CloseDevice {
                device_id: i32::from_le_bytes(raw),
            })
        }
        CLIENT_SWITCH_SESSION => {
            let raw: [u8; 4] = body.try_into().map_err(|_| mismatch())?;
            Ok(Request::SwitchSession {
                session: i32::from_le_bytes(raw),
            })
        }
        CLIENT_OPEN_DEVICE => {
            if body.len() < 2 {
                return Err(mismatch());
            }
            let path_len = u16::from_le_bytes([body[0], body[1]]) as usize;
            if body.len() - 2 != path_len {
                return Err(mismatch());
            }
            if path_len > MAX_PATH_LEN {
                return Err(DecodeError::PathTooLong(path_len));
            }
            let raw = &body[2..];
            match raw.split_last() {
                Some((0, bytes)) if !bytes.contains(&0) => Ok(Request::OpenDevice {
                    path: PathBuf::from(std::ffi::OsString::from_vec(bytes.to_vec())),
                }),
                _ => Err(DecodeError::MalformedPath),
            }
        }
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

pub fn encode_empty(opcode: u16) -> [u8; HEADER_SIZE] {
    Header::new(opcode, 0).encode()
}

pub fn encode_error(errno: i32) -> [u8; HEADER_SIZE + 4] {
    let header = Header::new(SERVER_ERROR, 4).encode();
    let errno = errno.to_le_bytes();
    [
        header[0], header[1], header[2], header[3], errno[0], errno[1], errno[2], errno[3],
    ]
}

pub fn encode_device_opened(device_id: i32) -> [u8; HEADER_SIZE + 4] {
    let header = Header::new(SERVER_DEVICE_OPENED, 4).encode();
    let id = device_id.to_le_bytes();
    [
        header[0], header[1], header[2], header[3], id[0], id[1], id[2], id[3],
    ]
}

pub fn encode_seat_opened(name: &str) -> Vec<u8> {
    let name_len = name.len() + 1;
    assert!(name_len <= MAX_SEAT_LEN);
    let mut frame = Header::new(SERVER_SEAT_OPENED, (2 + name_len) as u16)
        .encode()
        .to_vec();
    frame.extend_from_slice(&(name_len as u16).to_le_bytes());
    frame.extend_from_slice(name.as_bytes());
    frame.push(0);
    frame
}
