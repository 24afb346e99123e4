use std::io;
use std::num::NonZeroU64;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;

use log::debug;

use crate::connection::{self, Connection};
use crate::list::List;
use crate::protocol::{self, DecodeError, Header, Request, HEADER_SIZE};
use crate::seat::{SeatDevice, MAX_SEAT_DEVICES};

// A frame that cannot fit the incoming buffer can never be completed.
const MAX_REQUEST_BODY: usize = connection::BYTES_LEN - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(NonZeroU64);

impl ClientId {
    pub fn first() -> Self {
        Self(NonZeroU64::MIN)
    }

    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).unwrap())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected but not yet attached to a seat.
    New,
    /// Holds the seat.
    Active,
    /// Told to let go of the seat, ack outstanding.
    PendingDisable,
    /// Attached, but someone else drives the seat (or the VT is away).
    Disabled,
    /// Connection is going down; swept by the server.
    Closed,
}

pub struct Client {
    pub id: ClientId,
    pub conn: Connection,
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    /// Session id on the seat; the VT number for VT-bound seats. -1 until
    /// the client attaches.
    pub session: i32,
    pub state: ClientState,
    pub devices: List<SeatDevice>,
}

impl Client {
    pub fn new(id: ClientId, stream: UnixStream, pid: i32, uid: u32, gid: u32) -> Self {
        Self {
            id,
            conn: Connection::new(stream),
            pid,
            uid,
            gid,
            session: -1,
            state: ClientState::New,
            devices: List::with_capacity(MAX_SEAT_DEVICES),
        }
    }

    /// Extract the next complete request from the incoming buffer. Returns
    /// `Ok(None)` when a partial message is still in flight; the consumed
    /// header is restored so the next call can retry.
    pub fn next_request(&mut self) -> Result<Option<Request>, DecodeError> {
        if self.conn.pending() < HEADER_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_SIZE];
        self.conn.get(&mut raw).expect("header bytes were pending");
        let header = Header::decode(raw);

        if header.size as usize > MAX_REQUEST_BODY {
            return Err(DecodeError::SizeMismatch {
                opcode: header.opcode,
                size: header.size,
            });
        }
        if self.conn.pending() < header.size as usize {
            self.conn.restore(HEADER_SIZE);
            return Ok(None);
        }

        let mut body = vec![0u8; header.size as usize];
        self.conn.get(&mut body).expect("body bytes were pending");
        protocol::parse_request(header, &body).map(Some)
    }

    pub fn send_error(&mut self, errno: nix::errno::Errno) -> io::Result<()> {
        self.conn.put(&protocol::encode_error(errno as i32))
    }

    pub fn send_seat_opened(&mut self, name: &str) -> io::Result<()> {
        self.conn.put(&protocol::encode_seat_opened(name))
    }

    pub fn send_device_opened(&mut self, device_id: i32, fd: RawFd) -> io::Result<()> {
        self.conn.put(&protocol::encode_device_opened(device_id))?;
        self.conn.put_fd(fd)
    }

    pub fn send_enable_seat(&mut self) -> io::Result<()> {
        debug!("sending enable seat event");
        self.conn
            .put(&protocol::encode_empty(protocol::SERVER_ENABLE_SEAT))
    }

    pub fn send_disable_seat(&mut self) -> io::Result<()> {
        debug!("sending disable seat event");
        self.conn
            .put(&protocol::encode_empty(protocol::SERVER_DISABLE_SEAT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_client() -> (Client, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Client::new(ClientId::first(), ours, 0, 0, 0), theirs)
    }

    #[test]
    fn assembles_requests_across_partial_reads() {
        let (mut client, mut peer) = test_client();
        let frame = Request::SwitchSession { session: 2 }.encode();

        peer.write_all(&frame[..3]).unwrap();
        client.conn.read().unwrap();
        assert_eq!(client.next_request(), Ok(None));

        peer.write_all(&frame[3..6]).unwrap();
        client.conn.read().unwrap();
        // Full header but a short body: the header must be restored.
        assert_eq!(client.next_request(), Ok(None));
        assert_eq!(client.conn.pending(), 6);

        peer.write_all(&frame[6..]).unwrap();
        client.conn.read().unwrap();
        assert_eq!(
            client.next_request(),
            Ok(Some(Request::SwitchSession { session: 2 }))
        );
        assert_eq!(client.conn.pending(), 0);
    }

    #[test]
    fn consumes_pipelined_requests_in_order() {
        let (mut client, mut peer) = test_client();
        let mut bytes = Request::Ping.encode();
        bytes.extend_from_slice(&Request::CloseDevice { device_id: 1 }.encode());
        peer.write_all(&bytes).unwrap();
        client.conn.read().unwrap();

        assert_eq!(client.next_request(), Ok(Some(Request::Ping)));
        assert_eq!(
            client.next_request(),
            Ok(Some(Request::CloseDevice { device_id: 1 }))
        );
        assert_eq!(client.next_request(), Ok(None));
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let (mut client, mut peer) = test_client();
        let header = Header::new(protocol::CLIENT_OPEN_DEVICE, u16::MAX);
        peer.write_all(&header.encode()).unwrap();
        client.conn.read().unwrap();
        assert!(matches!(
            client.next_request(),
            Err(DecodeError::SizeMismatch { .. })
        ));
    }
}
