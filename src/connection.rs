use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};

pub const BYTES_LEN: usize = 4096;
pub const FDS_LEN: usize = 16;

/// Buffered message transport over a Unix stream socket.
///
/// Bytes are staged in fixed-size rings and flushed with `sendmsg`; file
/// descriptors ride as `SCM_RIGHTS` ancillary data on the same flush. Queued
/// outgoing fds are borrowed from the caller, which keeps ownership across
/// the flush (device fds must stay open in the daemon after being sent).
pub struct Connection {
    socket: UnixStream,
    bytes_in: RingBuffer<BYTES_LEN>,
    bytes_out: RingBuffer<BYTES_LEN>,
    fds_in: VecDeque<OwnedFd>,
    fds_out: Vec<RawFd>,
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Connection {
    pub fn new(socket: UnixStream) -> Self {
        Self {
            socket,
            bytes_in: RingBuffer::new(),
            bytes_out: RingBuffer::new(),
            fds_in: VecDeque::new(),
            fds_out: Vec::with_capacity(FDS_LEN),
        }
    }

    /// Append bytes to the outgoing buffer without touching the socket.
    pub fn put(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > self.bytes_out.writable_len() {
            return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
        }
        self.bytes_out.write_bytes(data);
        Ok(())
    }

    /// Queue a file descriptor for the next flush. The caller keeps
    /// ownership; the fd must stay valid until the flush happens.
    pub fn put_fd(&mut self, fd: RawFd) -> io::Result<()> {
        if self.fds_out.len() >= FDS_LEN {
            return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
        }
        self.fds_out.push(fd);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.bytes_in.readable_len()
    }

    pub fn has_pending_out(&self) -> bool {
        !self.bytes_out.is_empty()
    }

    /// Dequeue bytes received earlier with [`Connection::read`]. Fails if
    /// fewer than `buf.len()` bytes are buffered.
    pub fn get(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if buf.len() > self.bytes_in.readable_len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.bytes_in.read_bytes(buf);
        Ok(())
    }

    pub fn get_fd(&mut self) -> Option<OwnedFd> {
        self.fds_in.pop_front()
    }

    /// Rewind `len` bytes back into the incoming buffer, undoing a `get`.
    /// Used to peek a header and wait for the rest of the message.
    pub fn restore(&mut self, len: usize) {
        self.bytes_in.unread(len);
    }

    /// Send buffered bytes and fds. A partial write leaves the remainder
    /// queued; a send that would block surfaces as `WouldBlock`.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.bytes_out.is_empty() {
            return Ok(());
        }

        let flags = MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT;

        let b;
        let cmsgs: &[ControlMessage] = match self.fds_out.as_slice() {
            [] => &[],
            fds => {
                b = [ControlMessage::ScmRights(fds)];
                &b
            }
        };

        let mut iov_buf = [IoSlice::new(&[]), IoSlice::new(&[])];
        let iov = self.bytes_out.readable_iov(&mut iov_buf);
        let sent = socket::sendmsg::<()>(self.socket.as_raw_fd(), iov, cmsgs, flags, None)
            .map_err(io::Error::from)?;

        // Ancillary data is attached to the first byte of the message, so
        // once anything went out the fds went with it.
        self.fds_out.clear();
        self.bytes_out.consume(sent);

        Ok(())
    }

    /// Pull bytes and ancillary fds from the socket into the incoming
    /// buffers. Returns the number of new bytes; zero means the peer hung
    /// up.
    pub fn read(&mut self) -> io::Result<usize> {
        let read;
        {
            let mut cmsg = nix::cmsg_space!([RawFd; FDS_LEN]);
            let flags = MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT;

            let mut iov_buf = [IoSliceMut::new(&mut []), IoSliceMut::new(&mut [])];
            let iov = self.bytes_in.writable_iov(&mut iov_buf);
            let msg = socket::recvmsg::<()>(self.socket.as_raw_fd(), iov, Some(&mut cmsg), flags)
                .map_err(io::Error::from)?;

            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for fd in fds {
                        self.fds_in.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }

            read = msg.bytes;
        }
        self.bytes_in.produce(read);
        Ok(read)
    }

    pub fn shutdown_write(&self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Write);
    }
}

/// Fixed-capacity byte ring. The read and write positions count bytes over
/// the lifetime of the buffer and only their `% N` image indexes the array;
/// their difference is the fill level, so full and empty need no extra flag.
struct RingBuffer<const N: usize> {
    buf: Box<[u8; N]>,
    rd: usize,
    wr: usize,
}

impl<const N: usize> RingBuffer<N> {
    fn new() -> Self {
        Self {
            buf: Box::new([0; N]),
            rd: 0,
            wr: 0,
        }
    }

    fn readable_len(&self) -> usize {
        self.wr - self.rd
    }

    fn writable_len(&self) -> usize {
        N - self.readable_len()
    }

    fn is_empty(&self) -> bool {
        self.rd == self.wr
    }

    /// Account for `n` bytes the socket layer stored at the write position.
    fn produce(&mut self, n: usize) {
        self.wr += n;
        debug_assert!(self.readable_len() <= N);
    }

    /// Discard `n` bytes at the read position.
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.readable_len());
        self.rd += n;
    }

    /// Step the read position back over bytes consumed too early. Only valid
    /// directly after the consume that is being undone.
    fn unread(&mut self, n: usize) {
        debug_assert!(n <= self.rd);
        self.rd -= n;
        debug_assert!(self.readable_len() <= N);
    }

    fn write_bytes(&mut self, data: &[u8]) {
        assert!(data.len() <= self.writable_len());
        let at = self.wr % N;
        let until_end = data.len().min(N - at);
        self.buf[at..at + until_end].copy_from_slice(&data[..until_end]);
        self.buf[..data.len() - until_end].copy_from_slice(&data[until_end..]);
        self.wr += data.len();
    }

    fn peek_bytes(&self, out: &mut [u8]) {
        assert!(out.len() <= self.readable_len());
        let at = self.rd % N;
        let until_end = out.len().min(N - at);
        let out_len = out.len();
        let (out_head, out_tail) = out.split_at_mut(until_end);
        out_head.copy_from_slice(&self.buf[at..at + until_end]);
        out_tail.copy_from_slice(&self.buf[..out_len - until_end]);
    }

    fn read_bytes(&mut self, out: &mut [u8]) {
        self.peek_bytes(out);
        self.consume(out.len());
    }

    /// The occupied region as one or two iovec entries, depending on whether
    /// it crosses the end of the array.
    fn readable_iov<'b, 'a: 'b>(&'a self, iov_buf: &'b mut [IoSlice<'a>; 2]) -> &'b [IoSlice<'a>] {
        let at = self.rd % N;
        let end = at + self.readable_len();
        if end <= N {
            iov_buf[0] = IoSlice::new(&self.buf[at..end]);
            &iov_buf[..1]
        } else {
            let (wrapped, tail) = self.buf.split_at(at);
            iov_buf[0] = IoSlice::new(tail);
            iov_buf[1] = IoSlice::new(&wrapped[..end - N]);
            &iov_buf[..2]
        }
    }

    /// The free region as one or two iovec entries.
    fn writable_iov<'b, 'a: 'b>(
        &'a mut self,
        iov_buf: &'b mut [IoSliceMut<'a>; 2],
    ) -> &'b mut [IoSliceMut<'a>] {
        let at = self.wr % N;
        let end = at + self.writable_len();
        if end <= N {
            iov_buf[0] = IoSliceMut::new(&mut self.buf[at..end]);
            &mut iov_buf[..1]
        } else {
            let (wrapped, tail) = self.buf.split_at_mut(at);
            iov_buf[0] = IoSliceMut::new(tail);
            iov_buf[1] = IoSliceMut::new(&mut wrapped[..end - N]);
            &mut iov_buf[..2]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a), Connection::new(b))
    }

    #[test]
    fn put_flush_read_get() {
        let (mut tx, mut rx) = pair();
        tx.put(b"hello").unwrap();
        assert!(tx.has_pending_out());
        tx.flush().unwrap();
        assert!(!tx.has_pending_out());

        assert_eq!(rx.read().unwrap(), 5);
        assert_eq!(rx.pending(), 5);
        let mut buf = [0u8; 5];
        rx.get(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(rx.pending(), 0);
    }

    #[test]
    fn get_beyond_pending_fails() {
        let (mut tx, mut rx) = pair();
        tx.put(b"ab").unwrap();
        tx.flush().unwrap();
        rx.read().unwrap();
        let mut buf = [0u8; 4];
        assert!(rx.get(&mut buf).is_err());
    }

    #[test]
    fn restore_rewinds_consumed_bytes() {
        let (mut tx, mut rx) = pair();
        tx.put(b"abcd").unwrap();
        tx.flush().unwrap();
        rx.read().unwrap();

        let mut head = [0u8; 2];
        rx.get(&mut head).unwrap();
        assert_eq!(&head, b"ab");
        rx.restore(2);
        assert_eq!(rx.pending(), 4);
        let mut all = [0u8; 4];
        rx.get(&mut all).unwrap();
        assert_eq!(&all, b"abcd");
    }

    #[test]
    fn transfers_across_the_buffer_seam() {
        let (mut tx, mut rx) = pair();

        // Walk both rings close to the end of their arrays.
        let filler = vec![7u8; BYTES_LEN - 10];
        tx.put(&filler).unwrap();
        tx.flush().unwrap();
        while rx.pending() < filler.len() {
            rx.read().unwrap();
        }
        let mut sink = vec![0u8; filler.len()];
        rx.get(&mut sink).unwrap();
        assert_eq!(sink, filler);

        // This message straddles the seam on both sides.
        let msg: Vec<u8> = (0u8..100).collect();
        tx.put(&msg).unwrap();
        tx.flush().unwrap();
        while rx.pending() < msg.len() {
            rx.read().unwrap();
        }

        // Peek-and-restore across the seam, then consume it all.
        let mut head = [0u8; 4];
        rx.get(&mut head).unwrap();
        rx.restore(head.len());
        let mut out = vec![0u8; msg.len()];
        rx.get(&mut out).unwrap();
        assert_eq!(out, msg);
        assert_eq!(rx.pending(), 0);
    }

    #[test]
    fn put_overflow_is_rejected() {
        let (mut tx, _rx) = pair();
        let big = vec![0u8; BYTES_LEN + 1];
        assert!(tx.put(&big).is_err());
        // A fitting write still succeeds afterwards.
        tx.put(&big[..BYTES_LEN]).unwrap();
        assert!(tx.put(&[0]).is_err());
    }

    #[test]
    fn passes_file_descriptors() {
        let (mut tx, mut rx) = pair();
        let (pipe_r, pipe_w) = crate::poller::pipe(libc::O_CLOEXEC).unwrap();

        tx.put(b"x").unwrap();
        tx.put_fd(pipe_w.as_raw_fd()).unwrap();
        tx.flush().unwrap();

        rx.read().unwrap();
        let mut byte = [0u8; 1];
        rx.get(&mut byte).unwrap();
        let fd = rx.get_fd().expect("expected an ancillary fd");

        // Writing through the received fd must land in the original pipe.
        File::from(fd).write_all(b"hi").unwrap();
        drop(pipe_w);
        let mut out = [0u8; 2];
        File::from(pipe_r).read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn read_reports_hangup() {
        let (tx, mut rx) = pair();
        drop(tx);
        assert_eq!(rx.read().unwrap(), 0);
    }
}
