use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::SigId;

use crate::client::ClientId;
use crate::list::List;

pub const READABLE: u32 = 0x1;
pub const WRITABLE: u32 = 0x4;
pub const ERROR: u32 = 0x8;
pub const HANGUP: u32 = 0x10;

/// What a readiness event refers to. Fd sources carry the token they were
/// registered with; signal sources always yield `Token::Signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Listener,
    Client(ClientId),
    Signal(i32),
}

struct FdSource {
    fd: RawFd,
    mask: u32,
    token: Token,
}

struct SignalSource {
    signo: i32,
    raised: Arc<AtomicBool>,
    flag_id: SigId,
    pipe_id: SigId,
}

/// Single-threaded, level-triggered readiness loop over `poll(2)`.
///
/// Signal handlers stay trivial: they set the per-signal flag and write one
/// byte to the wake pipe. All real work happens after `poll` returns, and
/// multiple deliveries of the same signal coalesce into one event.
///
/// Sources added while a batch of events is being handled are queued and
/// spliced in before the next wait; removals mark the pollfd array dirty and
/// it is regenerated lazily.
pub struct Poller {
    sources: List<FdSource>,
    new_sources: List<FdSource>,
    signals: Vec<SignalSource>,
    pollfds: Vec<libc::pollfd>,
    dirty: bool,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // Non-blocking on both ends: the write happens inside a signal
        // handler and must never block.
        let (wake_read, wake_write) = pipe(libc::O_CLOEXEC | libc::O_NONBLOCK)?;
        Ok(Self {
            sources: List::new(),
            new_sources: List::new(),
            signals: Vec::new(),
            pollfds: Vec::new(),
            dirty: true,
            wake_read,
            wake_write,
        })
    }

    pub fn add_fd(&mut self, fd: RawFd, mask: u32, token: Token) {
        self.new_sources.push_back(FdSource { fd, mask, token });
        self.dirty = true;
    }

    pub fn update_fd(&mut self, fd: RawFd, mask: u32) {
        if let Some(source) = self
            .sources
            .iter_mut()
            .chain(self.new_sources.iter_mut())
            .find(|s| s.fd == fd)
        {
            if source.mask != mask {
                source.mask = mask;
                self.dirty = true;
            }
        }
    }

    pub fn remove_fd(&mut self, fd: RawFd) {
        self.sources.retain(|s| s.fd != fd);
        self.new_sources.retain(|s| s.fd != fd);
        self.dirty = true;
    }

    /// Attach to a signal. Repeated registrations of the same signal share
    /// one process-level handler; handlers live until the poller is dropped.
    pub fn add_signal(&mut self, signo: i32) -> io::Result<()> {
        if self.signals.iter().any(|s| s.signo == signo) {
            return Ok(());
        }
        let raised = Arc::new(AtomicBool::new(false));
        let flag_id = signal_hook::flag::register(signo, raised.clone())?;
        let pipe_id = signal_hook::low_level::pipe::register(signo, self.wake_write.as_raw_fd())?;
        self.signals.push(SignalSource {
            signo,
            raised,
            flag_id,
            pipe_id,
        });
        Ok(())
    }

    /// Block until at least one source is ready, then return every ready fd
    /// event plus one event per signal that fired since the last wait.
    pub fn poll(&mut self) -> io::Result<Vec<(Token, u32)>> {
        self.sources.take_from(&mut self.new_sources);
        if self.dirty {
            self.regenerate();
        }

        let ret = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                -1,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }

        let mut events = Vec::new();
        if ret > 0 {
            if self.pollfds[0].revents != 0 {
                self.drain_wake_pipe();
            }
            for (idx, source) in self.sources.iter().enumerate() {
                let revents = self.pollfds[idx + 1].revents;
                if revents != 0 {
                    events.push((source.token, poll_to_event_mask(revents)));
                }
            }
            for pfd in self.pollfds.iter_mut() {
                pfd.revents = 0;
            }
        }

        // Check the flags even after EINTR: the interruption is likely the
        // signal we are interested in.
        for source in &self.signals {
            if source.raised.swap(false, Ordering::SeqCst) {
                events.push((Token::Signal(source.signo), 0));
            }
        }

        Ok(events)
    }

    fn regenerate(&mut self) {
        self.pollfds.clear();
        self.pollfds.push(libc::pollfd {
            fd: self.wake_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for source in self.sources.iter() {
            self.pollfds.push(libc::pollfd {
                fd: source.fd,
                events: event_to_poll_mask(source.mask),
                revents: 0,
            });
        }
        self.dirty = false;
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n <= 0 {
                return;
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        for source in self.signals.drain(..) {
            signal_hook::low_level::unregister(source.flag_id);
            signal_hook::low_level::unregister(source.pipe_id);
        }
    }
}

pub fn pipe(flags: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0, 0];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn event_to_poll_mask(mask: u32) -> libc::c_short {
    let mut poll_mask = 0;
    if mask & READABLE != 0 {
        poll_mask |= libc::POLLIN;
    }
    if mask & WRITABLE != 0 {
        poll_mask |= libc::POLLOUT;
    }
    poll_mask
}

fn poll_to_event_mask(poll_mask: libc::c_short) -> u32 {
    let mut mask = 0;
    if poll_mask & libc::POLLIN != 0 {
        mask |= READABLE;
    }
    if poll_mask & libc::POLLOUT != 0 {
        mask |= WRITABLE;
    }
    if poll_mask & libc::POLLERR != 0 {
        mask |= ERROR;
    }
    if poll_mask & libc::POLLHUP != 0 {
        mask |= HANGUP;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn reports_readable_fd() {
        let mut poller = Poller::new().unwrap();
        let (r, w) = pipe(libc::O_CLOEXEC).unwrap();
        poller.add_fd(r.as_raw_fd(), READABLE, Token::Listener);

        File::from(w).write_all(&[1]).unwrap();
        let events = poller.poll().unwrap();
        assert!(events
            .iter()
            .any(|&(token, mask)| token == Token::Listener && mask & READABLE != 0));
    }

    #[test]
    fn removed_fd_is_not_reported() {
        let mut poller = Poller::new().unwrap();
        let (r1, w1) = pipe(libc::O_CLOEXEC).unwrap();
        let (r2, w2) = pipe(libc::O_CLOEXEC).unwrap();
        let first = ClientId::first();
        poller.add_fd(r1.as_raw_fd(), READABLE, Token::Client(first));
        poller.add_fd(r2.as_raw_fd(), READABLE, Token::Client(first.next()));
        poller.remove_fd(r1.as_raw_fd());

        File::from(w1).write_all(&[1]).unwrap();
        File::from(w2).write_all(&[1]).unwrap();
        let events = poller.poll().unwrap();
        assert!(events
            .iter()
            .all(|&(token, _)| token != Token::Client(first)));
        assert!(events
            .iter()
            .any(|&(token, _)| token == Token::Client(first.next())));
    }

    #[test]
    fn reports_coalesced_signal() {
        let mut poller = Poller::new().unwrap();
        poller.add_signal(libc::SIGUSR2).unwrap();

        unsafe {
            libc::raise(libc::SIGUSR2);
            libc::raise(libc::SIGUSR2);
        }
        let events = poller.poll().unwrap();
        let fired = events
            .iter()
            .filter(|&&(token, _)| token == Token::Signal(libc::SIGUSR2))
            .count();
        assert_eq!(fired, 1);
    }
}
