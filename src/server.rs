use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::unistd::{chown, Gid, Uid};

use crate::client::{Client, ClientId, ClientState};
use crate::poller::{Poller, Token, ERROR, HANGUP, READABLE, WRITABLE};
use crate::protocol::{self, DecodeError, Request};
use crate::seat::{ClientMap, Seat, SwitchOutcome};

pub struct Server {
    poller: Poller,
    socket: UnixListener,
    socket_path: PathBuf,
    seat: Seat,
    clients: ClientMap,
    next_client_id: ClientId,
    running: bool,
}

impl Server {
    /// Bind the listening socket with the requested ownership, wire up the
    /// VT and shutdown signals, and create the single seat.
    pub fn new(
        socket_path: PathBuf,
        owner_uid: Option<Uid>,
        owner_gid: Option<Gid>,
        vt_bound: bool,
    ) -> io::Result<Self> {
        if socket_path.exists() {
            debug!("removing stale socket file");
            let _ = fs::remove_file(&socket_path);
        }
        let socket = UnixListener::bind(&socket_path)?;
        socket.set_nonblocking(true)?;
        if owner_uid.is_some() || owner_gid.is_some() {
            chown(&socket_path, owner_uid, owner_gid).map_err(io::Error::from)?;
        }
        // Access is by group membership; the socket is not world-readable.
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o770))?;

        let mut poller = Poller::new()?;
        poller.add_fd(socket.as_raw_fd(), READABLE, Token::Listener);
        for signo in [libc::SIGUSR1, libc::SIGUSR2, libc::SIGINT, libc::SIGTERM] {
            poller.add_signal(signo)?;
        }

        Ok(Self {
            poller,
            socket,
            socket_path,
            seat: Seat::new("seat0", vt_bound),
            clients: HashMap::new(),
            next_client_id: ClientId::first(),
            running: true,
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        while self.running {
            let events = self.poller.poll()?;
            for (token, mask) in events {
                match token {
                    Token::Listener => self.handle_listener(mask),
                    Token::Client(id) => self.handle_client(id, mask),
                    Token::Signal(signo) => self.handle_signal(signo),
                }
            }
            self.flush_clients();
            self.sweep_closed();
        }
        self.shutdown();
        Ok(())
    }

    fn handle_listener(&mut self, mask: u32) {
        if mask & (ERROR | HANGUP) != 0 {
            error!("listening socket failed");
            self.running = false;
            return;
        }
        loop {
            match self.socket.accept() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!("could not accept client connection: {err}");
                    return;
                }
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        error!("could not prepare new client socket: {err}");
                        continue;
                    }
                    let creds = match peer_credentials(stream.as_raw_fd()) {
                        Ok(creds) => creds,
                        Err(err) => {
                            error!("could not read peer credentials: {err}");
                            continue;
                        }
                    };
                    let id = self.next_client_id;
                    self.next_client_id = id.next();
                    let client = Client::new(id, stream, creds.pid, creds.uid, creds.gid);
                    self.poller
                        .add_fd(client.conn.as_raw_fd(), READABLE, Token::Client(id));
                    info!(
                        "new client connected (pid: {}, uid: {}, gid: {})",
                        client.pid, client.uid, client.gid
                    );
                    self.clients.insert(id, client);
                }
            }
        }
    }

    fn handle_signal(&mut self, signo: i32) {
        match signo {
            libc::SIGUSR1 => self.seat.vt_release(&mut self.clients),
            libc::SIGUSR2 => self.seat.vt_acquire(&mut self.clients),
            libc::SIGINT | libc::SIGTERM => {
                info!("received shutdown signal");
                self.running = false;
            }
            _ => debug!("ignoring unexpected signal {signo}"),
        }
    }

    fn handle_client(&mut self, id: ClientId, mask: u32) {
        let Some(client) = self.clients.get_mut(&id) else {
            // Stale readiness for a client destroyed earlier this iteration.
            return;
        };

        if mask & (ERROR | HANGUP) != 0 {
            debug!("client disconnected");
            self.kill_client(id);
            return;
        }

        if mask & WRITABLE != 0 {
            let fd = client.conn.as_raw_fd();
            match client.conn.flush() {
                Ok(()) => {
                    if !client.conn.has_pending_out() {
                        self.poller.update_fd(fd, READABLE);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!("client flush failed: {err}");
                    self.kill_client(id);
                    return;
                }
            }
        }

        if mask & READABLE != 0 {
            let Some(client) = self.clients.get_mut(&id) else {
                return;
            };
            match client.conn.read() {
                Ok(0) => {
                    debug!("client hung up");
                    self.kill_client(id);
                    return;
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!("client read failed: {err}");
                    self.kill_client(id);
                    return;
                }
            }
            self.dispatch_client(id);
        }
    }

    fn dispatch_client(&mut self, id: ClientId) {
        loop {
            let parsed = match self.clients.get_mut(&id) {
                Some(client) => client.next_request(),
                None => return,
            };
            match parsed {
                Ok(Some(request)) => self.handle_request(id, request),
                Ok(None) => return,
                Err(DecodeError::PathTooLong(len)) => {
                    debug!("rejecting oversized device path ({len} bytes)");
                    self.respond_error(id, Errno::EINVAL);
                }
                Err(err) => {
                    error!("client protocol error: {err}");
                    self.respond_error(id, Errno::EBADMSG);
                    self.kill_client(id);
                    return;
                }
            }
            if !self.clients.contains_key(&id) {
                return;
            }
        }
    }

    fn handle_request(&mut self, id: ClientId, request: Request) {
        match request {
            Request::OpenSeat => match self.seat.add_client(&mut self.clients, id) {
                Ok(()) => {
                    let name = self.seat.name().to_owned();
                    let sent = self
                        .clients
                        .get_mut(&id)
                        .map_or(false, |c| c.send_seat_opened(&name).is_ok());
                    if !sent {
                        self.kill_client(id);
                        return;
                    }
                    self.seat.activate(&mut self.clients);
                }
                Err(err) => {
                    self.respond_error(id, err);
                    // A client refused at attach cannot retry: a contended VT
                    // stays contended until a switch, and a spent session id
                    // never becomes valid again. A member that re-sends
                    // OPEN_SEAT keeps its connection.
                    if !self.seat.has_client(id) {
                        self.kill_client(id);
                    }
                }
            },
            Request::CloseSeat => {
                if !self.seat.has_client(id) {
                    self.respond_error(id, Errno::EPERM);
                    return;
                }
                self.seat.remove_client(&mut self.clients, id);
                if let Some(client) = self.clients.get_mut(&id) {
                    let _ = client.conn.put(&protocol::encode_empty(protocol::SERVER_SEAT_CLOSED));
                }
                self.kill_client(id);
            }
            Request::OpenDevice { path } => {
                match self.seat.open_device(&mut self.clients, id, &path) {
                    Ok((device_id, fd)) => {
                        let sent = self
                            .clients
                            .get_mut(&id)
                            .map_or(false, |c| c.send_device_opened(device_id, fd).is_ok());
                        if !sent {
                            self.kill_client(id);
                        }
                    }
                    Err(err) => self.respond_error(id, err),
                }
            }
            Request::CloseDevice { device_id } => {
                match self.seat.close_device(&mut self.clients, id, device_id) {
                    Ok(()) => self.respond_empty(id, protocol::SERVER_DEVICE_CLOSED),
                    Err(err) => self.respond_error(id, err),
                }
            }
            Request::SwitchSession { session } => {
                match self.seat.set_next_session(&mut self.clients, id, session) {
                    Ok(outcome) => {
                        // The response goes out before the disable event the
                        // switch triggers on this same connection.
                        self.respond_empty(id, protocol::SERVER_SESSION_SWITCHED);
                        if outcome == SwitchOutcome::Queued {
                            let _ = self.seat.disable_client(&mut self.clients, id);
                        }
                    }
                    Err(err) => self.respond_error(id, err),
                }
            }
            Request::DisableSeat => match self.seat.ack_disable(&mut self.clients, id) {
                Ok(()) => {
                    self.respond_empty(id, protocol::SERVER_SEAT_DISABLED);
                    self.seat.activate(&mut self.clients);
                }
                Err(err) => self.respond_error(id, err),
            },
            Request::Ping => self.respond_empty(id, protocol::SERVER_PONG),
        }
    }

    fn respond_empty(&mut self, id: ClientId, opcode: u16) {
        if let Some(client) = self.clients.get_mut(&id) {
            if client.conn.put(&protocol::encode_empty(opcode)).is_err() {
                self.kill_client(id);
            }
        }
    }

    fn respond_error(&mut self, id: ClientId, errno: Errno) {
        if let Some(client) = self.clients.get_mut(&id) {
            if client.send_error(errno).is_err() {
                self.kill_client(id);
            }
        }
    }

    /// Tear a client down: detach from the seat, flush what we can, shut the
    /// stream down for writing, unregister and close.
    fn kill_client(&mut self, id: ClientId) {
        if self.seat.has_client(id) {
            self.seat.remove_client(&mut self.clients, id);
        }
        if let Some(mut client) = self.clients.remove(&id) {
            let _ = client.conn.flush();
            client.conn.shutdown_write();
            self.poller.remove_fd(client.conn.as_raw_fd());
            debug!("destroyed client");
        }
    }

    /// Push queued responses and events out. Connections that cannot take
    /// the rest now get POLLOUT armed; connections that fail are killed.
    fn flush_clients(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            if !client.conn.has_pending_out() {
                continue;
            }
            let fd = client.conn.as_raw_fd();
            match client.conn.flush() {
                Ok(()) => {
                    let mask = if client.conn.has_pending_out() {
                        READABLE | WRITABLE
                    } else {
                        READABLE
                    };
                    self.poller.update_fd(fd, mask);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.poller.update_fd(fd, READABLE | WRITABLE);
                }
                Err(err) => {
                    debug!("client flush failed: {err}");
                    self.kill_client(id);
                }
            }
        }
    }

    /// Clients marked closed by the seat (failed event sends) still hold a
    /// connection; close them here.
    fn sweep_closed(&mut self) {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.state == ClientState::Closed)
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            self.kill_client(id);
        }
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        self.seat.teardown(&mut self.clients);
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.kill_client(id);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn peer_credentials(fd: std::os::fd::RawFd) -> io::Result<libc::ucred> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok(ucred)
}
