use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use nix::errno::Errno;

use crate::client::{Client, ClientId, ClientState};
use crate::device::{self, DeviceType};
use crate::list::List;
use crate::terminal::Terminal;

pub const MAX_SEAT_DEVICES: usize = 256;

pub type ClientMap = HashMap<ClientId, Client>;

/// A device opened on behalf of a client. The fd keeps the exact same file
/// description across deactivate/activate cycles; reopening a DRM device
/// would invalidate every context the client created on it.
pub struct SeatDevice {
    pub device_id: i32,
    pub path: PathBuf,
    pub ty: DeviceType,
    pub fd: OwnedFd,
    pub ref_cnt: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Nothing to do (own session, or a switch is already queued).
    Noop,
    /// A VT switch was requested from the kernel; signals drive the rest.
    VtSwitch,
    /// A userland successor was queued; the caller must now disable the
    /// active client.
    Queued,
}

/// The seat state machine. Clients are stored behind ids in the server's
/// client map and every operation borrows the map for the call, so the seat
/// never outlives or aliases its clients.
pub struct Seat {
    name: String,
    vt_bound: bool,
    clients: List<ClientId>,
    active_client: Option<ClientId>,
    next_client: Option<ClientId>,
    cur_vt: i32,
    session_cnt: i32,
}

impl Seat {
    pub fn new(name: &str, vt_bound: bool) -> Self {
        debug!("created seat '{name}' (vt_bound: {vt_bound})");
        Self {
            name: name.to_string(),
            vt_bound,
            clients: List::new(),
            active_client: None,
            next_client: None,
            cur_vt: -1,
            session_cnt: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vt_bound(&self) -> bool {
        self.vt_bound
    }

    pub fn active_client(&self) -> Option<ClientId> {
        self.active_client
    }

    pub fn has_client(&self, id: ClientId) -> bool {
        self.clients.iter().any(|&c| c == id)
    }

    /// Attach a client to the seat. On a VT-bound seat the client is tied to
    /// the VT that is current right now; otherwise it gets the next session
    /// id off the counter.
    pub fn add_client(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        if self.has_client(id) {
            error!("cannot add client: client is already a member of the seat");
            return Err(Errno::EBUSY);
        }
        if clients.get(&id).map_or(true, |c| c.session != -1) {
            error!("cannot add client: client has already held a session");
            return Err(Errno::EBUSY);
        }

        let session = if self.vt_bound {
            let vt = Terminal::open(0)?.current_vt()?;
            if let Some(active_id) = self.active_client {
                let pending_same_vt = clients
                    .get(&active_id)
                    .map_or(false, |a| a.state == ClientState::PendingDisable && a.session == vt);
                if !pending_same_vt {
                    error!("cannot add client: seat is VT-bound and has an active client");
                    return Err(Errno::EBUSY);
                }
            }
            self.cur_vt = vt;
            vt
        } else {
            let session = self.session_cnt;
            self.session_cnt += 1;
            session
        };

        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        client.session = session;
        client.state = ClientState::Disabled;
        self.clients.push_back(id);
        debug!("added client with session {session}");
        Ok(())
    }

    /// Hand the seat to a client: put its VT into graphics/process-switch
    /// mode, re-arm its devices and send the enable event.
    fn open_client(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        if self.active_client.is_some() {
            error!("could not open client: seat already has an active client");
            return Err(Errno::EBUSY);
        }
        let (session, state) = clients
            .get(&id)
            .map(|c| (c.session, c.state))
            .ok_or(Errno::ENOENT)?;
        if state != ClientState::New && state != ClientState::Disabled {
            error!("could not open client: client is neither new nor disabled");
            return Err(Errno::EALREADY);
        }

        if self.vt_bound {
            let terminal = Terminal::open(session)?;
            terminal.set_process_switching(true)?;
            terminal.set_graphics(true)?;
            terminal.set_keyboard(false)?;
        }

        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        let mut activated = 0;
        for device in client.devices.iter_mut() {
            if device.active {
                activated += 1;
                continue;
            }
            // Best effort. Revoked evdev/hidraw fds stay dead; the client
            // has to reopen those devices itself.
            match device.ty.activate(device.fd.as_fd()) {
                Ok(()) => {
                    device.active = true;
                    activated += 1;
                }
                Err(err) => error!("unable to activate '{}': {err}", device.path.display()),
            }
        }
        debug!("activated {activated} devices");

        client.state = ClientState::Active;
        self.active_client = Some(id);
        if client.send_enable_seat().is_err() {
            client.state = ClientState::Closed;
            if self.vt_bound {
                self.vt_close(session);
            }
            self.remove_client(clients, id);
            return Err(Errno::EPIPE);
        }

        info!("client successfully enabled");
        Ok(())
    }

    /// Revoke the active client's device access and ask it to let go of the
    /// seat. Idempotent: a client that is already pending a disable is left
    /// alone and no second event is sent.
    pub fn disable_client(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        if client.state == ClientState::PendingDisable {
            return Ok(());
        }
        if client.state != ClientState::Active || self.active_client != Some(id) {
            error!("could not disable client: client is not active");
            return Err(Errno::EBUSY);
        }

        let mut deactivated = 0;
        for device in client.devices.iter_mut() {
            if !device.active {
                continue;
            }
            match device.ty.deactivate(device.fd.as_fd()) {
                Ok(()) => {
                    device.active = false;
                    deactivated += 1;
                }
                Err(err) => error!("unable to deactivate '{}': {err}", device.path.display()),
            }
        }
        debug!("deactivated {deactivated} devices");

        client.state = ClientState::PendingDisable;
        if client.send_disable_seat().is_err() {
            client.state = ClientState::Closed;
            self.remove_client(clients, id);
            return Err(Errno::EPIPE);
        }
        Ok(())
    }

    /// Process the client's ack of a disable. The caller queues the response
    /// first and then runs [`Seat::activate`], so the ack response always
    /// precedes a possible re-enable event on the same connection.
    pub fn ack_disable(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        if client.state != ClientState::PendingDisable {
            error!("could not ack disable: client is not pending a disable");
            return Err(Errno::EPERM);
        }
        client.state = ClientState::Disabled;
        if self.active_client == Some(id) {
            self.active_client = None;
        }
        debug!("client acked disable");
        Ok(())
    }

    /// Detach a client from the seat, closing its devices. If it held the
    /// seat, its VT is restored to text mode when no other client claims it,
    /// and a successor is activated.
    pub fn remove_client(&mut self, clients: &mut ClientMap, id: ClientId) {
        // Off the roster first, so nothing below can reactivate it.
        let pos_found = self.clients.iter().position(|&c| c == id);
        let found = pos_found.is_some();
        if let Some(pos) = pos_found {
            self.clients.remove(pos);
        }
        if !found {
            debug!("client was not on the seat roster");
        }
        if self.next_client == Some(id) {
            self.next_client = None;
        }

        let mut session = -1;
        if let Some(client) = clients.get_mut(&id) {
            session = client.session;
            while let Some(mut device) = client.devices.pop_front() {
                Self::destroy_device(&mut device);
            }
        }

        if self.active_client == Some(id) {
            self.active_client = None;
            if self.vt_bound && session > 0 {
                let orphaned = !self
                    .clients
                    .iter()
                    .any(|cid| clients.get(cid).map_or(false, |c| c.session == session));
                if orphaned {
                    self.vt_close(session);
                }
            }
            self.activate(clients);
        }
        debug!("removed client");
    }

    /// Queue a session switch on behalf of the active client.
    pub fn set_next_session(
        &mut self,
        clients: &mut ClientMap,
        id: ClientId,
        session: i32,
    ) -> Result<SwitchOutcome, Errno> {
        let (state, own_session) = clients
            .get(&id)
            .map(|c| (c.state, c.session))
            .ok_or(Errno::ENOENT)?;
        if state != ClientState::Active || self.active_client != Some(id) {
            error!("could not switch session: client is not active");
            return Err(Errno::EPERM);
        }
        if session <= 0 {
            return Err(Errno::EINVAL);
        }
        if session == own_session {
            debug!("switch to the current session is a no-op");
            return Ok(SwitchOutcome::Noop);
        }
        if self.next_client.is_some() {
            debug!("a switch is already queued");
            return Ok(SwitchOutcome::Noop);
        }

        if self.vt_bound {
            info!("switching to VT {session}");
            // The kernel raises the release signal and the signal flow takes
            // over from there.
            Terminal::open(0)?.switch_vt(session)?;
            return Ok(SwitchOutcome::VtSwitch);
        }

        let target = self
            .clients
            .iter()
            .copied()
            .find(|cid| clients.get(cid).map_or(false, |c| c.session == session));
        let Some(target) = target else {
            error!("no client with session {session}");
            return Err(Errno::EINVAL);
        };
        info!("queuing switch to session {session}");
        self.next_client = Some(target);
        Ok(SwitchOutcome::Queued)
    }

    /// The kernel asks whether it may take the VT away. Disable the active
    /// client without waiting for its ack (the kernel would not wait either)
    /// and approve the release.
    pub fn vt_release(&mut self, clients: &mut ClientMap) {
        if !self.vt_bound {
            info!("ignoring VT release request on non-VT-bound seat");
            return;
        }
        if let Ok(vt) = Terminal::open(0).and_then(|t| t.current_vt()) {
            self.cur_vt = vt;
        }
        info!("releasing VT {}", self.cur_vt);
        if let Some(active) = self.active_client {
            let _ = self.disable_client(clients, active);
        }
        match Terminal::open(self.cur_vt) {
            Ok(terminal) => {
                let _ = terminal.ack_release();
            }
            Err(err) => error!("could not open terminal to ack VT release: {err}"),
        }
        self.cur_vt = -1;
    }

    /// The kernel handed us a VT. Record it, ack, and activate a client if
    /// the seat is idle.
    pub fn vt_acquire(&mut self, clients: &mut ClientMap) {
        if !self.vt_bound {
            info!("ignoring VT acquire request on non-VT-bound seat");
            return;
        }
        match Terminal::open(0).and_then(|t| t.current_vt()) {
            Ok(vt) => self.cur_vt = vt,
            Err(err) => {
                error!("could not read current VT: {err}");
                return;
            }
        }
        info!("acquired VT {}", self.cur_vt);
        match Terminal::open(self.cur_vt) {
            Ok(terminal) => {
                let _ = terminal.ack_acquire();
            }
            Err(err) => error!("could not open terminal to ack VT acquire: {err}"),
        }
        if self.active_client.is_none() {
            self.activate(clients);
        }
    }

    /// Pick the next client to hold the seat, if any, and open it. Queued
    /// successors win; on a VT-bound seat whose VT is with the kernel we
    /// wait for the acquire signal instead.
    pub fn activate(&mut self, clients: &mut ClientMap) {
        if self.active_client.is_some() {
            return;
        }
        let candidate = match self.next_client.take() {
            Some(next) => Some(next),
            None if self.vt_bound && self.cur_vt == -1 => return,
            None if self.vt_bound => self
                .clients
                .iter()
                .copied()
                .find(|cid| clients.get(cid).map_or(false, |c| c.session == self.cur_vt)),
            None => self.clients.iter().copied().next(),
        };
        match candidate {
            Some(id) => {
                info!("activating next client");
                if let Err(err) = self.open_client(clients, id) {
                    error!("could not activate client: {err}");
                }
            }
            None => info!("no client suitable for activation"),
        }
    }

    /// Open a device node for the active client, deduplicating on the
    /// canonical path, and grant the type's capability. Returns the
    /// client-unique device id and the fd to pass back.
    pub fn open_device(
        &mut self,
        clients: &mut ClientMap,
        id: ClientId,
        path: &Path,
    ) -> Result<(i32, RawFd), Errno> {
        if self.active_client != Some(id) {
            return Err(Errno::EPERM);
        }
        let sanitized = device::sanitize(path).map_err(|err| {
            error!("invalid path '{}': {err}", path.display());
            err
        })?;
        let ty = device::classify(&sanitized).ok_or_else(|| {
            error!("could not classify device '{}'", sanitized.display());
            Errno::ENOENT
        })?;

        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        let mut device_id = 1;
        for device in client.devices.iter_mut() {
            if device.path == sanitized {
                device.ref_cnt += 1;
                return Ok((device.device_id, device.fd.as_raw_fd()));
            }
            if device.device_id >= device_id {
                device_id = device.device_id + 1;
            }
        }

        if client.devices.len() >= MAX_SEAT_DEVICES {
            error!("max seat devices exceeded");
            return Err(Errno::EMFILE);
        }

        let fd = device::open_device_node(&sanitized).map_err(|err| {
            error!("could not open '{}': {err}", sanitized.display());
            err
        })?;
        if ty == DeviceType::Drm {
            if let Err(err) = ty.activate(fd.as_fd()) {
                debug!("drm_set_master failed: {err}");
            }
        }

        debug!(
            "opened '{}' as device {device_id}",
            sanitized.display()
        );
        let raw_fd = fd.as_raw_fd();
        client.devices.push_back(SeatDevice {
            device_id,
            path: sanitized,
            ty,
            fd,
            ref_cnt: 1,
            active: true,
        });
        Ok((device_id, raw_fd))
    }

    /// Drop one reference to a device; the last reference deactivates the
    /// capability, closes the fd and removes the entry.
    pub fn close_device(
        &mut self,
        clients: &mut ClientMap,
        id: ClientId,
        device_id: i32,
    ) -> Result<(), Errno> {
        if device_id < 0 {
            return Err(Errno::EINVAL);
        }
        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        let pos = client
            .devices
            .iter()
            .position(|d| d.device_id == device_id)
            .ok_or(Errno::ENOENT)?;

        let device = client.devices.get_mut(pos).expect("position just found");
        debug!(
            "closing device {device_id} ('{}'), ref_cnt {}",
            device.path.display(),
            device.ref_cnt
        );
        device.ref_cnt -= 1;
        if device.ref_cnt > 0 {
            return Ok(());
        }

        let mut device = client.devices.remove(pos).expect("position just found");
        Self::destroy_device(&mut device);
        Ok(())
    }

    /// Destroy the seat: close every client's devices and give the VT back
    /// to the console. Connections are torn down by the server afterwards.
    pub fn teardown(&mut self, clients: &mut ClientMap) {
        self.next_client = None;
        let ids: Vec<ClientId> = self.clients.iter().copied().collect();
        // Empty the roster first so nothing re-activates during teardown.
        while self.clients.pop_front().is_some() {}
        for id in ids {
            if let Some(client) = clients.get_mut(&id) {
                while let Some(mut device) = client.devices.pop_front() {
                    Self::destroy_device(&mut device);
                }
                client.state = ClientState::Closed;
            }
        }
        if self.active_client.take().is_some() && self.vt_bound && self.cur_vt != -1 {
            self.vt_close(self.cur_vt);
        }
        debug!("seat '{}' destroyed", self.name);
    }

    fn destroy_device(device: &mut SeatDevice) {
        if device.active {
            if let Err(err) = device.ty.deactivate(device.fd.as_fd()) {
                debug!("could not deactivate '{}': {err}", device.path.display());
            }
            device.active = false;
        }
        // The fd closes when the device is dropped.
    }

    /// Give a VT back to the console: text rendering, kernel keyboard input
    /// and automatic switching.
    fn vt_close(&self, vt: i32) {
        let terminal = match Terminal::open(vt) {
            Ok(terminal) => terminal,
            Err(err) => {
                error!("could not open terminal to restore VT: {err}");
                return;
            }
        };
        let _ = terminal.set_graphics(false);
        let _ = terminal.set_keyboard(true);
        let _ = terminal.set_process_switching(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn attach(seat: &mut Seat, clients: &mut ClientMap, id: ClientId) -> UnixStream {
        let (ours, theirs) = UnixStream::pair().unwrap();
        clients.insert(id, Client::new(id, ours, 0, 0, 0));
        seat.add_client(clients, id).unwrap();
        theirs
    }

    fn drain(clients: &mut ClientMap, id: ClientId, peer: &mut UnixStream) -> Vec<u8> {
        clients.get_mut(&id).unwrap().conn.flush().unwrap();
        peer.set_nonblocking(true).unwrap();
        let mut bytes = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = peer.read(&mut buf) {
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
        }
        bytes
    }

    #[test]
    fn first_client_is_activated() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let mut peer = attach(&mut seat, &mut clients, a);

        assert_eq!(clients[&a].session, 1);
        seat.activate(&mut clients);
        assert_eq!(seat.active_client(), Some(a));
        assert_eq!(clients[&a].state, ClientState::Active);
        // The enable event went out on the wire.
        assert_eq!(drain(&mut clients, a, &mut peer), [10, 0, 0, 0]);
    }

    #[test]
    fn at_most_one_client_is_active() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let _peer_b = attach(&mut seat, &mut clients, b);
        seat.activate(&mut clients);

        assert_eq!(seat.active_client(), Some(a));
        assert_eq!(clients[&b].state, ClientState::Disabled);
        let active = clients
            .values()
            .filter(|c| c.state == ClientState::Active)
            .count();
        assert_eq!(active, 1);
    }

    #[test]
    fn sessions_are_unique() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        let _peer_b = attach(&mut seat, &mut clients, b);
        assert_eq!(clients[&a].session, 1);
        assert_eq!(clients[&b].session, 2);
    }

    #[test]
    fn used_client_cannot_reattach() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let _peer = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        seat.remove_client(&mut clients, a);
        assert_eq!(seat.add_client(&mut clients, a), Err(Errno::EBUSY));
    }

    #[test]
    fn disable_is_idempotent() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let mut peer = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        drain(&mut clients, a, &mut peer);

        seat.disable_client(&mut clients, a).unwrap();
        assert_eq!(clients[&a].state, ClientState::PendingDisable);
        assert_eq!(drain(&mut clients, a, &mut peer), [9, 0, 0, 0]);

        // Second call succeeds without a second event.
        seat.disable_client(&mut clients, a).unwrap();
        assert_eq!(clients[&a].state, ClientState::PendingDisable);
        assert!(drain(&mut clients, a, &mut peer).is_empty());
    }

    #[test]
    fn ack_disable_frees_the_seat() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let _peer_b = attach(&mut seat, &mut clients, b);

        assert_eq!(
            seat.set_next_session(&mut clients, a, 2),
            Ok(SwitchOutcome::Queued)
        );
        seat.disable_client(&mut clients, a).unwrap();
        seat.ack_disable(&mut clients, a).unwrap();
        assert_eq!(seat.active_client(), None);
        seat.activate(&mut clients);
        assert_eq!(seat.active_client(), Some(b));
        assert_eq!(clients[&a].state, ClientState::Disabled);
        assert_eq!(clients[&b].state, ClientState::Active);
    }

    #[test]
    fn switch_to_own_session_is_a_noop() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let _peer = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let session = clients[&a].session;
        assert_eq!(
            seat.set_next_session(&mut clients, a, session),
            Ok(SwitchOutcome::Noop)
        );
        assert_eq!(seat.active_client(), Some(a));
    }

    #[test]
    fn switch_requires_active_client() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let _peer_b = attach(&mut seat, &mut clients, b);
        assert_eq!(
            seat.set_next_session(&mut clients, b, 1),
            Err(Errno::EPERM)
        );
    }

    #[test]
    fn removing_the_active_client_activates_a_successor() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let _peer_b = attach(&mut seat, &mut clients, b);

        seat.remove_client(&mut clients, a);
        assert!(!seat.has_client(a));
        assert_eq!(seat.active_client(), Some(b));
    }

    #[test]
    fn device_refcount_reaches_zero_exactly_once() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let _peer = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);

        // Stand-in for a real device node; the revoke ioctl on it fails and
        // is logged, which is the best-effort path.
        let fd = device::open_device_node(Path::new("/dev/null")).unwrap();
        clients.get_mut(&a).unwrap().devices.push_back(SeatDevice {
            device_id: 1,
            path: PathBuf::from("/dev/input/event0"),
            ty: DeviceType::Evdev,
            fd,
            ref_cnt: 2,
            active: true,
        });

        seat.close_device(&mut clients, a, 1).unwrap();
        assert_eq!(clients[&a].devices.len(), 1);
        seat.close_device(&mut clients, a, 1).unwrap();
        assert_eq!(clients[&a].devices.len(), 0);
        assert_eq!(seat.close_device(&mut clients, a, 1), Err(Errno::ENOENT));
    }

    #[test]
    fn close_device_rejects_negative_ids() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let _peer = attach(&mut seat, &mut clients, a);
        assert_eq!(seat.close_device(&mut clients, a, -1), Err(Errno::EINVAL));
    }

    #[test]
    fn open_device_requires_the_active_client() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let _peer_b = attach(&mut seat, &mut clients, b);
        assert_eq!(
            seat.open_device(&mut clients, b, Path::new("/dev/null")),
            Err(Errno::EPERM)
        );
    }

    #[test]
    fn teardown_closes_everything() {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let a = ClientId::first();
        let b = a.next();
        let _peer_a = attach(&mut seat, &mut clients, a);
        seat.activate(&mut clients);
        let _peer_b = attach(&mut seat, &mut clients, b);

        seat.teardown(&mut clients);
        assert_eq!(seat.active_client(), None);
        assert!(!seat.has_client(a));
        assert!(!seat.has_client(b));
        assert!(clients.values().all(|c| c.state == ClientState::Closed));
    }
}
