use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use log::{debug, error};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_RELDISP: libc::c_ulong = 0x5605;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KDSKBMODE: libc::c_ulong = 0x4B45;

const VT_AUTO: libc::c_char = 0x00;
const VT_PROCESS: libc::c_char = 0x01;
const VT_ACKACQ: libc::c_int = 0x02;

const KD_TEXT: libc::c_int = 0x00;
const KD_GRAPHICS: libc::c_int = 0x01;

const K_UNICODE: libc::c_int = 0x03;
const K_OFF: libc::c_int = 0x04;

#[repr(C)]
struct VtMode {
    mode: libc::c_char,
    waitv: libc::c_char,
    relsig: libc::c_short,
    acqsig: libc::c_short,
    frsig: libc::c_short,
}

#[repr(C)]
#[derive(Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

nix::ioctl_write_ptr_bad!(vt_setmode, VT_SETMODE, VtMode);
nix::ioctl_read_bad!(vt_getstate, VT_GETSTATE, VtStat);
nix::ioctl_write_int_bad!(vt_reldisp, VT_RELDISP);
nix::ioctl_write_int_bad!(vt_activate, VT_ACTIVATE);
nix::ioctl_write_int_bad!(kd_setmode, KDSETMODE);
nix::ioctl_write_int_bad!(kd_skbmode, KDSKBMODE);

/// A VT control handle. The tty fd only lives as long as this value; the
/// kernel tracks VT ownership through the ioctls, not the open file.
pub struct Terminal {
    fd: OwnedFd,
}

impl Terminal {
    /// Open `/dev/tty<vt>`; any `vt` below 1 opens the current console.
    pub fn open(vt: i32) -> Result<Self, Errno> {
        let path = if vt > 0 {
            format!("/dev/tty{vt}")
        } else {
            "/dev/tty0".to_string()
        };
        let fd = open(
            path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| {
            error!("could not open target tty: {err}");
            err
        })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn current_vt(&self) -> Result<i32, Errno> {
        let mut state = VtStat::default();
        unsafe { vt_getstate(self.fd.as_raw_fd(), &mut state) }.map_err(|err| {
            error!("could not retrieve VT state: {err}");
            err
        })?;
        Ok(i32::from(state.v_active))
    }

    /// In "process" mode the kernel raises SIGUSR1 when a VT switch is
    /// requested and SIGUSR2 once the VT has been handed to us, waiting for
    /// our acks in between. "auto" mode switches immediately.
    pub fn set_process_switching(&self, enable: bool) -> Result<(), Errno> {
        debug!("setting process switching to {enable}");
        let mode = VtMode {
            mode: if enable { VT_PROCESS } else { VT_AUTO },
            waitv: 0,
            relsig: if enable { libc::SIGUSR1 as libc::c_short } else { 0 },
            acqsig: if enable { libc::SIGUSR2 as libc::c_short } else { 0 },
            frsig: 0,
        };
        unsafe { vt_setmode(self.fd.as_raw_fd(), &mode) }.map_err(|err| {
            error!("could not set VT mode: {err}");
            err
        })?;
        Ok(())
    }

    pub fn switch_vt(&self, vt: i32) -> Result<(), Errno> {
        debug!("switching to VT {vt}");
        unsafe { vt_activate(self.fd.as_raw_fd(), vt) }.map_err(|err| {
            error!("could not activate VT: {err}");
            err
        })?;
        Ok(())
    }

    pub fn ack_release(&self) -> Result<(), Errno> {
        debug!("acking VT release");
        unsafe { vt_reldisp(self.fd.as_raw_fd(), 1) }.map_err(|err| {
            error!("could not ack VT release: {err}");
            err
        })?;
        Ok(())
    }

    pub fn ack_acquire(&self) -> Result<(), Errno> {
        debug!("acking VT acquire");
        unsafe { vt_reldisp(self.fd.as_raw_fd(), VT_ACKACQ) }.map_err(|err| {
            error!("could not ack VT acquire: {err}");
            err
        })?;
        Ok(())
    }

    /// Keyboard off stops the kernel console from also processing the keys
    /// a graphical session reads through evdev.
    pub fn set_keyboard(&self, enable: bool) -> Result<(), Errno> {
        debug!("setting KD keyboard state to {enable}");
        unsafe {
            kd_skbmode(
                self.fd.as_raw_fd(),
                if enable { K_UNICODE } else { K_OFF },
            )
        }
        .map_err(|err| {
            error!("could not set KD keyboard mode: {err}");
            err
        })?;
        Ok(())
    }

    pub fn set_graphics(&self, enable: bool) -> Result<(), Errno> {
        debug!("setting KD graphics state to {enable}");
        unsafe {
            kd_setmode(
                self.fd.as_raw_fd(),
                if enable { KD_GRAPHICS } else { KD_TEXT },
            )
        }
        .map_err(|err| {
            error!("could not set KD graphics mode: {err}");
            err
        })?;
        Ok(())
    }
}
