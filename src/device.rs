use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

// From libdrm: DRM_IOCTL_SET_MASTER / DRM_IOCTL_DROP_MASTER.
nix::ioctl_none!(drm_set_master, b'd', 0x1e);
nix::ioctl_none!(drm_drop_master, b'd', 0x1f);
// EVIOCREVOKE
nix::ioctl_write_int!(evdev_revoke, b'E', 0x91);
// HIDIOCREVOKE
nix::ioctl_write_int!(hidraw_revoke, b'H', 0x0d);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Evdev,
    Drm,
    Hidraw,
    Wscons,
}

/// Classify a canonical device path by its node name. Paths that match no
/// known device class are refused.
pub fn classify(path: &Path) -> Option<DeviceType> {
    let path = path.to_str()?;
    if path.starts_with("/dev/input/event") {
        Some(DeviceType::Evdev)
    } else if path.starts_with("/dev/dri/card")
        || path.starts_with("/dev/dri/renderD")
        || path.starts_with("/dev/drm/")
    {
        Some(DeviceType::Drm)
    } else if path.starts_with("/dev/hidraw") {
        Some(DeviceType::Hidraw)
    } else if path.starts_with("/dev/ttyE")
        || path.starts_with("/dev/wskbd")
        || path.starts_with("/dev/wsmouse")
        || path.starts_with("/dev/wsmux")
    {
        Some(DeviceType::Wscons)
    } else {
        None
    }
}

/// Resolve symlinks and reject anything that does not land under `/dev`.
pub fn sanitize(path: &Path) -> Result<PathBuf, Errno> {
    let canonical = fs::canonicalize(path)
        .map_err(|err| Errno::from_i32(err.raw_os_error().unwrap_or(libc::EINVAL)))?;
    if !canonical.starts_with("/dev") {
        return Err(Errno::EACCES);
    }
    Ok(canonical)
}

pub fn open_device_node(path: &Path) -> Result<OwnedFd, Errno> {
    let fd = open(
        path,
        OFlag::O_RDWR
            | OFlag::O_NOCTTY
            | OFlag::O_NOFOLLOW
            | OFlag::O_CLOEXEC
            | OFlag::O_NONBLOCK,
        Mode::empty(),
    )?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl DeviceType {
    /// Re-acquire the device's privileged capability. Only DRM master can be
    /// re-armed; a revoked evdev/hidraw fd is dead for good and the client
    /// has to reopen the device. Wscons access follows the VT, so there is
    /// nothing to do per fd.
    pub fn activate(self, fd: BorrowedFd) -> Result<(), Errno> {
        match self {
            DeviceType::Drm => unsafe { drm_set_master(fd.as_raw_fd()) }.map(drop),
            DeviceType::Evdev | DeviceType::Hidraw => Err(Errno::EINVAL),
            DeviceType::Wscons => Ok(()),
        }
    }

    /// Strip the device's privileged capability so a deactivated session can
    /// neither read input nor touch the display.
    pub fn deactivate(self, fd: BorrowedFd) -> Result<(), Errno> {
        match self {
            DeviceType::Drm => unsafe { drm_drop_master(fd.as_raw_fd()) }.map(drop),
            DeviceType::Evdev => unsafe { evdev_revoke(fd.as_raw_fd(), 0) }.map(drop),
            DeviceType::Hidraw => unsafe { hidraw_revoke(fd.as_raw_fd(), 0) }.map(drop),
            DeviceType::Wscons => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_device_nodes() {
        assert_eq!(
            classify(Path::new("/dev/input/event3")),
            Some(DeviceType::Evdev)
        );
        assert_eq!(classify(Path::new("/dev/dri/card0")), Some(DeviceType::Drm));
        assert_eq!(
            classify(Path::new("/dev/dri/renderD128")),
            Some(DeviceType::Drm)
        );
        assert_eq!(classify(Path::new("/dev/drm/0")), Some(DeviceType::Drm));
        assert_eq!(
            classify(Path::new("/dev/hidraw4")),
            Some(DeviceType::Hidraw)
        );
        assert_eq!(classify(Path::new("/dev/ttyE0")), Some(DeviceType::Wscons));
        assert_eq!(
            classify(Path::new("/dev/wskbd0")),
            Some(DeviceType::Wscons)
        );
        assert_eq!(
            classify(Path::new("/dev/wsmouse0")),
            Some(DeviceType::Wscons)
        );
    }

    #[test]
    fn refuses_unknown_paths() {
        assert_eq!(classify(Path::new("/dev/null")), None);
        assert_eq!(classify(Path::new("/dev/tty1")), None);
        assert_eq!(classify(Path::new("/etc/passwd")), None);
        assert_eq!(classify(Path::new("/dev/input")), None);
    }

    #[test]
    fn sanitize_accepts_dev_paths() {
        assert_eq!(
            sanitize(Path::new("/dev/./null")).unwrap(),
            PathBuf::from("/dev/null")
        );
    }

    #[test]
    fn sanitize_rejects_paths_outside_dev() {
        assert_eq!(sanitize(Path::new("/etc/passwd")), Err(Errno::EACCES));
        assert_eq!(
            sanitize(Path::new("/dev/../etc/passwd")),
            Err(Errno::EACCES)
        );
    }

    #[test]
    fn sanitize_rejects_symlink_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("sneaky");
        std::os::unix::fs::symlink("/etc/passwd", &link).unwrap();
        assert_eq!(sanitize(&link), Err(Errno::EACCES));
    }

    #[test]
    fn sanitize_propagates_lookup_errors() {
        assert_eq!(
            sanitize(Path::new("/dev/definitely-not-a-device")),
            Err(Errno::ENOENT)
        );
    }
}
