//! Network namespace lifecycle: the `/var/run/netns` directory, namespace
//! file creation/deletion/enumeration, and switching the calling process's
//! active namespace.

use std::fs::{self, File};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};

use crate::error::{Error, Result};
use crate::netlink::NetlinkSocket;

const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Dense 32-bit node identifier. `0` is a valid id; namespace file names are
/// simply the decimal rendering of the id under the configured prefix.
pub type NamespaceId = u32;

/// Manages the shared `/var/run/netns` mountpoint and namespace files under
/// it, all named `$prefix$id`.
pub struct NamespaceDir {
    base: PathBuf,
    prefix: String,
}

impl NamespaceDir {
    /// Ensure `/var/run/netns` exists, is a (possibly self-)bind mount, and
    /// is marked `MS_SHARED` so namespace bind-mounts created later persist
    /// independent of any mount namespace changes — matching the
    /// iproute2-compatible behavior of `ip netns add`.
    pub fn init(prefix: impl Into<String>) -> Result<Self> {
        fs::create_dir_all(NETNS_RUN_DIR).map_err(Error::from)?;
        if !is_mountpoint(NETNS_RUN_DIR)? {
            mount(
                Some(NETNS_RUN_DIR),
                NETNS_RUN_DIR,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(Error::from)?;
        }
        mount(
            None::<&str>,
            NETNS_RUN_DIR,
            None::<&str>,
            MsFlags::MS_SHARED,
            None::<&str>,
        )
        .map_err(Error::from)?;
        Ok(Self {
            base: PathBuf::from(NETNS_RUN_DIR),
            prefix: prefix.into(),
        })
    }

    fn path_for(&self, id: NamespaceId) -> PathBuf {
        self.base.join(format!("{}{}", self.prefix, id))
    }

    /// Open (or, if absent, create) the namespace for `id`.
    ///
    /// If the file already exists and `excl` is set, this fails. Otherwise
    /// an existing file is simply opened. A newly created namespace switches
    /// the *calling process* into it (an inherent property of `unshare`) —
    /// callers must account for this process-wide side effect.
    pub fn open(&self, id: NamespaceId, create: bool, excl: bool) -> Result<NamespaceContext> {
        let path = self.path_for(id);
        if path.exists() {
            if excl {
                return Err(Error::config(format!(
                    "namespace {} already exists",
                    path.display()
                )));
            }
            return self.open_existing(&path);
        }
        if !create {
            return Err(Error::config(format!(
                "namespace {} does not exist",
                path.display()
            )));
        }
        self.create_new(&path)
    }

    fn open_existing(&self, path: &Path) -> Result<NamespaceContext> {
        let file = File::open(path).map_err(Error::from)?;
        switch(Some(&file))?;
        self.finish_open(file)
    }

    fn create_new(&self, path: &Path) -> Result<NamespaceContext> {
        File::create(path).map_err(Error::from)?;
        unshare(CloneFlags::CLONE_NEWNET).map_err(Error::from)?;
        mount(
            Some("/proc/self/ns/net"),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(Error::from)?;
        let file = File::open(path).map_err(Error::from)?;
        self.finish_open(file)
    }

    fn finish_open(&self, ns_file: File) -> Result<NamespaceContext> {
        context_from_file(ns_file)
    }

    /// Lazily unmount and unlink the namespace file for `id`.
    pub fn delete(&self, id: NamespaceId) -> Result<()> {
        let path = self.path_for(id);
        match umount2(&path, MntFlags::MNT_DETACH) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {
                // Not a mountpoint (or already gone); still try to unlink.
            }
            Err(e) => return Err(Error::from(e)),
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Invoke `callback` once per namespace file matching this directory's
    /// prefix.
    pub fn enumerate(&self, mut callback: impl FnMut(NamespaceId)) -> Result<()> {
        for entry in fs::read_dir(&self.base).map_err(Error::from)? {
            let entry = entry.map_err(Error::from)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix(self.prefix.as_str()) {
                if let Ok(id) = suffix.parse::<NamespaceId>() {
                    callback(id);
                }
            }
        }
        Ok(())
    }
}

/// Open the host's default network namespace (`/proc/1/ns/net`) directly,
/// switching the calling process into it. Needed before a physical edge
/// interface can be moved into a managed namespace: the interface is only
/// visible to a netlink socket created while this namespace is active, and
/// by the time `AddRoot` has run, the worker has already switched away from
/// it. The returned context's sockets stay bound to this namespace
/// regardless of later switches, the same way every [`NamespaceContext`]
/// does.
pub fn open_default() -> Result<NamespaceContext> {
    let file = File::open("/proc/1/ns/net").map_err(Error::from)?;
    switch(Some(&file))?;
    context_from_file(file)
}

fn context_from_file(ns_file: File) -> Result<NamespaceContext> {
    let ioctl_fd = open_ioctl_socket()?;
    let netlink = NetlinkSocket::new()?;
    Ok(NamespaceContext {
        ns_file,
        ioctl_fd,
        netlink,
    })
}

/// Open a plain `AF_INET`/`SOCK_DGRAM` socket in the current namespace, used
/// purely as a handle for ioctls (`SIOCGIFINDEX`, `SIOCETHTOOL`, ...) that
/// require *some* socket bound to the target namespace but don't care about
/// its address family.
fn open_ioctl_socket() -> Result<OwnedFd> {
    // Safety: a plain, unconnected datagram socket; the raw fd is
    // immediately wrapped in an `OwnedFd`, which will close it on drop.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if raw < 0 {
        return Err(Error::kernel("failed to open ioctl socket"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn is_mountpoint(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let here = fs::metadata(path).map_err(Error::from)?;
    let parent = path.parent().unwrap_or(Path::new("/"));
    let up = fs::metadata(parent).map_err(Error::from)?;
    Ok(here.dev() != up.dev())
}

/// The open handles for a single namespace: the stable namespace file
/// handle, an auxiliary raw packet socket bound to the namespace for ioctl
/// use, and a reusable netlink socket. Invalidating a context closes both
/// file descriptors and releases the netlink socket; the underlying
/// namespace file on disk survives until [`NamespaceDir::delete`] is called.
pub struct NamespaceContext {
    ns_file: File,
    ioctl_fd: OwnedFd,
    netlink: NetlinkSocket,
}

impl NamespaceContext {
    /// Raw fd suitable for `setns`.
    pub fn ns_fd(&self) -> i32 {
        self.ns_file.as_raw_fd()
    }

    /// The auxiliary ioctl socket bound to this namespace.
    pub fn ioctl_fd(&self) -> &OwnedFd {
        &self.ioctl_fd
    }

    /// The reusable netlink socket for this namespace.
    pub fn netlink(&mut self) -> &mut NetlinkSocket {
        &mut self.netlink
    }

    /// Make this the calling process's active network namespace.
    pub fn switch_into(&self) -> Result<()> {
        setns(&self.ns_file, CloneFlags::CLONE_NEWNET).map_err(Error::from)
    }
}

/// Switch the calling process's active network namespace. `None` switches
/// back to the default namespace (`/proc/1/ns/net`), opened transiently.
pub fn switch(ns: Option<&File>) -> Result<()> {
    match ns {
        Some(file) => setns(file, CloneFlags::CLONE_NEWNET).map_err(Error::from),
        None => {
            let default_ns = File::open("/proc/1/ns/net").map_err(Error::from)?;
            setns(&default_ns, CloneFlags::CLONE_NEWNET).map_err(Error::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_ids_roundtrip_through_filenames() {
        let dir = NamespaceDir {
            base: PathBuf::from("/var/run/netns"),
            prefix: "nm-".to_string(),
        };
        assert_eq!(dir.path_for(42).file_name().unwrap(), "nm-42");
    }
}
