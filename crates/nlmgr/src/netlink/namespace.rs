//! Network namespace selection.
//!
//! Sockets are bound to the namespace of the thread that creates them. To
//! open a socket elsewhere the creating thread switches in with `setns(2)`,
//! opens the socket and switches back. [`NamespaceGuard`] does the
//! switching back on drop.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::error::{Error, Result};

/// The runtime directory where named network namespaces are stored.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Identifies a network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceSpec {
    /// A namespace created with `ip netns add`, found under [`NETNS_RUN_DIR`].
    Named(String),
    /// Any namespace file, e.g. a bind mount.
    Path(PathBuf),
    /// The namespace of a running process.
    Pid(u32),
}

impl NamespaceSpec {
    /// Filesystem path of the namespace file.
    pub fn path(&self) -> PathBuf {
        match self {
            Self::Named(name) => PathBuf::from(NETNS_RUN_DIR).join(name),
            Self::Path(path) => path.clone(),
            Self::Pid(pid) => PathBuf::from(format!("/proc/{}/ns/net", pid)),
        }
    }

    /// Switch the calling thread into this namespace.
    pub fn enter(&self) -> Result<NamespaceGuard> {
        enter_path(self.path())
    }
}

impl From<&str> for NamespaceSpec {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

/// Enter a network namespace by path.
pub fn enter_path<P: AsRef<Path>>(path: P) -> Result<NamespaceGuard> {
    let path = path.as_ref();
    let original = File::open("/proc/self/ns/net")?;

    let target = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NamespaceNotFound {
            name: path.display().to_string(),
        },
        _ => Error::Io(e),
    })?;

    // SAFETY: target is an open namespace file and CLONE_NEWNET restricts
    // the switch to the network namespace of this thread.
    let ret = unsafe { libc::setns(target.as_raw_fd(), libc::CLONE_NEWNET) };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    tracing::debug!(namespace = %path.display(), "entered network namespace");

    Ok(NamespaceGuard { original })
}

/// Restores the original namespace when dropped.
#[derive(Debug)]
pub struct NamespaceGuard {
    original: File,
}

impl NamespaceGuard {
    /// Restore the original namespace explicitly, reporting failure.
    pub fn restore(self) -> Result<()> {
        self.do_restore()
    }

    fn do_restore(&self) -> Result<()> {
        // SAFETY: original was opened from /proc/self/ns/net and is still open.
        let ret = unsafe { libc::setns(self.original.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.do_restore() {
            tracing::warn!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// Check if a named namespace exists.
pub fn exists(name: &str) -> bool {
    NamespaceSpec::from(name).path().exists()
}

/// List all named network namespaces, sorted.
pub fn list() -> Result<Vec<String>> {
    let dir = match std::fs::read_dir(NETNS_RUN_DIR) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut names = Vec::new();
    for entry in dir {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
