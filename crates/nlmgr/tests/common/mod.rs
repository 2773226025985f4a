//! Common test utilities for integration tests.
//!
//! Provides `TestNamespace` for isolated network namespace testing
//! and helper macros for conditional test execution.

use nlmgr::Result;
use nlmgr::netlink::link::{LinkKind, NewLink};
use nlmgr::netlink::{Connection, NamespaceSpec, Protocol};
use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Global counter for unique namespace names.
static NAMESPACE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a unique namespace name for this test.
fn unique_ns_name(prefix: &str) -> String {
    let id = NAMESPACE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let pid = std::process::id();
    format!("nlmgr-test-{}-{}-{}", prefix, pid, id)
}

/// A network namespace deleted on drop.
///
/// Created with `ip netns add` so it shows up under `/var/run/netns` and
/// can be addressed by name.
pub struct TestNamespace {
    name: String,
}

impl TestNamespace {
    pub fn new(prefix: &str) -> Result<Self> {
        let name = unique_ns_name(prefix);

        let status = Command::new("ip")
            .args(["netns", "add", &name])
            .status()
            .map_err(|e| nlmgr::Error::Io(io::Error::from(e.kind())))?;

        if !status.success() {
            return Err(nlmgr::Error::InvalidMessage(format!(
                "failed to create namespace: {}",
                name
            )));
        }

        Ok(Self { name })
    }

    pub fn spec(&self) -> NamespaceSpec {
        NamespaceSpec::Named(self.name.clone())
    }

    /// Open a connection inside the namespace.
    pub fn connection(&self, protocol: Protocol) -> Result<Connection> {
        Connection::for_namespace(protocol, self.spec())
    }

    /// Run a command in the namespace and return its output.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("ip")
            .args(["netns", "exec", &self.name, cmd])
            .args(args)
            .output()
            .map_err(|e| nlmgr::Error::Io(io::Error::from(e.kind())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(nlmgr::Error::InvalidMessage(format!(
                "command failed: {} {:?}: {}",
                cmd, args, stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let _ = Command::new("ip")
            .args(["netns", "del", &self.name])
            .status();
    }
}

/// Create an up dummy interface and return its index.
pub async fn add_dummy(conn: &Connection, name: &str) -> Result<u32> {
    conn.link_add(&NewLink::new(name, LinkKind::Dummy)).await?;
    let link = conn.link_by_name(name).await?;
    conn.link_set_up(link.index).await?;
    Ok(link.index)
}

/// Check if running as root.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Skip the test if not running as root.
///
/// Use this at the beginning of integration tests that require root privileges.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ns_name() {
        let name1 = unique_ns_name("test");
        let name2 = unique_ns_name("test");
        assert_ne!(name1, name2);
        assert!(name1.starts_with("nlmgr-test-test-"));
    }
}
