//! Emulation substrate
//!
//! The narrow contract the lab needs from whatever actually isolates nodes
//! and moves packets:
//! - `NetnsSubstrate`: Linux network namespaces joined by veth pairs
//! - `MemorySubstrate`: in-memory emulator that records every call

pub mod memory;
pub mod netns;

pub use memory::MemorySubstrate;
pub use netns::NetnsSubstrate;

use crate::error::Result;
use crate::topology::NodeRole;
use ipnet::IpNet;
use std::fmt;

/// Opaque handle to a node created on a substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub(crate) u32);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Output of a command run inside a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status (non-zero on failure)
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Combined output exactly as a terminal would show it
    pub fn raw(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Text explaining a failure, preferring stderr
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            let stdout = self.stdout.trim();
            if stdout.is_empty() {
                format!("exit status {}", self.status)
            } else {
                stdout.to_string()
            }
        } else {
            stderr.to_string()
        }
    }
}

/// Runtime that creates isolated nodes, wires them, and runs commands in them
///
/// Every call blocks until the substrate has finished.
pub trait Substrate {
    /// Create an isolated node
    fn create_node(&mut self, name: &str, role: NodeRole) -> Result<NodeHandle>;

    /// Create a point-to-point link and address both ends
    fn create_link(
        &mut self,
        a: NodeHandle,
        iface_a: &str,
        addr_a: &IpNet,
        b: NodeHandle,
        iface_b: &str,
        addr_b: &IpNet,
    ) -> Result<()>;

    /// Run a command inside a node
    ///
    /// A command that ran and exited non-zero is `Ok`; `Err` means the
    /// substrate could not run it at all.
    fn execute(&mut self, node: NodeHandle, command: &[&str]) -> Result<CommandOutput>;

    /// Destroy a node and every link attached to it
    fn destroy(&mut self, node: NodeHandle) -> Result<()>;
}

/// Render a command the way it would be typed
pub fn command_line(command: &[&str]) -> String {
    command.join(" ")
}
