//! Linux network namespace substrate
//!
//! Each node is a named network namespace with loopback up. Links are veth
//! pairs created directly inside the two namespaces, so interface names
//! only need to be unique per node. Deleting a namespace destroys the veth
//! ends it holds, which takes the peer end with it.

use crate::error::{Error, Result};
use crate::substrate::{CommandOutput, NodeHandle, Substrate, command_line};
use crate::topology::NodeRole;
use ipnet::IpNet;
use nix::unistd::Uid;
use std::collections::HashMap;
use std::process::{Command, Output};
use tracing::{debug, warn};

/// Linux netdev name limit (IFNAMSIZ - 1)
const MAX_IFACE_NAME: usize = 15;

/// Exit status `ip` uses when it cannot enter the namespace
const IP_FATAL: i32 = 255;

/// Tell a command that `ip netns exec` never started apart from one that
/// ran and failed. Both can exit 1, so stderr decides.
fn exec_refusal(status: Option<i32>, stderr: &str) -> Option<String> {
    let stderr = stderr.trim();
    if stderr.starts_with("exec of \"") || stderr.contains("Cannot open network namespace") {
        return Some(stderr.lines().next().unwrap_or(stderr).to_string());
    }
    match status {
        Some(IP_FATAL) => Some(format!("ip exited with status {}", IP_FATAL)),
        None => Some("killed by a signal".to_string()),
        _ => None,
    }
}

/// Substrate backed by `ip netns` and veth pairs
#[derive(Debug)]
pub struct NetnsSubstrate {
    /// Prefix for namespace names (e.g., "exp1")
    prefix: String,
    /// Run every command through sudo
    sudo: bool,
    /// Live namespaces by handle
    namespaces: HashMap<NodeHandle, String>,
    next: u32,
}

impl NetnsSubstrate {
    /// Create a substrate, checking that namespaces can be managed
    pub fn new(prefix: &str, sudo: bool) -> Result<Self> {
        if !sudo && !Uid::effective().is_root() {
            return Err(Error::InsufficientPrivileges(
                "network namespaces require root (or set `sudo = true`)".into(),
            ));
        }

        Ok(Self {
            prefix: Self::sanitize_name(prefix),
            sudo,
            namespaces: HashMap::new(),
            next: 0,
        })
    }

    /// Namespace name for a node
    pub fn namespace_name(&self, node: &str) -> String {
        format!("{}-{}", self.prefix, Self::sanitize_name(node))
    }

    fn namespace(&self, node: NodeHandle) -> Result<&str> {
        self.namespaces
            .get(&node)
            .map(String::as_str)
            .ok_or_else(|| Error::Substrate(format!("No namespace for node {}", node)))
    }

    /// Run a host command, returning raw output
    fn run(&self, args: &[&str]) -> Result<Output> {
        let (program, rest): (&str, &[&str]) = if self.sudo {
            ("sudo", args)
        } else {
            let (program, rest) = args
                .split_first()
                .ok_or_else(|| Error::Substrate("Empty command".into()))?;
            (*program, rest)
        };

        Command::new(program)
            .args(rest)
            .output()
            .map_err(|e| Error::CommandFailed {
                command: command_line(args),
                message: e.to_string(),
            })
    }

    /// Run a host command, failing with its stderr if it exits non-zero
    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: command_line(args),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn exec_checked(&self, ns: &str, args: &[&str]) -> Result<Output> {
        let mut full = vec!["ip", "netns", "exec", ns];
        full.extend_from_slice(args);
        self.run_checked(&full)
    }

    fn check_iface_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_IFACE_NAME {
            return Err(Error::Substrate(format!(
                "Interface name '{}' must be 1-{} characters",
                name, MAX_IFACE_NAME
            )));
        }
        Ok(())
    }

    /// Sanitize a name for use in namespace names
    fn sanitize_name(name: &str) -> String {
        let sanitized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();

        if sanitized.is_empty() {
            "lab".to_string()
        } else {
            sanitized
        }
    }
}

impl Substrate for NetnsSubstrate {
    fn create_node(&mut self, name: &str, role: NodeRole) -> Result<NodeHandle> {
        let ns = self.namespace_name(name);

        // Clean up stale namespace left by an interrupted run
        let _ = self.run(&["ip", "netns", "del", &ns]);

        self.run_checked(&["ip", "netns", "add", &ns])
            .map_err(|e| Error::Substrate(format!("Failed to create namespace '{}': {}", ns, e)))?;

        // The caller never sees a handle for a node that failed here, so
        // the namespace has to go before returning
        if let Err(e) = self.exec_checked(&ns, &["ip", "link", "set", "lo", "up"]) {
            if let Err(del) = self.run_checked(&["ip", "netns", "del", &ns]) {
                warn!(ns = %ns, error = %del, "failed to remove half-built namespace");
            }
            return Err(Error::Substrate(format!(
                "Failed to bring up lo in '{}': {}",
                ns, e
            )));
        }

        let handle = NodeHandle(self.next);
        self.next += 1;
        self.namespaces.insert(handle, ns.clone());

        debug!(ns = %ns, %role, %handle, "created network namespace");
        Ok(handle)
    }

    fn create_link(
        &mut self,
        a: NodeHandle,
        iface_a: &str,
        addr_a: &IpNet,
        b: NodeHandle,
        iface_b: &str,
        addr_b: &IpNet,
    ) -> Result<()> {
        Self::check_iface_name(iface_a)?;
        Self::check_iface_name(iface_b)?;

        let ns_a = self.namespace(a)?.to_string();
        let ns_b = self.namespace(b)?.to_string();

        self.run_checked(&[
            "ip", "link", "add", iface_a, "netns", &ns_a, "type", "veth", "peer", "name",
            iface_b, "netns", &ns_b,
        ])
        .map_err(|e| {
            Error::Substrate(format!(
                "Failed to create veth {}/{}: {}",
                iface_a, iface_b, e
            ))
        })?;

        for (ns, iface, addr) in [(&ns_a, iface_a, addr_a), (&ns_b, iface_b, addr_b)] {
            let addr = addr.to_string();
            self.exec_checked(ns, &["ip", "addr", "add", &addr, "dev", iface])
                .map_err(|e| {
                    Error::Substrate(format!("Failed to address {} in '{}': {}", iface, ns, e))
                })?;
            self.exec_checked(ns, &["ip", "link", "set", iface, "up"])
                .map_err(|e| {
                    Error::Substrate(format!("Failed to bring up {} in '{}': {}", iface, ns, e))
                })?;
        }

        debug!(ns_a = %ns_a, ns_b = %ns_b, iface_a, iface_b, "veth link configured");
        Ok(())
    }

    fn execute(&mut self, node: NodeHandle, command: &[&str]) -> Result<CommandOutput> {
        let ns = self.namespace(node)?;
        let mut full = vec!["ip", "netns", "exec", ns];
        full.extend_from_slice(command);

        let output = self.run(&full)?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if let Some(reason) = exec_refusal(output.status.code(), &stderr) {
            return Err(Error::Substrate(format!(
                "Cannot run '{}' in '{}': {}",
                command_line(command),
                ns,
                reason
            )));
        }

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    fn destroy(&mut self, node: NodeHandle) -> Result<()> {
        let Some(ns) = self.namespaces.remove(&node) else {
            return Ok(());
        };

        let output = self.run(&["ip", "netns", "del", &ns])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Don't fail if already gone
            if !stderr.contains("No such file") {
                return Err(Error::Substrate(format!(
                    "Failed to delete namespace '{}': {}",
                    ns,
                    stderr.trim()
                )));
            }
            warn!(ns = %ns, "namespace was already gone");
        }

        debug!(ns = %ns, "deleted network namespace");
        Ok(())
    }
}

impl Drop for NetnsSubstrate {
    fn drop(&mut self) {
        let namespaces = std::mem::take(&mut self.namespaces);
        for ns in namespaces.into_values() {
            let result = self.run_checked(&["ip", "netns", "del", &ns]);
            match result {
                Ok(_) => debug!(ns = %ns, "deleted leftover network namespace"),
                Err(e) => warn!(ns = %ns, error = %e, "failed to delete network namespace"),
            }
        }
    }
}
