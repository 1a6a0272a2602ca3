//! In-memory substrate
//!
//! Records every call and emulates just enough of a Linux IPv4 stack to
//! answer the commands the lab issues:
//! - `sysctl -w net.ipv4.ip_forward=N` and `net.ipv4.conf.<iface>.rp_filter=N`
//! - `ip route add|replace <dst> via <gw> [dev <iface>]`
//! - `ip link set <iface> up|down`
//! - `ping [-c N] [-W T] <addr>`, answered by walking the modeled forwarding path
//!
//! Clones share state, so a test can keep a clone for inspection after the
//! lab that owns the substrate has been dropped.

use crate::error::{Error, Result};
use crate::substrate::{CommandOutput, NodeHandle, Substrate, command_line};
use crate::topology::NodeRole;
use ipnet::IpNet;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::rc::Rc;

/// rp_filter value for strict reverse-path checking
const RP_STRICT: u8 = 1;

/// rp_filter value for loose reverse-path checking
const RP_LOOSE: u8 = 2;

/// Hop limit for a single direction of a probe
const MAX_HOPS: u8 = 64;

const NO_SUCH_FILE: &str = "No such file or directory";

/// One recorded substrate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateNode { name: String, role: NodeRole },
    CreateLink { a: String, iface_a: String, b: String, iface_b: String },
    Execute { node: String, command: String },
    Destroy { node: String },
}

#[derive(Debug)]
struct MemIface {
    name: String,
    address: IpNet,
    up: bool,
}

#[derive(Debug, Clone)]
struct MemRoute {
    destination: IpNet,
    via: Option<IpAddr>,
    dev: String,
}

#[derive(Debug)]
struct MemNode {
    name: String,
    forwarding: bool,
    /// rp_filter per conf key ("all", "default", "lo", interfaces)
    rp_filter: BTreeMap<String, u8>,
    interfaces: Vec<MemIface>,
    routes: Vec<MemRoute>,
}

impl MemNode {
    fn new(name: &str) -> Self {
        // Distribution default: strict filtering everywhere
        let rp_filter = [("all", RP_STRICT), ("default", RP_STRICT), ("lo", 0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        Self {
            name: name.to_string(),
            forwarding: false,
            rp_filter,
            interfaces: Vec::new(),
            routes: Vec::new(),
        }
    }

    fn iface(&self, name: &str) -> Option<&MemIface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    fn carries(&self, name: &str) -> bool {
        self.iface(name).is_some_and(|i| i.up)
    }

    fn owns(&self, addr: IpAddr) -> bool {
        addr.is_loopback() || self.interfaces.iter().any(|i| i.address.addr() == addr)
    }

    /// Longest-prefix match; connected subnets win ties
    ///
    /// Returns the egress interface and the next-hop address to resolve.
    fn lookup(&self, dst: IpAddr) -> Option<(String, IpAddr)> {
        let mut best: Option<(u8, &str, IpAddr)> = None;

        for iface in self.interfaces.iter().filter(|i| i.up) {
            let net = iface.address.trunc();
            if net.contains(&dst) && best.is_none_or(|(len, _, _)| net.prefix_len() > len) {
                best = Some((net.prefix_len(), iface.name.as_str(), dst));
            }
        }

        for route in self.routes.iter().filter(|r| self.carries(&r.dev)) {
            let len = route.destination.prefix_len();
            if route.destination.contains(&dst)
                && best.is_none_or(|(best_len, _, _)| len > best_len)
            {
                best = Some((len, route.dev.as_str(), route.via.unwrap_or(dst)));
            }
        }

        best.map(|(_, dev, hop)| (dev.to_string(), hop))
    }

    /// Effective rp_filter for an interface: max(all, iface)
    fn rp_mode(&self, iface: &str) -> u8 {
        let all = self.rp_filter.get("all").copied().unwrap_or(0);
        let own = self.rp_filter.get(iface).copied().unwrap_or(0);
        all.max(own)
    }

    /// Reverse-path check for a packet from `src` arriving on `iface`
    fn accepts(&self, iface: &str, src: IpAddr) -> bool {
        match self.rp_mode(iface) {
            0 => true,
            RP_LOOSE => self.lookup(src).is_some(),
            _ => self.lookup(src).is_some_and(|(egress, _)| egress == iface),
        }
    }
}

#[derive(Debug)]
struct MemLink {
    a: (NodeHandle, String),
    b: (NodeHandle, String),
}

#[derive(Debug, Default)]
struct MemoryState {
    next: u32,
    nodes: BTreeMap<NodeHandle, MemNode>,
    links: Vec<MemLink>,
    calls: Vec<Call>,
    /// (node, command substring) pairs that exit non-zero
    failures: Vec<(String, String)>,
    /// Nodes whose commands the substrate refuses to run
    refused: Vec<String>,
}

impl MemoryState {
    fn name_of(&self, handle: NodeHandle) -> Result<String> {
        self.nodes
            .get(&handle)
            .map(|n| n.name.clone())
            .ok_or_else(|| Error::Substrate(format!("Unknown node handle {}", handle)))
    }

    fn peer(&self, node: NodeHandle, iface: &str) -> Option<(NodeHandle, &str)> {
        self.links.iter().find_map(|link| {
            if link.a.0 == node && link.a.1 == iface {
                Some((link.b.0, link.b.1.as_str()))
            } else if link.b.0 == node && link.b.1 == iface {
                Some((link.a.0, link.a.1.as_str()))
            } else {
                None
            }
        })
    }

    /// Walk the forwarding path of one packet
    ///
    /// Returns the node that accepted it and the number of hops taken.
    fn deliver(&self, origin: NodeHandle, src: IpAddr, dst: IpAddr) -> Option<(NodeHandle, u8)> {
        let mut current = origin;
        let mut ingress: Option<&str> = None;
        let mut hops = 0u8;

        loop {
            let node = self.nodes.get(&current)?;

            if let Some(iface) = ingress {
                if !node.accepts(iface, src) {
                    return None;
                }
            }

            if node.owns(dst) {
                return Some((current, hops));
            }

            if ingress.is_some() && !node.forwarding {
                return None;
            }

            let (egress, next_hop) = node.lookup(dst)?;
            let (peer, peer_iface) = self.peer(current, &egress)?;

            // Point-to-point: the next hop resolves only if it is the peer end
            let resolved = self
                .nodes
                .get(&peer)
                .and_then(|p| p.iface(peer_iface))
                .is_some_and(|i| i.up && i.address.addr() == next_hop);
            if !resolved {
                return None;
            }

            hops += 1;
            if hops > MAX_HOPS {
                return None;
            }
            current = peer;
            ingress = Some(peer_iface);
        }
    }

    fn run(&mut self, handle: NodeHandle, args: &[&str]) -> CommandOutput {
        match args {
            ["sysctl", "-w", setting] => self.sysctl(handle, setting),
            ["ip", "route", op @ ("add" | "replace"), rest @ ..] => {
                self.route(handle, *op == "replace", rest)
            }
            ["ip", "link", "set", dev, state @ ("up" | "down")] => {
                self.link_state(handle, dev, *state == "up")
            }
            ["ping", rest @ ..] => self.ping(handle, rest),
            [] => failure(1, "empty command"),
            [cmd, ..] => failure(127, &format!("sh: 1: {}: not found", cmd)),
        }
    }

    fn sysctl(&mut self, handle: NodeHandle, setting: &str) -> CommandOutput {
        let Some((key, value)) = setting.split_once('=') else {
            return failure(
                255,
                &format!("sysctl: \"{}\" must be of the form name=value", setting),
            );
        };
        let Ok(value) = value.trim().parse::<u8>() else {
            return failure(255, &format!("sysctl: setting key \"{}\": Invalid argument", key));
        };
        let Some(node) = self.nodes.get_mut(&handle) else {
            return failure(255, "sysctl: no such node");
        };

        if key == "net.ipv4.ip_forward" {
            node.forwarding = value != 0;
        } else if let Some(iface) = key
            .strip_prefix("net.ipv4.conf.")
            .and_then(|k| k.strip_suffix(".rp_filter"))
        {
            if !node.rp_filter.contains_key(iface) {
                return failure(
                    255,
                    &format!(
                        "sysctl: cannot stat /proc/sys/net/ipv4/conf/{}/rp_filter: {}",
                        iface, NO_SUCH_FILE
                    ),
                );
            }
            node.rp_filter.insert(iface.to_string(), value);
        } else {
            return failure(
                255,
                &format!(
                    "sysctl: cannot stat /proc/sys/{}: {}",
                    key.replace('.', "/"),
                    NO_SUCH_FILE
                ),
            );
        }

        CommandOutput {
            status: 0,
            stdout: format!("{} = {}\n", key, value),
            stderr: String::new(),
        }
    }

    fn route(&mut self, handle: NodeHandle, replace: bool, args: &[&str]) -> CommandOutput {
        let Some((dst, rest)) = args.split_first() else {
            return failure(1, "Error: any valid prefix is expected rather than \"\".");
        };

        let dst = if *dst == "default" { "0.0.0.0/0" } else { *dst };
        let destination = if let Ok(net) = dst.parse::<IpNet>() {
            net.trunc()
        } else if let Ok(addr) = dst.parse::<IpAddr>() {
            IpNet::from(addr)
        } else {
            return failure(
                1,
                &format!("Error: any valid prefix is expected rather than \"{}\".", dst),
            );
        };

        let mut via = None;
        let mut dev = None;
        let mut rest = rest.iter();
        while let Some(word) = rest.next() {
            match (*word, rest.next()) {
                ("via", Some(gw)) => match gw.parse::<IpAddr>() {
                    Ok(gw) => via = Some(gw),
                    Err(_) => {
                        return failure(
                            1,
                            &format!("Error: inet address is expected rather than \"{}\".", gw),
                        );
                    }
                },
                ("dev", Some(name)) => dev = Some(name.to_string()),
                (other, _) => {
                    return failure(
                        1,
                        &format!(
                            "Error: either \"to\" is duplicate, or \"{}\" is a garbage.",
                            other
                        ),
                    );
                }
            }
        }

        let Some(node) = self.nodes.get_mut(&handle) else {
            return failure(1, "RTNETLINK answers: No such process");
        };

        if let Some(name) = &dev {
            if node.iface(name).is_none() {
                return failure(1, &format!("Cannot find device \"{}\"", name));
            }
        }

        // The gateway must sit on a connected subnet (of the named device)
        let dev = match (via, dev) {
            (Some(gw), dev) => {
                let onlink = node.interfaces.iter().find(|i| {
                    i.address.trunc().contains(&gw) && dev.as_ref().is_none_or(|d| *d == i.name)
                });
                match onlink {
                    Some(iface) => iface.name.clone(),
                    None => return failure(2, "Error: Nexthop has invalid gateway."),
                }
            }
            (None, Some(dev)) => dev,
            (None, None) => return failure(2, "Error: Device for nexthop is not up."),
        };

        let existing = node.routes.iter().position(|r| r.destination == destination);
        let route = MemRoute { destination, via, dev };
        match existing {
            Some(_) if !replace => return failure(2, "RTNETLINK answers: File exists"),
            Some(idx) => node.routes[idx] = route,
            None => node.routes.push(route),
        }

        CommandOutput::default()
    }

    fn link_state(&mut self, handle: NodeHandle, dev: &str, up: bool) -> CommandOutput {
        let iface = self
            .nodes
            .get_mut(&handle)
            .and_then(|n| n.interfaces.iter_mut().find(|i| i.name == dev));
        match iface {
            Some(iface) => {
                iface.up = up;
                CommandOutput::default()
            }
            None => failure(1, &format!("Cannot find device \"{}\"", dev)),
        }
    }

    fn ping(&self, handle: NodeHandle, args: &[&str]) -> CommandOutput {
        let mut count = 1u32;
        let mut target = None;
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match *arg {
                "-c" => {
                    count = args.next().and_then(|c| c.parse().ok()).unwrap_or(1);
                }
                "-W" | "-w" | "-i" => {
                    args.next();
                }
                other => target = Some(other),
            }
        }

        let Some(target) = target else {
            return failure(2, "ping: usage error: Destination address required");
        };
        let Ok(dst) = target.parse::<IpAddr>() else {
            return failure(2, &format!("ping: {}: Name or service not known", target));
        };
        let Some(node) = self.nodes.get(&handle) else {
            return failure(2, "ping: connect: Network is unreachable");
        };

        let src = if node.owns(dst) {
            dst
        } else {
            match node.lookup(dst).and_then(|(egress, _)| node.iface(&egress)) {
                Some(iface) => iface.address.addr(),
                None => return failure(2, "ping: connect: Network is unreachable"),
            }
        };

        let reply_hops = self
            .deliver(handle, src, dst)
            .and_then(|(owner, _)| self.deliver(owner, dst, src))
            .filter(|(back, _)| *back == handle)
            .map(|(_, hops)| hops);

        let mut stdout = format!("PING {dst} ({dst}) 56(84) bytes of data.\n");
        let (received, loss, status) = match reply_hops {
            Some(hops) => {
                for seq in 1..=count {
                    stdout.push_str(&format!(
                        "64 bytes from {}: icmp_seq={} ttl={} time=0.050 ms\n",
                        dst,
                        seq,
                        64 - hops.saturating_sub(1).min(63)
                    ));
                }
                (count, 0, 0)
            }
            None => (0, 100, 1),
        };

        stdout.push_str(&format!("\n--- {} ping statistics ---\n", dst));
        stdout.push_str(&format!(
            "{} packets transmitted, {} received, {}% packet loss, time 0ms\n",
            count, received, loss
        ));
        if received > 0 {
            stdout.push_str("rtt min/avg/max/mdev = 0.050/0.050/0.050/0.000 ms\n");
        }

        CommandOutput {
            status,
            stdout,
            stderr: String::new(),
        }
    }

}

fn failure(status: i32, message: &str) -> CommandOutput {
    CommandOutput {
        status,
        stdout: String::new(),
        stderr: format!("{}\n", message),
    }
}

/// Substrate that keeps the whole emulated network in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySubstrate {
    state: Rc<RefCell<MemoryState>>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commands on `node` containing `needle` exit non-zero
    pub fn fail_command(&self, node: &str, needle: &str) {
        self.state
            .borrow_mut()
            .failures
            .push((node.to_string(), needle.to_string()));
    }

    /// Refuse to run any command on `node`
    pub fn refuse(&self, node: &str) {
        self.state.borrow_mut().refused.push(node.to_string());
    }

    /// Number of live nodes
    pub fn node_count(&self) -> usize {
        self.state.borrow().nodes.len()
    }

    /// Number of live links
    pub fn link_count(&self) -> usize {
        self.state.borrow().links.len()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Commands executed on a node, in order
    pub fn commands(&self, node: &str) -> Vec<String> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Execute { node: n, command } if n == node => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn forwarding(&self, node: &str) -> Option<bool> {
        self.with_node(node, |n| n.forwarding)
    }

    pub fn rp_filter(&self, node: &str, key: &str) -> Option<u8> {
        self.with_node(node, |n| n.rp_filter.get(key).copied()).flatten()
    }

    /// Routing table of a node in `ip route` style
    pub fn routes(&self, node: &str) -> Vec<String> {
        self.with_node(node, |n| {
            n.routes
                .iter()
                .map(|r| match r.via {
                    Some(via) => format!("{} via {} dev {}", r.destination, via, r.dev),
                    None => format!("{} dev {}", r.destination, r.dev),
                })
                .collect()
        })
        .unwrap_or_default()
    }

    fn with_node<T>(&self, name: &str, f: impl FnOnce(&MemNode) -> T) -> Option<T> {
        let state = self.state.borrow();
        state.nodes.values().find(|n| n.name == name).map(f)
    }
}

impl Substrate for MemorySubstrate {
    fn create_node(&mut self, name: &str, role: NodeRole) -> Result<NodeHandle> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::CreateNode {
            name: name.to_string(),
            role,
        });

        if state.nodes.values().any(|n| n.name == name) {
            return Err(Error::Substrate(format!("Node '{}' already exists", name)));
        }

        let handle = NodeHandle(state.next);
        state.next += 1;
        state.nodes.insert(handle, MemNode::new(name));
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
        let mut state = self.state.borrow_mut();
        let name_a = state.name_of(a)?;
        let name_b = state.name_of(b)?;
        state.calls.push(Call::CreateLink {
            a: name_a.clone(),
            iface_a: iface_a.to_string(),
            b: name_b.clone(),
            iface_b: iface_b.to_string(),
        });

        for (handle, iface, node) in [(a, iface_a, &name_a), (b, iface_b, &name_b)] {
            if state.nodes.get(&handle).is_some_and(|n| n.iface(iface).is_some()) {
                return Err(Error::Substrate(format!(
                    "Interface '{}' already exists on '{}'",
                    iface, node
                )));
            }
        }

        for (handle, iface, addr) in [(a, iface_a, addr_a), (b, iface_b, addr_b)] {
            if let Some(node) = state.nodes.get_mut(&handle) {
                let inherited = node.rp_filter.get("default").copied().unwrap_or(0);
                node.rp_filter.insert(iface.to_string(), inherited);
                node.interfaces.push(MemIface {
                    name: iface.to_string(),
                    address: *addr,
                    up: true,
                });
            }
        }

        state.links.push(MemLink {
            a: (a, iface_a.to_string()),
            b: (b, iface_b.to_string()),
        });
        Ok(())
    }

    fn execute(&mut self, node: NodeHandle, command: &[&str]) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        let name = state.name_of(node)?;
        let line = command_line(command);
        state.calls.push(Call::Execute {
            node: name.clone(),
            command: line.clone(),
        });

        if state.refused.contains(&name) {
            return Err(Error::Substrate(format!(
                "Node '{}' refused to run '{}'",
                name, line
            )));
        }

        if let Some((_, needle)) = state
            .failures
            .iter()
            .find(|(n, needle)| *n == name && line.contains(needle.as_str()))
        {
            return Ok(failure(2, &format!("RTNETLINK answers: injected failure ({})", needle)));
        }

        Ok(state.run(node, command))
    }

    fn destroy(&mut self, node: NodeHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let Some(removed) = state.nodes.remove(&node) else {
            return Ok(());
        };
        state.calls.push(Call::Destroy {
            node: removed.name.clone(),
        });

        // Deleting one veth end deletes its peer, and routes through it
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.links)
            .into_iter()
            .partition(|l| l.a.0 == node || l.b.0 == node);
        state.links = kept;

        for link in gone {
            let (peer, iface) = if link.a.0 == node { link.b } else { link.a };
            if let Some(peer) = state.nodes.get_mut(&peer) {
                peer.interfaces.retain(|i| i.name != iface);
                peer.routes.retain(|r| r.dev != iface);
                peer.rp_filter.remove(&iface);
            }
        }

        Ok(())
    }
}
