//! Nodes, interfaces, links and routes

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use petgraph::graph::EdgeIndex;

use crate::router::RouterState;

/// Identifier of a link within a topology (declaration order)
pub type LinkId = EdgeIndex;

/// What a node is, without any configuration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Host,
    Router,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Host => f.pad("host"),
            NodeRole::Router => f.pad("router"),
        }
    }
}

/// Node capability set; only routers carry forwarding state
#[derive(Debug)]
pub enum NodeKind {
    Host,
    Router(RouterState),
}

impl NodeKind {
    pub fn role(&self) -> NodeRole {
        match self {
            NodeKind::Host => NodeRole::Host,
            NodeKind::Router(_) => NodeRole::Router,
        }
    }
}

/// One addressed attachment point on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name inside the node (e.g., "r1-eth0")
    pub name: String,
    /// Owning node
    pub node: String,
    /// Link this interface terminates
    pub link: LinkId,
    /// Address with prefix length (e.g., "10.0.0.1/24")
    pub address: IpNet,
    /// Gateway for a default route leaving through this interface
    pub default_route: Option<IpAddr>,
    /// Administrative state
    pub enabled: bool,
}

impl Interface {
    pub fn is_loopback(&self) -> bool {
        self.name == "lo"
    }
}

/// An emulated endpoint
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Primary address declared with the node
    pub address: Option<IpNet>,
    /// Declared default gateway (bound to the interface whose subnet holds it)
    pub default_gateway: Option<IpAddr>,
    pub(crate) interfaces: Vec<Interface>,
}

impl Node {
    pub(crate) fn new(name: &str, kind: NodeKind, address: Option<IpNet>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            address,
            default_gateway: None,
            interfaces: Vec::new(),
        }
    }

    pub fn role(&self) -> NodeRole {
        self.kind.role()
    }

    pub fn is_router(&self) -> bool {
        matches!(self.kind, NodeKind::Router(_))
    }

    /// Router state, if this node is a router
    pub fn router(&self) -> Option<&RouterState> {
        match &self.kind {
            NodeKind::Router(state) => Some(state),
            NodeKind::Host => None,
        }
    }

    pub(crate) fn router_mut(&mut self) -> Option<&mut RouterState> {
        match &mut self.kind {
            NodeKind::Router(state) => Some(state),
            NodeKind::Host => None,
        }
    }

    /// Current interface set
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Address probes use to reach this node
    pub fn reachable_address(&self) -> Option<IpAddr> {
        self.address
            .or_else(|| self.interfaces.first().map(|i| i.address))
            .map(|net| net.addr())
    }
}

/// One side of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
}

/// Point-to-point connection between two interfaces on distinct nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub a: Endpoint,
    pub b: Endpoint,
}

impl Link {
    pub fn endpoints(&self) -> [&Endpoint; 2] {
        [&self.a, &self.b]
    }

    /// The opposite endpoint of `(node, interface)`, if it is one of ours
    pub fn peer_of(&self, node: &str, interface: &str) -> Option<&Endpoint> {
        if self.a.node == node && self.a.interface == interface {
            Some(&self.b)
        } else if self.b.node == node && self.b.interface == interface {
            Some(&self.a)
        } else {
            None
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.a.node, self.a.interface, self.b.node, self.b.interface
        )
    }
}

/// Static route owned by a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub next_hop: IpAddr,
    pub egress: String,
}

impl Route {
    pub fn new(destination: IpNet, next_hop: IpAddr, egress: impl Into<String>) -> Self {
        Self {
            // Routes are keyed by network, not by whatever host bits were typed
            destination: destination.trunc(),
            next_hop,
            egress: egress.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev {}",
            self.destination, self.next_hop, self.egress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_truncates_destination() {
        let route = Route::new(
            "10.0.2.7/24".parse().unwrap(),
            "10.0.1.2".parse().unwrap(),
            "r1-eth1",
        );
        assert_eq!(route.destination.to_string(), "10.0.2.0/24");
        assert_eq!(route.to_string(), "10.0.2.0/24 via 10.0.1.2 dev r1-eth1");
    }

    #[test]
    fn test_link_peer() {
        let link = Link {
            a: Endpoint {
                node: "h1".into(),
                interface: "h1-eth0".into(),
            },
            b: Endpoint {
                node: "r1".into(),
                interface: "r1-eth0".into(),
            },
        };
        assert_eq!(link.peer_of("h1", "h1-eth0").unwrap().node, "r1");
        assert_eq!(link.peer_of("r1", "r1-eth0").unwrap().node, "h1");
        assert!(link.peer_of("r1", "r1-eth1").is_none());
    }
}
