//! Declarative topology graph
//!
//! Nodes are graph nodes and links are graph edges. Edge insertion order is
//! link declaration order, which also fixes realization order.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;
use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};

use crate::error::{Error, Result};
use crate::router::RouterState;
use crate::topology::types::{Endpoint, Interface, Link, LinkId, Node, NodeKind};

/// Nodes and links of an emulated network, before and after realization
#[derive(Debug, Default)]
pub struct Topology {
    graph: UnGraph<Node, Link>,
    index: HashMap<String, NodeIndex>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a host
    pub fn add_host(&mut self, name: &str, address: Option<IpNet>) -> Result<&Node> {
        self.add_node(Node::new(name, NodeKind::Host, address))
    }

    /// Declare a router
    pub fn add_router(&mut self, name: &str, address: Option<IpNet>) -> Result<&Node> {
        self.add_node(Node::new(
            name,
            NodeKind::Router(RouterState::new()),
            address,
        ))
    }

    fn add_node(&mut self, node: Node) -> Result<&Node> {
        if self.index.contains_key(&node.name) {
            return Err(Error::DuplicateName(node.name));
        }

        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(name, idx);
        Ok(&self.graph[idx])
    }

    /// Connect two declared nodes with a point-to-point link
    ///
    /// Creates one interface on each side, named exactly as given.
    pub fn add_link(
        &mut self,
        node_a: &str,
        node_b: &str,
        iface_a: &str,
        iface_b: &str,
        addr_a: IpNet,
        addr_b: IpNet,
    ) -> Result<LinkId> {
        let a = self.index_of(node_a)?;
        let b = self.index_of(node_b)?;

        if a == b {
            return Err(Error::ConfigValidation(format!(
                "Link from '{}' to itself is not point-to-point",
                node_a
            )));
        }

        for (idx, iface) in [(a, iface_a), (b, iface_b)] {
            if iface.is_empty() || iface == "lo" {
                return Err(Error::ConfigValidation(format!(
                    "Invalid interface name '{}' on '{}'",
                    iface, self.graph[idx].name
                )));
            }
            if self.graph[idx].interface(iface).is_some() {
                return Err(Error::ConfigValidation(format!(
                    "Interface '{}' already exists on '{}'",
                    iface, self.graph[idx].name
                )));
            }
        }

        let link = Link {
            a: Endpoint {
                node: node_a.to_string(),
                interface: iface_a.to_string(),
            },
            b: Endpoint {
                node: node_b.to_string(),
                interface: iface_b.to_string(),
            },
        };
        let id = self.graph.add_edge(a, b, link);

        for (idx, iface, addr) in [(a, iface_a, addr_a), (b, iface_b, addr_b)] {
            let node = &mut self.graph[idx];
            let default_route = node.default_gateway.filter(|gw| addr.contains(gw));
            node.interfaces.push(Interface {
                name: iface.to_string(),
                node: node.name.clone(),
                link: id,
                address: addr,
                default_route,
                enabled: true,
            });
        }

        Ok(id)
    }

    /// Declare the default gateway of a node
    ///
    /// The directive lands on the interface whose subnet contains the
    /// gateway, now or when that interface is added later.
    pub fn set_default_route(&mut self, name: &str, gateway: IpAddr) -> Result<()> {
        let idx = self.index_of(name)?;
        let node = &mut self.graph[idx];
        node.default_gateway = Some(gateway);
        for iface in &mut node.interfaces {
            iface.default_route = iface.address.contains(&gateway).then_some(gateway);
        }
        Ok(())
    }

    /// Change the administrative state of an interface
    pub fn set_interface_enabled(&mut self, node: &str, iface: &str, enabled: bool) -> Result<()> {
        let idx = self.index_of(node)?;
        let node = &mut self.graph[idx];
        let name = node.name.clone();
        let iface = node
            .interfaces
            .iter_mut()
            .find(|i| i.name == iface)
            .ok_or_else(|| {
                Error::ConfigValidation(format!("Interface '{}' not found on '{}'", iface, name))
            })?;
        iface.enabled = enabled;
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|idx| &self.graph[*idx])
    }

    pub(crate) fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        let idx = self.index_of(name)?;
        Ok(&mut self.graph[idx])
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    /// Router nodes in declaration order
    pub fn routers(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| n.is_router())
    }

    /// All links in declaration order
    pub fn links(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.graph
            .edge_indices()
            .map(|id| (id, &self.graph[id]))
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.graph.edge_weight(id)
    }

    /// Interfaces currently configured on a node
    pub fn interfaces(&self, name: &str) -> Result<&[Interface]> {
        let idx = self.index_of(name)?;
        Ok(self.graph[idx].interfaces())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Resolve a probe target: either a literal address or a node name
    pub fn resolve_address(&self, target: &str) -> Result<IpAddr> {
        if let Ok(addr) = target.parse::<IpAddr>() {
            return Ok(addr);
        }

        let node = self
            .node(target)
            .ok_or_else(|| Error::UnknownNode(target.to_string()))?;
        node.reachable_address().ok_or_else(|| {
            Error::ConfigValidation(format!("Node '{}' has no address to probe", target))
        })
    }

    /// Node owning an interface address, if any
    pub fn owner_of(&self, addr: IpAddr) -> Option<&Node> {
        self.nodes()
            .find(|n| n.interfaces.iter().any(|i| i.address.addr() == addr))
    }

    /// Whether every node can reach every other node over links
    pub fn is_connected(&self) -> bool {
        connected_components(&self.graph) <= 1
    }

    /// Check that every interface is an endpoint of exactly the link it names
    pub fn verify_wiring(&self) -> Result<()> {
        for node in self.nodes() {
            for iface in &node.interfaces {
                let link = self.link(iface.link).ok_or_else(|| {
                    Error::ConfigValidation(format!(
                        "Interface '{}' on '{}' has no link",
                        iface.name, node.name
                    ))
                })?;
                if link.peer_of(&node.name, &iface.name).is_none() {
                    return Err(Error::ConfigValidation(format!(
                        "Interface '{}' on '{}' is not an endpoint of {}",
                        iface.name, node.name, link
                    )));
                }
            }
        }

        for (_, link) in self.links() {
            for end in link.endpoints() {
                let owned = self
                    .node(&end.node)
                    .and_then(|n| n.interface(&end.interface))
                    .is_some();
                if !owned {
                    return Err(Error::ConfigValidation(format!(
                        "Link {} references missing interface {}:{}",
                        link, end.node, end.interface
                    )));
                }
            }
        }

        Ok(())
    }
}
