//! Lab lifecycle: realize a topology on a substrate and tear it down
//!
//! Handles:
//! - Creating nodes, then links, then default routes, in declaration order
//! - Running commands inside realized nodes
//! - Releasing every substrate node on teardown, including after errors

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::substrate::{CommandOutput, NodeHandle, Substrate};
use crate::topology::{LinkId, Topology};

/// A topology together with the substrate resources realizing it
pub struct Lab<S: Substrate> {
    pub(crate) topology: Topology,
    pub(crate) substrate: S,

    /// Node name -> substrate handle (present once created)
    handles: HashMap<String, NodeHandle>,

    /// Creation order, for reverse-order teardown
    created: Vec<String>,

    /// Links already created on the substrate
    wired: HashSet<LinkId>,

    realized: bool,
}

impl<S: Substrate> Lab<S> {
    pub fn new(topology: Topology, substrate: S) -> Self {
        Self {
            topology,
            substrate,
            handles: HashMap::new(),
            created: Vec::new(),
            wired: HashSet::new(),
            realized: false,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    /// Create every node and link on the substrate
    ///
    /// On failure the nodes created so far stay tracked and are released by
    /// `teardown` (or on drop).
    pub fn realize(&mut self) -> Result<()> {
        if self.is_realized() {
            return Ok(());
        }

        let nodes: Vec<_> = self
            .topology
            .nodes()
            .map(|n| (n.name.clone(), n.role()))
            .collect();

        for (name, role) in nodes {
            if self.handles.contains_key(&name) {
                continue;
            }
            let handle = self.substrate.create_node(&name, role)?;
            debug!(node = %name, %role, %handle, "node created");
            self.handles.insert(name.clone(), handle);
            self.created.push(name);
        }

        let links: Vec<LinkId> = self.topology.links().map(|(id, _)| id).collect();
        for id in links {
            self.wire(id)?;
        }

        let names: Vec<String> = self.topology.nodes().map(|n| n.name.clone()).collect();
        for name in names {
            self.install_default_routes(&name, None)?;
        }

        self.realized = true;
        info!(
            nodes = self.topology.node_count(),
            links = self.topology.link_count(),
            "topology realized"
        );
        Ok(())
    }

    /// Declare a link, creating it immediately if the lab is already realized
    pub fn add_link(
        &mut self,
        node_a: &str,
        node_b: &str,
        iface_a: &str,
        iface_b: &str,
        addr_a: IpNet,
        addr_b: IpNet,
    ) -> Result<LinkId> {
        let id = self
            .topology
            .add_link(node_a, node_b, iface_a, iface_b, addr_a, addr_b)?;

        if self.realized {
            self.wire(id)?;
            self.install_default_routes(node_a, Some(iface_a))?;
            self.install_default_routes(node_b, Some(iface_b))?;
        }

        Ok(id)
    }

    fn wire(&mut self, id: LinkId) -> Result<()> {
        if self.wired.contains(&id) {
            return Ok(());
        }

        let link = self
            .topology
            .link(id)
            .ok_or_else(|| Error::Substrate(format!("Link {:?} not declared", id)))?
            .clone();

        let iface_of = |node: &str, iface: &str| -> Result<(IpNet, bool)> {
            self.topology
                .node(node)
                .and_then(|n| n.interface(iface))
                .map(|i| (i.address, i.enabled))
                .ok_or_else(|| Error::UnknownNode(node.to_string()))
        };
        let (addr_a, enabled_a) = iface_of(&link.a.node, &link.a.interface)?;
        let (addr_b, enabled_b) = iface_of(&link.b.node, &link.b.interface)?;

        let a = self.handle(&link.a.node)?;
        let b = self.handle(&link.b.node)?;
        self.substrate
            .create_link(a, &link.a.interface, &addr_a, b, &link.b.interface, &addr_b)?;

        debug!(%link, "link created");
        self.wired.insert(id);

        // Links come up enabled; honor interfaces declared down
        for (end, enabled) in [(&link.a, enabled_a), (&link.b, enabled_b)] {
            if !enabled {
                self.apply(&end.node, &["ip", "link", "set", &end.interface, "down"])?;
            }
        }
        Ok(())
    }

    /// Administratively enable or disable an interface
    pub fn set_interface_enabled(&mut self, node: &str, iface: &str, enabled: bool) -> Result<()> {
        self.topology.set_interface_enabled(node, iface, enabled)?;

        let linked = self
            .topology
            .node(node)
            .and_then(|n| n.interface(iface))
            .is_some_and(|i| self.wired.contains(&i.link));
        if linked {
            let state = if enabled { "up" } else { "down" };
            self.apply(node, &["ip", "link", "set", iface, state])?;
            info!(node, iface, state, "interface state changed");
        }
        Ok(())
    }

    /// Apply default-route directives of a node (optionally one interface)
    fn install_default_routes(&mut self, node: &str, only: Option<&str>) -> Result<()> {
        let directives: Vec<(String, IpAddr)> = self
            .topology
            .interfaces(node)?
            .iter()
            .filter(|i| only.is_none_or(|name| name == i.name))
            .filter_map(|i| i.default_route.map(|gw| (i.name.clone(), gw)))
            .collect();

        for (iface, gateway) in directives {
            let gateway = gateway.to_string();
            self.apply(
                node,
                &["ip", "route", "replace", "default", "via", &gateway, "dev", &iface],
            )?;
            debug!(node, %gateway, %iface, "default route installed");
        }

        Ok(())
    }

    /// Substrate handle of a realized node
    pub fn handle(&self, node: &str) -> Result<NodeHandle> {
        if let Some(handle) = self.handles.get(node) {
            return Ok(*handle);
        }
        if self.topology.node(node).is_none() {
            return Err(Error::UnknownNode(node.to_string()));
        }
        Err(Error::NotReady(node.to_string()))
    }

    /// Run a command inside a realized node
    pub fn execute(&mut self, node: &str, command: &[&str]) -> Result<CommandOutput> {
        let handle = self.handle(node)?;
        self.substrate.execute(handle, command)
    }

    /// Run a configuration directive, turning a non-zero exit into an error
    pub(crate) fn apply(&mut self, node: &str, command: &[&str]) -> Result<CommandOutput> {
        let directive = command.join(" ");
        let output = self.execute(node, command).map_err(|e| match e {
            Error::NotReady(_) | Error::UnknownNode(_) => e,
            other => Error::Configuration {
                node: node.to_string(),
                directive: directive.clone(),
                diagnostic: other.to_string(),
            },
        })?;

        if !output.success() {
            return Err(Error::Configuration {
                node: node.to_string(),
                directive,
                diagnostic: output.diagnostic(),
            });
        }

        Ok(output)
    }

    /// Release every substrate node, newest first
    ///
    /// Keeps going past individual failures and reports the first one.
    pub fn teardown(&mut self) -> Result<()> {
        if self.created.is_empty() {
            return Ok(());
        }

        let routers: Vec<String> = self
            .topology
            .routers()
            .filter(|r| r.router().is_some_and(|s| s.forwarding_enabled()))
            .map(|r| r.name.clone())
            .collect();
        for router in routers {
            if let Err(e) = self.disable_forwarding(&router) {
                warn!(router = %router, error = %e, "failed to disable forwarding");
            }
        }

        let mut first_error = None;
        while let Some(name) = self.created.pop() {
            let Some(handle) = self.handles.remove(&name) else {
                continue;
            };
            match self.substrate.destroy(handle) {
                Ok(()) => debug!(node = %name, "node destroyed"),
                Err(e) => {
                    warn!(node = %name, error = %e, "failed to destroy node");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.handles.clear();
        self.wired.clear();
        self.realized = false;
        info!("topology torn down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S: Substrate> Drop for Lab<S> {
    fn drop(&mut self) {
        if !self.created.is_empty() {
            if let Err(e) = self.teardown() {
                warn!(error = %e, "teardown on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;
    use crate::substrate::memory::Call;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn small() -> Topology {
        let mut topo = Topology::new();
        topo.add_host("h1", None).unwrap();
        topo.add_router("r1", None).unwrap();
        topo.set_default_route("h1", "10.0.0.3".parse().unwrap()).unwrap();
        topo.add_link("h1", "r1", "h1-eth0", "r1-eth0", net("10.0.0.1/24"), net("10.0.0.3/24"))
            .unwrap();
        topo
    }

    #[test]
    fn test_nothing_happens_before_realize() {
        let substrate = MemorySubstrate::new();
        let lab = Lab::new(small(), substrate.clone());
        assert!(!lab.is_realized());
        assert!(substrate.calls().is_empty());
        assert!(matches!(lab.handle("h1"), Err(Error::NotReady(_))));
        assert!(matches!(lab.handle("zz"), Err(Error::UnknownNode(_))));
    }

    #[test]
    fn test_realize_order() {
        let substrate = MemorySubstrate::new();
        let mut lab = Lab::new(small(), substrate.clone());
        lab.realize().unwrap();

        let calls = substrate.calls();
        assert!(matches!(&calls[0], Call::CreateNode { name, .. } if name == "h1"));
        assert!(matches!(&calls[1], Call::CreateNode { name, .. } if name == "r1"));
        assert!(matches!(&calls[2], Call::CreateLink { iface_a, .. } if iface_a == "h1-eth0"));
        assert_eq!(
            substrate.commands("h1"),
            vec!["ip route replace default via 10.0.0.3 dev h1-eth0"]
        );
        assert_eq!(substrate.routes("h1"), vec!["0.0.0.0/0 via 10.0.0.3 dev h1-eth0"]);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let substrate = MemorySubstrate::new();
        let mut lab = Lab::new(small(), substrate.clone());
        lab.realize().unwrap();
        assert_eq!(substrate.node_count(), 2);
        assert_eq!(substrate.link_count(), 1);

        lab.teardown().unwrap();
        assert_eq!(substrate.node_count(), 0);
        assert_eq!(substrate.link_count(), 0);
        assert!(!lab.is_realized());
    }

    #[test]
    fn test_drop_releases_partial_realization() {
        let substrate = MemorySubstrate::new();
        // Default route directive fails after nodes and link exist
        substrate.fail_command("h1", "default");
        {
            let mut lab = Lab::new(small(), substrate.clone());
            let err = lab.realize().unwrap_err();
            assert!(matches!(err, Error::Configuration { ref node, .. } if node == "h1"));
            assert_eq!(substrate.node_count(), 2);
        }
        assert_eq!(substrate.node_count(), 0);
        assert_eq!(substrate.link_count(), 0);
    }

    #[test]
    fn test_interface_enable_disable() {
        let substrate = MemorySubstrate::new();
        let mut lab = Lab::new(small(), substrate.clone());
        lab.realize().unwrap();
        let ping = ["ping", "-c", "1", "10.0.0.3"];

        lab.set_interface_enabled("h1", "h1-eth0", false).unwrap();
        assert!(!lab.topology().node("h1").unwrap().interface("h1-eth0").unwrap().enabled);
        assert!(!lab.execute("h1", &ping).unwrap().success());

        lab.set_interface_enabled("h1", "h1-eth0", true).unwrap();
        assert!(lab.execute("h1", &ping).unwrap().success());
    }

    #[test]
    fn test_disabled_interface_realized_down() {
        let substrate = MemorySubstrate::new();
        let mut topo = small();
        topo.set_interface_enabled("r1", "r1-eth0", false).unwrap();
        let mut lab = Lab::new(topo, substrate.clone());
        lab.realize().unwrap();

        assert_eq!(substrate.commands("r1"), vec!["ip link set r1-eth0 down"]);
        assert!(!lab.execute("h1", &["ping", "-c", "1", "10.0.0.3"]).unwrap().success());
    }

    #[test]
    fn test_add_link_after_realize() {
        let substrate = MemorySubstrate::new();
        let mut topo = small();
        topo.add_router("r2", None).unwrap();
        let mut lab = Lab::new(topo, substrate.clone());
        lab.realize().unwrap();

        lab.add_link("r1", "r2", "r1-eth1", "r2-eth0", net("10.0.1.1/24"), net("10.0.1.2/24"))
            .unwrap();
        assert_eq!(substrate.link_count(), 2);
        assert_eq!(lab.topology().interfaces("r1").unwrap().len(), 2);
    }
}
