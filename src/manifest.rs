//! Lab manifest parsing
//!
//! Parses `routelab.toml` files using serde and turns them into a
//! `Topology`, per-router static routes and the probe list.

use crate::error::{Error, Result};
use crate::harness::Probe;
use crate::topology::{Route, Topology};
use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Load a lab manifest from a file
pub fn load(path: &Path) -> Result<LabConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config: LabConfig = toml::from_str(&content)?;

    // Namespace prefix defaults to the manifest's file stem
    if config.config.name.is_none() {
        config.config.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string());
    }

    config.validate()?;

    Ok(config)
}

/// Root manifest structure
#[derive(Debug, Deserialize)]
pub struct LabConfig {
    /// Global settings
    #[serde(default)]
    pub config: GlobalConfig,

    #[serde(default)]
    pub hosts: Vec<HostDef>,

    #[serde(default)]
    pub routers: Vec<RouterDef>,

    #[serde(default)]
    pub links: Vec<LinkDef>,

    /// Static routes, installed in order per router
    #[serde(default)]
    pub routes: Vec<RouteDef>,

    /// Reachability probes, run in order
    #[serde(default)]
    pub probes: Vec<ProbeDef>,
}

impl LabConfig {
    /// Validate the manifest by building everything it declares
    pub fn validate(&self) -> Result<()> {
        let topology = self.topology()?;
        topology.verify_wiring()?;

        for node in topology.nodes() {
            let Some(address) = node.address else {
                continue;
            };
            if !node.interfaces().iter().any(|i| i.address.addr() == address.addr()) {
                return Err(Error::ConfigValidation(format!(
                    "Node '{}' address {} is not on any of its links",
                    node.name, address
                )));
            }
        }

        for route in &self.routes {
            match topology.node(&route.router) {
                None => return Err(Error::UnknownNode(route.router.clone())),
                Some(node) if !node.is_router() => {
                    return Err(Error::NotARouter(route.router.clone()));
                }
                Some(node) => {
                    if node.interface(&route.dev).is_none() {
                        return Err(Error::ConfigValidation(format!(
                            "Route {} on '{}' uses unknown device '{}'",
                            route.destination, route.router, route.dev
                        )));
                    }
                }
            }
        }

        self.probes(&topology)?;

        Ok(())
    }

    /// Declare the topology: nodes first, then links
    pub fn topology(&self) -> Result<Topology> {
        let mut topology = Topology::new();

        for host in &self.hosts {
            topology.add_host(&host.name, host.ip)?;
            if let Some(gateway) = host.gateway()? {
                topology.set_default_route(&host.name, gateway)?;
            }
        }

        for router in &self.routers {
            topology.add_router(&router.name, router.ip)?;
        }

        for link in &self.links {
            topology.add_link(
                &link.a,
                &link.b,
                &link.a_iface,
                &link.b_iface,
                link.a_ip,
                link.b_ip,
            )?;
        }

        Ok(topology)
    }

    /// Static routes paired with the router they belong to
    pub fn routes(&self) -> Vec<(String, Route)> {
        self.routes
            .iter()
            .map(|r| {
                (
                    r.router.clone(),
                    Route::new(r.destination, r.via, r.dev.as_str()),
                )
            })
            .collect()
    }

    /// Resolve probe destinations against a topology
    pub fn probes(&self, topology: &Topology) -> Result<Vec<Probe>> {
        self.probes
            .iter()
            .map(|p| {
                if topology.node(&p.source).is_none() {
                    return Err(Error::UnknownNode(p.source.clone()));
                }
                let destination = topology.resolve_address(&p.destination)?;
                let label = p.label.clone().unwrap_or_else(|| {
                    if topology.node(&p.destination).is_some() {
                        p.destination.clone()
                    } else {
                        topology
                            .owner_of(destination)
                            .map(|n| n.name.clone())
                            .unwrap_or_else(|| destination.to_string())
                    }
                });
                Ok(Probe::new(p.source.as_str(), destination, label))
            })
            .collect()
    }

    /// Namespace prefix for this lab
    pub fn lab_name(&self) -> String {
        self.config.name.clone().unwrap_or_else(|| "routelab".to_string())
    }
}

/// Global settings
#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    /// Lab name (used as prefix for namespace names)
    pub name: Option<String>,

    /// File probe results are written to
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Run substrate commands through sudo
    #[serde(default)]
    pub sudo: bool,

    /// Seconds to wait for each ping reply
    pub ping_timeout: Option<u64>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: None,
            output: default_output(),
            sudo: false,
            ping_timeout: None,
        }
    }
}

fn default_output() -> PathBuf {
    PathBuf::from("result1.txt")
}

/// Host definition
#[derive(Debug, Deserialize)]
pub struct HostDef {
    pub name: String,

    /// Primary address
    pub ip: Option<IpNet>,

    /// Default gateway, written "via 10.0.0.3" or just "10.0.0.3"
    pub default_route: Option<String>,
}

impl HostDef {
    /// Parse the default route directive
    pub fn gateway(&self) -> Result<Option<IpAddr>> {
        let Some(directive) = &self.default_route else {
            return Ok(None);
        };

        let addr = directive.trim();
        let addr = addr.strip_prefix("via").map(str::trim).unwrap_or(addr);
        addr.parse().map(Some).map_err(|_| {
            Error::ConfigValidation(format!(
                "Host '{}' has invalid default_route '{}'",
                self.name, directive
            ))
        })
    }
}

/// Router definition
#[derive(Debug, Deserialize)]
pub struct RouterDef {
    pub name: String,

    /// Primary address
    pub ip: Option<IpNet>,
}

/// Point-to-point link definition
#[derive(Debug, Deserialize)]
pub struct LinkDef {
    pub a: String,
    pub b: String,
    pub a_iface: String,
    pub b_iface: String,
    pub a_ip: IpNet,
    pub b_ip: IpNet,
}

/// Static route definition
#[derive(Debug, Deserialize)]
pub struct RouteDef {
    pub router: String,
    pub destination: IpNet,
    pub via: IpAddr,
    pub dev: String,
}

/// Probe definition
#[derive(Debug, Deserialize)]
pub struct ProbeDef {
    pub source: String,

    /// Address or node name
    pub destination: String,

    /// Defaults to the destination node's name
    pub label: Option<String>,
}

/// Two routers, three hosts
///
/// ```text
/// h1 --- r1 --- r2 --- h3
///        |
///        h2
/// ```
pub const EXAMPLE_LAB: &str = r#"# routelab example: two routers, three hosts
#
#   h1 --- r1 --- r2 --- h3
#          |
#          h2

[config]
name = "exp1"
output = "result1.txt"

[[hosts]]
name = "h1"
ip = "10.0.0.1/24"
default_route = "via 10.0.0.3"

[[hosts]]
name = "h2"
ip = "10.0.3.2/24"
default_route = "via 10.0.3.4"

[[hosts]]
name = "h3"
ip = "10.0.2.2/24"
default_route = "via 10.0.2.1"

[[routers]]
name = "r1"
ip = "10.0.0.3/24"

[[routers]]
name = "r2"
ip = "10.0.1.2/24"

[[links]]
a = "h1"
b = "r1"
a_iface = "h1-eth0"
b_iface = "r1-eth0"
a_ip = "10.0.0.1/24"
b_ip = "10.0.0.3/24"

[[links]]
a = "r1"
b = "r2"
a_iface = "r1-eth1"
b_iface = "r2-eth0"
a_ip = "10.0.1.1/24"
b_ip = "10.0.1.2/24"

[[links]]
a = "r2"
b = "h3"
a_iface = "r2-eth1"
b_iface = "h3-eth0"
a_ip = "10.0.2.1/24"
b_ip = "10.0.2.2/24"

[[links]]
a = "r1"
b = "h2"
a_iface = "r1-eth2"
b_iface = "h2-eth0"
a_ip = "10.0.3.4/24"
b_ip = "10.0.3.2/24"

[[routes]]
router = "r1"
destination = "10.0.2.0/24"
via = "10.0.1.2"
dev = "r1-eth1"

[[routes]]
router = "r2"
destination = "10.0.0.0/24"
via = "10.0.1.1"
dev = "r2-eth0"

[[routes]]
router = "r2"
destination = "10.0.3.0/24"
via = "10.0.1.1"
dev = "r2-eth0"

[[probes]]
source = "h1"
destination = "h3"

[[probes]]
source = "h2"
destination = "h3"

[[probes]]
source = "h3"
destination = "h1"

[[probes]]
source = "h3"
destination = "h2"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Harness;
    use crate::lab::Lab;
    use crate::substrate::MemorySubstrate;

    fn example() -> LabConfig {
        toml::from_str(EXAMPLE_LAB).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[[hosts]]
name = "h1"
"#;

        let config: LabConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.config.output, PathBuf::from("result1.txt"));
        assert_eq!(config.lab_name(), "routelab");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_example() {
        let config = example();
        assert!(config.validate().is_ok());
        assert_eq!(config.lab_name(), "exp1");

        let topology = config.topology().unwrap();
        assert_eq!(topology.node_count(), 5);
        assert_eq!(topology.link_count(), 4);
        assert!(topology.is_connected());
        assert!(topology.verify_wiring().is_ok());

        let probes = config.probes(&topology).unwrap();
        let plan: Vec<_> = probes
            .iter()
            .map(|p| (p.source.as_str(), p.destination.to_string(), p.label.as_str()))
            .collect();
        assert_eq!(
            plan,
            vec![
                ("h1", "10.0.2.2".to_string(), "h3"),
                ("h2", "10.0.2.2".to_string(), "h3"),
                ("h3", "10.0.0.1".to_string(), "h1"),
                ("h3", "10.0.3.2".to_string(), "h2"),
            ]
        );
    }

    #[test]
    fn test_default_route_forms() {
        let toml = r#"
[[hosts]]
name = "a"
default_route = "via 10.0.0.3"

[[hosts]]
name = "b"
default_route = "10.0.0.4"

[[hosts]]
name = "c"
default_route = "gateway"
"#;

        let config: LabConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.hosts[0].gateway().unwrap(), Some("10.0.0.3".parse().unwrap()));
        assert_eq!(config.hosts[1].gateway().unwrap(), Some("10.0.0.4".parse().unwrap()));
        assert!(config.hosts[2].gateway().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_name_error() {
        let toml = r#"
[[hosts]]
name = "r1"

[[routers]]
name = "r1"
"#;

        let config: LabConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::DuplicateName(_))));
    }

    #[test]
    fn test_unknown_link_node_error() {
        let toml = r#"
[[hosts]]
name = "h1"

[[links]]
a = "h1"
b = "r9"
a_iface = "h1-eth0"
b_iface = "r9-eth0"
a_ip = "10.0.0.1/24"
b_ip = "10.0.0.2/24"
"#;

        let config: LabConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::UnknownNode(ref n)) if n == "r9"));
    }

    #[test]
    fn test_route_on_host_error() {
        let toml = r#"
[[hosts]]
name = "h1"

[[routes]]
router = "h1"
destination = "10.0.2.0/24"
via = "10.0.1.2"
dev = "h1-eth0"
"#;

        let config: LabConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(Error::NotARouter(_))));
    }

    #[test]
    fn test_node_ip_off_link_error() {
        let toml = r#"
[[hosts]]
name = "h1"
ip = "10.9.9.9/24"

[[routers]]
name = "r1"

[[links]]
a = "h1"
b = "r1"
a_iface = "h1-eth0"
b_iface = "r1-eth0"
a_ip = "10.0.0.1/24"
b_ip = "10.0.0.2/24"
"#;

        let config: LabConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(ref m) if m.contains("10.9.9.9")));

        let fixed = toml.replace("10.9.9.9/24", "10.0.0.1/24");
        let config: LabConfig = toml::from_str(&fixed).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_cidr_is_parse_error() {
        let toml = r#"
[[hosts]]
name = "h1"
ip = "10.0.0.300/24"
"#;

        assert!(toml::from_str::<LabConfig>(toml).is_err());
    }

    #[test]
    fn test_example_reachability() {
        let config = example();
        let substrate = MemorySubstrate::new();
        let mut lab = Lab::new(config.topology().unwrap(), substrate.clone());
        lab.realize().unwrap();
        let probes = config.probes(lab.topology()).unwrap();

        // Forwarding and relaxed filtering alone are not enough
        for router in ["r1", "r2"] {
            lab.enable_forwarding(router).unwrap();
            lab.relax_filtering(router).unwrap();
        }
        let mut before = Harness::new();
        let results = before.run(&mut lab, &probes[..1]).unwrap();
        assert!(!results[0].success);

        lab.configure_all(&config.routes()).unwrap();
        let mut after = Harness::new();
        after.run(&mut lab, &probes).unwrap();
        assert!(after.summary().all_passed(), "{:#?}", after.results());
        assert_eq!(after.summary().total, 4);

        lab.teardown().unwrap();
        assert_eq!(substrate.node_count(), 0);
        assert_eq!(substrate.link_count(), 0);
    }
}
