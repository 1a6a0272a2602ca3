//! Router configuration engine
//!
//! Brings each router from "declared" to "forwarding correctly":
//! 1. enable IPv4 forwarding
//! 2. relax reverse-path filtering on every non-loopback interface
//! 3. install static routes (last write wins per prefix)
//!
//! Configuration is not atomic across routers: when one router fails, the
//! routers configured before it stay configured and the ones after it are
//! left untouched. Directives are deterministic, so re-running after fixing
//! the cause is safe.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lab::Lab;
use crate::router::state::{Phase, RouterState};
use crate::substrate::Substrate;
use crate::topology::Route;

/// Kernel-wide rp_filter keys; Linux applies max(all, <iface>)
const GLOBAL_CONF_KEYS: [&str; 2] = ["all", "default"];

impl<S: Substrate> Lab<S> {
    fn router_state(&mut self, router: &str) -> Result<&mut RouterState> {
        self.topology
            .node_mut(router)?
            .router_mut()
            .ok_or_else(|| Error::NotARouter(router.to_string()))
    }

    /// Check that `router` is a realized router in at least phase `min`
    fn require(&mut self, router: &str, action: &str, min: Phase) -> Result<Phase> {
        let phase = self.router_state(router)?.phase();
        self.handle(router)?;

        if phase < min {
            return Err(Self::transition_error(router, action, phase));
        }
        Ok(phase)
    }

    fn transition_error(router: &str, action: &str, phase: Phase) -> Error {
        Error::RouterState {
            router: router.to_string(),
            action: action.to_string(),
            state: phase.to_string(),
        }
    }

    /// Turn on IPv4 forwarding; a second call changes nothing
    pub fn enable_forwarding(&mut self, router: &str) -> Result<()> {
        let phase = self.require(router, "enable forwarding", Phase::Declared)?;

        if self.router_state(router)?.forwarding_enabled() {
            debug!(router, "forwarding already enabled");
            return Ok(());
        }

        self.apply(router, &["sysctl", "-w", "net.ipv4.ip_forward=1"])?;

        let state = self.router_state(router)?;
        state.set_forwarding(true);
        if phase == Phase::Declared {
            state
                .forward()
                .map_err(|_| Self::transition_error(router, "enable forwarding", phase))?;
        }

        info!(router, "forwarding enabled");
        Ok(())
    }

    /// Turn IPv4 forwarding back off (router shutdown)
    pub(crate) fn disable_forwarding(&mut self, router: &str) -> Result<()> {
        self.apply(router, &["sysctl", "-w", "net.ipv4.ip_forward=0"])?;
        self.router_state(router)?.set_forwarding(false);
        debug!(router, "forwarding disabled");
        Ok(())
    }

    /// Disable reverse-path filtering on every non-loopback interface
    ///
    /// The interface set is read from the topology at call time, so an
    /// interface added since the last call is covered by calling again.
    /// Returns the interfaces relaxed by this call.
    pub fn relax_filtering(&mut self, router: &str) -> Result<Vec<String>> {
        let phase = self.require(router, "relax filtering", Phase::ForwardingEnabled)?;

        let interfaces: Vec<String> = self
            .topology
            .interfaces(router)?
            .iter()
            .filter(|i| !i.is_loopback())
            .map(|i| i.name.clone())
            .collect();

        for key in GLOBAL_CONF_KEYS {
            let setting = format!("net.ipv4.conf.{}.rp_filter=0", key);
            self.apply(router, &["sysctl", "-w", &setting])?;
        }

        for iface in &interfaces {
            let setting = format!("net.ipv4.conf.{}.rp_filter=0", iface);
            self.apply(router, &["sysctl", "-w", &setting])?;
            self.router_state(router)?.mark_relaxed(iface);
        }

        if phase == Phase::ForwardingEnabled {
            self.router_state(router)?
                .relax()
                .map_err(|_| Self::transition_error(router, "relax filtering", phase))?;
        }

        info!(router, interfaces = ?interfaces, "reverse-path filtering relaxed");
        Ok(interfaces)
    }

    /// Install a static route, replacing any route for the same prefix
    ///
    /// Returns the route that was replaced.
    pub fn install_route(&mut self, router: &str, route: Route) -> Result<Option<Route>> {
        self.require(router, "install routes", Phase::FilteringRelaxed)?;

        let destination = route.destination.to_string();
        let next_hop = route.next_hop.to_string();
        self.apply(
            router,
            &[
                "ip", "route", "replace", &destination, "via", &next_hop, "dev", &route.egress,
            ],
        )?;

        let replaced = self.router_state(router)?.insert_route(route.clone());
        match &replaced {
            Some(old) => info!(router, %route, previous = %old, "route replaced"),
            None => info!(router, %route, "route installed"),
        }

        self.finish_routes(router)?;
        Ok(replaced)
    }

    /// Mark a router's routing table complete
    fn finish_routes(&mut self, router: &str) -> Result<()> {
        let state = self.router_state(router)?;
        let phase = state.phase();
        if phase == Phase::FilteringRelaxed {
            state
                .install()
                .map_err(|_| Self::transition_error(router, "install routes", phase))?;
        }
        Ok(())
    }

    /// Run all configuration steps for one router
    pub fn configure_router(&mut self, router: &str, routes: &[Route]) -> Result<()> {
        self.enable_forwarding(router)?;
        self.relax_filtering(router)?;
        for route in routes {
            self.install_route(router, route.clone())?;
        }
        self.finish_routes(router)
    }

    /// Configure every router in declaration order
    ///
    /// `routes` pairs a router name with a route; routes for the same router
    /// are installed in the given order. Stops at the first failing router.
    pub fn configure_all(&mut self, routes: &[(String, Route)]) -> Result<()> {
        for (router, _) in routes {
            let is_router = self.topology.node(router).map(|n| n.is_router());
            match is_router {
                None => return Err(Error::UnknownNode(router.clone())),
                Some(false) => return Err(Error::NotARouter(router.clone())),
                Some(true) => {}
            }
        }

        let routers: Vec<String> = self.topology.routers().map(|r| r.name.clone()).collect();
        for router in &routers {
            let own: Vec<Route> = routes
                .iter()
                .filter(|(name, _)| name == router)
                .map(|(_, route)| route.clone())
                .collect();
            self.configure_router(router, &own)?;
        }

        info!(routers = routers.len(), "all routers configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;
    use crate::topology::Topology;
    use ipnet::IpNet;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn route(dst: &str, via: &str, dev: &str) -> Route {
        Route::new(net(dst), via.parse().unwrap(), dev)
    }

    fn two_routers() -> Topology {
        let mut topo = Topology::new();
        topo.add_host("h1", None).unwrap();
        topo.add_router("r1", None).unwrap();
        topo.add_router("r2", None).unwrap();
        topo.add_link("h1", "r1", "h1-eth0", "r1-eth0", net("10.0.0.1/24"), net("10.0.0.3/24"))
            .unwrap();
        topo.add_link("r1", "r2", "r1-eth1", "r2-eth0", net("10.0.1.1/24"), net("10.0.1.2/24"))
            .unwrap();
        topo
    }

    fn realized() -> (Lab<MemorySubstrate>, MemorySubstrate) {
        let substrate = MemorySubstrate::new();
        let mut topo = two_routers();
        topo.add_host("h2", None).unwrap();
        let mut lab = Lab::new(topo, substrate.clone());
        lab.realize().unwrap();
        (lab, substrate)
    }

    #[test]
    fn test_not_ready_before_realize() {
        let mut lab = Lab::new(two_routers(), MemorySubstrate::new());
        assert!(matches!(lab.enable_forwarding("r1"), Err(Error::NotReady(_))));
        assert!(matches!(lab.relax_filtering("r1"), Err(Error::NotReady(_))));
        assert!(matches!(
            lab.install_route("r1", route("10.0.2.0/24", "10.0.1.2", "r1-eth1")),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_host_is_not_a_router() {
        let (mut lab, _) = realized();
        assert!(matches!(lab.enable_forwarding("h1"), Err(Error::NotARouter(_))));
    }

    #[test]
    fn test_enable_forwarding_idempotent() {
        let (mut lab, substrate) = realized();

        lab.enable_forwarding("r1").unwrap();
        let commands_once = substrate.commands("r1");
        let phase_once = lab.topology().node("r1").unwrap().router().unwrap().phase();

        lab.enable_forwarding("r1").unwrap();
        let state = lab.topology().node("r1").unwrap().router().unwrap();

        assert!(state.forwarding_enabled());
        assert_eq!(state.phase(), phase_once);
        assert_eq!(state.phase(), Phase::ForwardingEnabled);
        assert_eq!(substrate.commands("r1"), commands_once);
        assert_eq!(substrate.forwarding("r1"), Some(true));
    }

    #[test]
    fn test_out_of_order_steps_rejected() {
        let (mut lab, _) = realized();
        assert!(matches!(
            lab.relax_filtering("r1"),
            Err(Error::RouterState { .. })
        ));
        lab.enable_forwarding("r1").unwrap();
        assert!(matches!(
            lab.install_route("r1", route("10.0.2.0/24", "10.0.1.2", "r1-eth1")),
            Err(Error::RouterState { .. })
        ));
    }

    #[test]
    fn test_relax_enumerates_current_interfaces() {
        let (mut lab, substrate) = realized();
        lab.enable_forwarding("r1").unwrap();

        let relaxed = lab.relax_filtering("r1").unwrap();
        assert_eq!(relaxed, vec!["r1-eth0", "r1-eth1"]);
        assert_eq!(substrate.rp_filter("r1", "all"), Some(0));
        assert_eq!(substrate.rp_filter("r1", "r1-eth1"), Some(0));

        // New interface after relaxation: re-running covers it
        lab.add_link("r1", "h2", "r1-eth2", "h2-eth0", net("10.0.3.4/24"), net("10.0.3.2/24"))
            .unwrap();
        let state = lab.topology().node("r1").unwrap().router().unwrap();
        assert!(!state.relaxed_interfaces().contains("r1-eth2"));

        let relaxed = lab.relax_filtering("r1").unwrap();
        assert_eq!(relaxed, vec!["r1-eth0", "r1-eth1", "r1-eth2"]);
        assert_eq!(substrate.rp_filter("r1", "r1-eth2"), Some(0));

        let state = lab.topology().node("r1").unwrap().router().unwrap();
        let recorded: Vec<_> = state.relaxed_interfaces().iter().cloned().collect();
        assert_eq!(recorded, vec!["r1-eth0", "r1-eth1", "r1-eth2"]);
        assert!(!recorded.iter().any(|i| i == "lo"));
    }

    #[test]
    fn test_install_route_replaces_prefix() {
        let (mut lab, substrate) = realized();
        lab.enable_forwarding("r1").unwrap();
        lab.relax_filtering("r1").unwrap();

        let a = route("10.0.2.0/24", "10.0.1.2", "r1-eth1");
        let b = route("10.0.2.0/24", "10.0.0.1", "r1-eth0");

        assert_eq!(lab.install_route("r1", a.clone()).unwrap(), None);
        assert_eq!(lab.install_route("r1", b.clone()).unwrap(), Some(a));

        let state = lab.topology().node("r1").unwrap().router().unwrap();
        let routes: Vec<_> = state.routes().collect();
        assert_eq!(routes, vec![&b]);
        assert_eq!(state.phase(), Phase::RoutesInstalled);
        assert_eq!(substrate.routes("r1"), vec!["10.0.2.0/24 via 10.0.0.1 dev r1-eth0"]);
    }

    #[test]
    fn test_configuration_error_carries_context() {
        let (mut lab, substrate) = realized();
        lab.enable_forwarding("r1").unwrap();
        lab.relax_filtering("r1").unwrap();

        let err = lab
            .install_route("r1", route("10.0.2.0/24", "10.0.1.2", "r1-eth9"))
            .unwrap_err();
        match err {
            Error::Configuration {
                node,
                directive,
                diagnostic,
            } => {
                assert_eq!(node, "r1");
                assert_eq!(directive, "ip route replace 10.0.2.0/24 via 10.0.1.2 dev r1-eth9");
                assert_eq!(diagnostic, "Cannot find device \"r1-eth9\"");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing recorded for the failed directive
        let state = lab.topology().node("r1").unwrap().router().unwrap();
        assert_eq!(state.routes().count(), 0);
        assert!(substrate.routes("r1").is_empty());
    }

    #[test]
    fn test_configure_all_not_atomic() {
        let (mut lab, substrate) = realized();
        substrate.fail_command("r2", "ip route");

        let routes = vec![
            ("r1".to_string(), route("10.0.2.0/24", "10.0.1.2", "r1-eth1")),
            ("r2".to_string(), route("10.0.0.0/24", "10.0.1.1", "r2-eth0")),
        ];
        let err = lab.configure_all(&routes).unwrap_err();
        assert!(matches!(err, Error::Configuration { ref node, .. } if node == "r2"));

        // r1 stays configured, r2 stopped where it failed
        let r1 = lab.topology().node("r1").unwrap().router().unwrap();
        assert_eq!(r1.phase(), Phase::RoutesInstalled);
        let r2 = lab.topology().node("r2").unwrap().router().unwrap();
        assert_eq!(r2.phase(), Phase::FilteringRelaxed);
        assert_eq!(substrate.routes("r1").len(), 1);
    }

    #[test]
    fn test_configure_all_rejects_unknown_router() {
        let (mut lab, substrate) = realized();
        let routes = vec![("h1".to_string(), route("10.0.2.0/24", "10.0.0.3", "h1-eth0"))];
        assert!(matches!(lab.configure_all(&routes), Err(Error::NotARouter(_))));
        assert!(substrate.commands("r1").is_empty());
    }

    #[test]
    fn test_teardown_after_configuration_error_releases_all() {
        let substrate = MemorySubstrate::new();
        substrate.fail_command("r2", "rp_filter");
        {
            let mut lab = Lab::new(two_routers(), substrate.clone());
            lab.realize().unwrap();
            let routes = vec![("r1".to_string(), route("10.0.2.0/24", "10.0.1.2", "r1-eth1"))];
            assert!(lab.configure_all(&routes).is_err());
            assert!(lab.teardown().is_ok());
        }
        assert_eq!(substrate.node_count(), 0);
        assert_eq!(substrate.link_count(), 0);
        // Forwarding was turned back off on the router that had it
        assert!(substrate
            .commands("r1")
            .contains(&"sysctl -w net.ipv4.ip_forward=0".to_string()));
    }
}
