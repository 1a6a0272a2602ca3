//! Router configuration state machine
//!
//! Tracks how far a router has been brought from "declared" to
//! "forwarding correctly" using the state-machines crate in dynamic mode.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ipnet::IpNet;
use state_machines::state_machine;

use crate::topology::Route;

state_machine! {
    name: RouterMachine,
    dynamic: true,
    initial: Declared,
    states: [Declared, ForwardingEnabled, FilteringRelaxed, RoutesInstalled],
    events {
        forward {
            transition: { from: Declared, to: ForwardingEnabled }
        }
        relax {
            transition: { from: ForwardingEnabled, to: FilteringRelaxed }
        }
        install {
            transition: { from: FilteringRelaxed, to: RoutesInstalled }
        }
    }
}

/// Configuration phase of a router, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Declared,
    ForwardingEnabled,
    FilteringRelaxed,
    RoutesInstalled,
}

impl Phase {
    /// Parse phase from the machine's state name
    pub fn parse(s: &str) -> Self {
        match s {
            "ForwardingEnabled" => Phase::ForwardingEnabled,
            "FilteringRelaxed" => Phase::FilteringRelaxed,
            "RoutesInstalled" => Phase::RoutesInstalled,
            _ => Phase::Declared,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Declared => "declared",
            Phase::ForwardingEnabled => "forwarding enabled",
            Phase::FilteringRelaxed => "filtering relaxed",
            Phase::RoutesInstalled => "routes installed",
        };
        write!(f, "{}", s)
    }
}

/// Forwarding state owned by a router node
pub struct RouterState {
    machine: DynamicRouterMachine<()>,
    forwarding_enabled: bool,
    routes: BTreeMap<IpNet, Route>,
    relaxed: BTreeSet<String>,
}

impl RouterState {
    pub fn new() -> Self {
        Self {
            machine: RouterMachine::new(()).into_dynamic(),
            forwarding_enabled: false,
            routes: BTreeMap::new(),
            relaxed: BTreeSet::new(),
        }
    }

    /// Current configuration phase
    pub fn phase(&self) -> Phase {
        Phase::parse(self.machine.current_state())
    }

    pub fn forwarding_enabled(&self) -> bool {
        self.forwarding_enabled
    }

    /// Installed static routes, ordered by destination prefix
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    /// Interfaces whose reverse-path filtering has been relaxed
    pub fn relaxed_interfaces(&self) -> &BTreeSet<String> {
        &self.relaxed
    }

    pub(crate) fn set_forwarding(&mut self, enabled: bool) {
        self.forwarding_enabled = enabled;
    }

    pub(crate) fn mark_relaxed(&mut self, interface: &str) {
        self.relaxed.insert(interface.to_string());
    }

    /// Store a route, returning the one it replaced (last write wins)
    pub(crate) fn insert_route(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.destination, route)
    }

    /// Trigger forward event (Declared -> ForwardingEnabled)
    pub(crate) fn forward(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(RouterMachineEvent::Forward)
    }

    /// Trigger relax event (ForwardingEnabled -> FilteringRelaxed)
    pub(crate) fn relax(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(RouterMachineEvent::Relax)
    }

    /// Trigger install event (FilteringRelaxed -> RoutesInstalled)
    pub(crate) fn install(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(RouterMachineEvent::Install)
    }
}

impl Default for RouterState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterState")
            .field("phase", &self.phase())
            .field("forwarding_enabled", &self.forwarding_enabled)
            .field("routes", &self.routes)
            .field("relaxed", &self.relaxed)
            .finish()
    }
}
