//! Topology model
//!
//! Provides:
//! - Node, interface, link and route types
//! - The declarative topology graph and its builder operations

pub mod graph;
pub mod types;

pub use graph::Topology;
pub use types::{Endpoint, Interface, Link, LinkId, Node, NodeKind, NodeRole, Route};
