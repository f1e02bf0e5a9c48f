//! Virtual-network construction: the GraphML event model, edge-node
//! descriptors, and the six-phase builder that drives the work pipeline.

mod builder;
mod edge;
mod graphml;

pub use builder::{write_edge_commands, BuildOptions, Builder};
pub use edge::EdgeNode;
pub use graphml::{GraphEvent, GraphSource, LinkEvent, NodeEvent};
