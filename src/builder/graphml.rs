//! Event types the virtual-network builder consumes. The tokeniser that
//! turns a GraphML document into this stream lives outside this crate; the
//! builder only needs the event shapes and the `Iterator` contract (nodes
//! before the links that reference them, each name resolved before use).

use crate::error::Result;

/// One graph node, in the order it was declared.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    /// Graph-local name, unique within the document.
    pub name: String,
    /// Whether this node is exposed through an edge.
    pub client: bool,
    /// Packet loss, `0.0..=1.0`.
    pub packet_loss: f64,
    /// Upload bandwidth in Mbit/s.
    pub bandwidth_up: f64,
    /// Download bandwidth in Mbit/s.
    pub bandwidth_down: f64,
}

/// One graph edge, in the order it was declared.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    /// Name of the source endpoint, already emitted as a [`NodeEvent`].
    pub source_name: String,
    /// Name of the target endpoint, already emitted as a [`NodeEvent`].
    pub target_name: String,
    /// Base delay in milliseconds.
    pub latency_ms: f64,
    /// Delay jitter in milliseconds.
    pub jitter_ms: f64,
    /// Packet loss, `0.0..=1.0`.
    pub packet_loss: f64,
    /// Queue length limit in packets.
    pub queue_len: u32,
    /// Routing weight; negative values are rejected by the builder.
    pub weight: f64,
}

/// One event in a GraphML stream.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A node declaration.
    Node(NodeEvent),
    /// An edge declaration. May be reflexive (source equals target), which
    /// the builder treats as shaping for a client's own uplink rather than a
    /// link between two distinct namespaces.
    Link(LinkEvent),
}

/// A source of graph events. All node events for a given link's endpoints
/// are expected to precede that link; the builder treats a forward
/// reference as a configuration error.
pub trait GraphSource: Iterator<Item = Result<GraphEvent>> {}

impl<T: Iterator<Item = Result<GraphEvent>>> GraphSource for T {}
