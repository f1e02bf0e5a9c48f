//! Work orders: the tagged records the driver sends to workers.

use std::net::Ipv4Addr;

use bincode::{Decode, Encode};

use crate::address::{Ipv4Cidr, MacAddr};

/// Wire-compatible mirror of [`log::Level`]; `log::Level` itself is not
/// `Encode`/`Decode`, so `Configure` carries this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Encode, Decode)]
pub enum LogLevel {
    /// Matches `log::Level::Error`.
    Error,
    /// Matches `log::Level::Warn`.
    Warn,
    /// Matches `log::Level::Info`.
    Info,
    /// Matches `log::Level::Debug`.
    Debug,
    /// Matches `log::Level::Trace`.
    Trace,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// A topology node's shaping parameters, carried in [`WorkOrder::AddHost`].
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct TopologyNode {
    /// Whether this node is exposed through an edge.
    pub client: bool,
    /// Packet loss, `0.0..=1.0`.
    pub packet_loss: f64,
    /// Upload bandwidth in Mbit/s.
    pub bandwidth_up: f64,
    /// Download bandwidth in Mbit/s.
    pub bandwidth_down: f64,
}

/// A topology link's shaping parameters, carried in [`WorkOrder::AddLink`]
/// and [`WorkOrder::SetSelfLink`].
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct TopologyLink {
    /// Base delay in milliseconds.
    pub latency_ms: f64,
    /// Delay jitter in milliseconds.
    pub jitter_ms: f64,
    /// Packet loss, `0.0..=1.0`.
    pub packet_loss: f64,
    /// Queue length limit in packets.
    pub queue_len: u32,
    /// Routing weight. Non-negative; the builder rejects negative values
    /// before an order carrying one is ever constructed.
    pub weight: f64,
}

/// One privileged operation dispatched to a worker. The order carries every
/// byte of data the worker needs; nothing is shared beyond this record.
#[derive(Debug, Clone, Encode, Decode)]
pub enum WorkOrder {
    /// Fan-out synchronisation marker; every worker replies with `Pong`.
    Ping,
    /// Sentinel that ends a send task's loop during [`crate::pipeline::Pipeline::cleanup`].
    Terminate,
    /// Must be the first order a worker ever receives.
    Configure {
        /// Namespace filename prefix under `/var/run/netns`.
        ns_prefix: String,
        /// OVS working directory.
        ovs_dir: String,
        /// Optional OVS schema path override.
        ovs_schema: Option<String>,
        /// Soft memory cap for the namespace cache, in bytes.
        soft_mem_cap: usize,
        /// Minimum level the worker forwards as log frames.
        log_threshold: LogLevel,
        /// Whether the driver should colorize forwarded log lines.
        log_colorize: bool,
    },
    /// Resolve the real MAC address reachable on `intf` at `ip`, refreshing
    /// the ARP cache with an ICMP echo first if there's no entry yet.
    GetEdgeRemoteMac {
        /// Edge-facing interface name.
        intf: String,
        /// Real IPv4 address of the edge machine.
        ip: Ipv4Addr,
    },
    /// Resolve `intf`'s own hardware address.
    GetEdgeLocalMac {
        /// Interface name.
        intf: String,
    },
    /// Create (or attach to) the root namespace and its OVS bridge.
    AddRoot {
        /// First root-side internal address.
        self_ip: Ipv4Addr,
        /// Second root-side internal address.
        other_ip: Ipv4Addr,
        /// `true` if a prior worker already created the root; this worker
        /// only attaches.
        existing: bool,
    },
    /// Move an edge-facing interface into the root namespace and attach it
    /// to the bridge. Repeating the same `intf` is a no-op.
    AddEdgeInterface {
        /// Interface name.
        intf: String,
    },
    /// Materialise a topology node's namespace (and, for clients, its self
    /// and up veth pairs).
    AddHost {
        /// Dense node id.
        id: u32,
        /// Internal IPv4 address.
        ip: Ipv4Addr,
        /// Four MAC addresses: self-ns, self-root, up-ns, up-root side. Only
        /// the first two are meaningful for non-clients.
        macs: [MacAddr; 4],
        /// Shaping parameters.
        node: TopologyNode,
    },
    /// Apply shaping to a client's self interface, one-sided.
    SetSelfLink {
        /// Node id.
        id: u32,
        /// Shaping parameters.
        link: TopologyLink,
    },
    /// Widen ARP GC thresholds if the planned entry count exceeds the
    /// kernel's current soft ceiling.
    EnsureSystemScaling {
        /// Planned link count.
        links: u32,
        /// Planned node count.
        nodes: u32,
        /// Planned client count.
        clients: u32,
    },
    /// Create a veth pair between two node namespaces with shaping and
    /// `/32` link-scope routes on both ends.
    AddLink {
        /// Source node id.
        src_id: u32,
        /// Destination node id.
        dst_id: u32,
        /// Source-side link address.
        src_ip: Ipv4Addr,
        /// Destination-side link address.
        dst_ip: Ipv4Addr,
        /// Two MAC addresses, one per end.
        macs: [MacAddr; 2],
        /// Shaping parameters.
        link: TopologyLink,
    },
    /// Program one hop of an internal route in both directions.
    AddInternalRoutes {
        /// First node id.
        id1: u32,
        /// Second node id.
        id2: u32,
        /// First node's link-local address.
        ip1: Ipv4Addr,
        /// Second node's link-local address.
        ip2: Ipv4Addr,
        /// Subnet reachable via `id1`.
        subnet1: Ipv4Cidr,
        /// Subnet reachable via `id2`.
        subnet2: Ipv4Cidr,
    },
    /// Install a client's virtual subnet routes and OVS flow pairing.
    AddClientRoutes {
        /// Client node id.
        client_id: u32,
        /// Four MAC addresses mirroring [`WorkOrder::AddHost`].
        macs: [MacAddr; 4],
        /// Assigned virtual subnet.
        subnet: Ipv4Cidr,
        /// The edge's OVS port number.
        edge_port: u32,
    },
    /// Install ARP-responder and L3 flows pairing an edge's virtual subnet
    /// with its port.
    AddEdgeRoutes {
        /// Edge's virtual subnet.
        edge_subnet: Ipv4Cidr,
        /// Edge's OVS port number.
        edge_port: u32,
        /// Local (root-side) MAC.
        local_mac: MacAddr,
        /// Remote (edge machine) MAC.
        remote_mac: MacAddr,
    },
    /// Tear down every namespace this worker's cache holds open, plus (on
    /// the worker that owns it) the root OVS instance.
    DestroyHosts,
}
