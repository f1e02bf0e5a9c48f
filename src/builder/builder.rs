//! Virtual-network construction: turns a GraphML event stream and a set of
//! edge-node descriptors into a running set of namespaces, veth links, and
//! OVS flow rules, driving the work pipeline through the six phases
//! described for this component.

use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;

use crate::address::{fragment, Ipv4Cidr, MacAddr, MacIter};
use crate::error::{Error, Result};
use crate::pipeline::{LogLevel, Pipeline, TopologyLink, TopologyNode, WorkOrder, WorkerResponse};
use crate::routeplan::RoutePlanner;

use super::edge::EdgeNode;
use super::graphml::{GraphEvent, GraphSource};

/// Everything the builder needs that isn't carried on the GraphML stream or
/// the edge-node list.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Number of worker processes to spawn (0 defaults to the CPU count).
    pub worker_count: usize,
    /// `/var/run/netns` filename prefix.
    pub ns_prefix: String,
    /// OVS working directory.
    pub ovs_dir: String,
    /// Optional OVS schema path override.
    pub ovs_schema: Option<String>,
    /// Soft memory cap for each worker's namespace cache, in bytes.
    pub soft_mem_cap: usize,
    /// Minimum level a worker forwards as a log frame.
    pub log_threshold: LogLevel,
    /// Whether the driver should colorize forwarded log lines.
    pub log_colorize: bool,
    /// Pool internal addresses (root links, per-node addresses) are drawn
    /// from, disjoint from every edge's virtual client subnet.
    pub internal_pool: Ipv4Cidr,
    /// Global virtual-client subnet, fragmented across edges.
    pub global_client_subnet: Ipv4Cidr,
    /// Default interface name used for an edge that doesn't specify one.
    pub default_interface: String,
    /// Starting MAC address for the allocator.
    pub mac_pool_start: MacAddr,
}

struct HostInfo {
    ip: Ipv4Addr,
    client: bool,
    macs: [MacAddr; 4],
}

/// Drives construction of a virtual network from a GraphML stream.
pub struct Builder {
    pipeline: Pipeline,
    options: BuildOptions,
    reserved: Vec<Ipv4Cidr>,
    internal_cursor: u64,
    macs: MacIter,
    reached_cleanup_point: bool,
}

impl Builder {
    /// Spawn the work pipeline and configure every worker.
    pub fn new(options: BuildOptions) -> Result<Self> {
        let worker_count = if options.worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            options.worker_count
        };
        let exe = std::env::current_exe().map_err(Error::from)?;
        let exe = exe
            .to_str()
            .ok_or_else(|| Error::config("executable path is not valid UTF-8"))?;
        let pipeline = Pipeline::spawn(worker_count, exe, &["--worker"])?;
        pipeline.broadcast(WorkOrder::Configure {
            ns_prefix: options.ns_prefix.clone(),
            ovs_dir: options.ovs_dir.clone(),
            ovs_schema: options.ovs_schema.clone(),
            soft_mem_cap: options.soft_mem_cap,
            log_threshold: options.log_threshold,
            log_colorize: options.log_colorize,
        })?;
        pipeline.join(false)?;

        let reserved = vec![
            "0.0.0.0/8".parse().expect("valid literal"),
            "127.0.0.0/8".parse().expect("valid literal"),
            "255.255.255.255/32".parse().expect("valid literal"),
        ];

        Ok(Self {
            pipeline,
            macs: MacIter::new(options.mac_pool_start),
            options,
            reserved,
            internal_cursor: 0,
            reached_cleanup_point: false,
        })
    }

    fn next_internal_addr(&mut self, avoid: &[Ipv4Cidr]) -> Result<Ipv4Addr> {
        let mut skip = self.reserved.clone();
        skip.extend_from_slice(avoid);
        let addr = self
            .options
            .internal_pool
            .addresses(skip, true)
            .nth(self.internal_cursor as usize)
            .ok_or_else(|| Error::exhausted("internal address pool exhausted"))?;
        self.internal_cursor += 1;
        Ok(addr)
    }

    /// Run every phase to completion. On any fatal error after root setup
    /// has started, issues a destroy pass before returning.
    pub fn build(
        mut self,
        events: impl GraphSource,
        edges: &mut [EdgeNode],
    ) -> Result<Vec<String>> {
        let result = self.try_build(events, edges);
        if result.is_err() && self.reached_cleanup_point {
            let _ = self.pipeline.broadcast(WorkOrder::DestroyHosts);
            let _ = self.pipeline.join(true);
        }
        let cleanup_result = self.pipeline.cleanup();
        result.and_then(|lines| cleanup_result.map(|()| lines))
    }

    fn try_build(
        &mut self,
        events: impl GraphSource,
        edges: &mut [EdgeNode],
    ) -> Result<Vec<String>> {
        let events: Vec<GraphEvent> = events.collect::<Result<Vec<_>>>()?;

        self.preflight(edges)?;
        self.root_setup(edges)?;
        self.reached_cleanup_point = true;

        let (name_to_id, mut hosts) = self.host_stream(&events)?;
        let planner = self.link_stream(&events, &name_to_id, &mut hosts)?;
        let client_counts = self.static_routing(edges, &name_to_id, &hosts, planner)?;

        Ok(render_edge_commands(edges, &client_counts))
    }

    /// Phase 1: complete edge-node descriptors.
    fn preflight(&mut self, edges: &mut [EdgeNode]) -> Result<()> {
        for edge in edges.iter_mut() {
            if edge.interface_name.is_empty() {
                edge.interface_name = self.options.default_interface.clone();
            }
        }
        for edge in edges.iter_mut() {
            if edge.real_mac.is_some() {
                continue;
            }
            self.pipeline.join(false)?;
            self.pipeline.submit(WorkOrder::GetEdgeRemoteMac {
                intf: edge.interface_name.clone(),
                ip: edge.real_ip,
            })?;
            self.pipeline.join(false)?;
            match self.pipeline.recv_data()? {
                WorkerResponse::GotMac { mac } => edge.real_mac = Some(mac),
                _ => return Err(Error::protocol("unexpected response to GetEdgeRemoteMac")),
            }
        }

        let missing: Vec<usize> = edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.virtual_client_subnet.is_none())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() {
            let fragments = fragment(self.options.global_client_subnet, edges.len() as u32)?;
            for i in missing {
                edges[i].virtual_client_subnet = Some(fragments[i]);
            }
        }
        Ok(())
    }

    /// Phase 2: root namespace, OVS bridge, and edge interface attachment.
    fn root_setup(&mut self, edges: &mut [EdgeNode]) -> Result<()> {
        let avoid: Vec<Ipv4Cidr> = edges
            .iter()
            .filter_map(|e| e.virtual_client_subnet)
            .collect();
        let self_ip = self.next_internal_addr(&avoid)?;
        let other_ip = self.next_internal_addr(&avoid)?;

        self.pipeline.submit(WorkOrder::AddRoot {
            self_ip,
            other_ip,
            existing: false,
        })?;
        self.pipeline.join(false)?;
        self.pipeline.broadcast(WorkOrder::AddRoot {
            self_ip,
            other_ip,
            existing: true,
        })?;
        self.pipeline.join(false)?;

        for edge in edges.iter_mut() {
            self.pipeline.join(false)?;
            self.pipeline.submit(WorkOrder::AddEdgeInterface {
                intf: edge.interface_name.clone(),
            })?;
            self.pipeline.join(false)?;
            match self.pipeline.recv_data()? {
                WorkerResponse::AddedEdgeInterface { port } => edge.port = Some(port),
                _ => return Err(Error::protocol("unexpected response to AddEdgeInterface")),
            }

            self.pipeline.join(false)?;
            self.pipeline.submit(WorkOrder::GetEdgeLocalMac {
                intf: edge.interface_name.clone(),
            })?;
            self.pipeline.join(false)?;
            match self.pipeline.recv_data()? {
                WorkerResponse::GotMac { mac } => edge.local_mac = Some(mac),
                _ => return Err(Error::protocol("unexpected response to GetEdgeLocalMac")),
            }

            let subnet = edge
                .virtual_client_subnet
                .expect("assigned during preflight");
            self.pipeline.join(false)?;
            self.pipeline.submit(WorkOrder::AddEdgeRoutes {
                edge_subnet: subnet,
                edge_port: edge.port.expect("assigned above"),
                local_mac: edge.local_mac.expect("assigned above"),
                remote_mac: edge.real_mac.expect("assigned during preflight"),
            })?;
        }
        self.pipeline.join(false)
    }

    /// Phase 3: materialize every node's namespace.
    fn host_stream(
        &mut self,
        events: &[GraphEvent],
    ) -> Result<(HashMap<String, u32>, Vec<HostInfo>)> {
        let mut name_to_id = HashMap::new();
        let mut hosts = Vec::new();
        let mut next_id: u32 = 0;

        for event in events {
            let GraphEvent::Node(n) = event else { continue };
            let id = next_id;
            next_id += 1;
            name_to_id.insert(n.name.clone(), id);

            let ip = self.next_internal_addr(&[])?;
            let macs = if n.client {
                let batch = self
                    .macs
                    .take_batch(4)
                    .ok_or_else(|| Error::exhausted("MAC address pool exhausted"))?;
                [batch[0], batch[1], batch[2], batch[3]]
            } else {
                [MacAddr::ZERO; 4]
            };

            let node = TopologyNode {
                client: n.client,
                packet_loss: n.packet_loss,
                bandwidth_up: n.bandwidth_up,
                bandwidth_down: n.bandwidth_down,
            };
            self.pipeline.submit(WorkOrder::AddHost { id, ip, macs, node })?;
            hosts.push(HostInfo {
                ip,
                client: n.client,
                macs,
            });
        }
        self.pipeline.join(false)?;
        Ok((name_to_id, hosts))
    }

    /// Phase 4: links, shaping, and planner edges.
    fn link_stream(
        &mut self,
        events: &[GraphEvent],
        name_to_id: &HashMap<String, u32>,
        hosts: &mut [HostInfo],
    ) -> Result<RoutePlanner> {
        let links: Vec<&super::graphml::LinkEvent> = events
            .iter()
            .filter_map(|e| match e {
                GraphEvent::Link(l) => Some(l),
                GraphEvent::Node(_) => None,
            })
            .collect();

        let clients = hosts.iter().filter(|h| h.client).count() as u32;

        let mut planner = RoutePlanner::new(hosts.len());
        self.pipeline.submit(WorkOrder::EnsureSystemScaling {
            links: links.len() as u32,
            nodes: hosts.len() as u32,
            clients,
        })?;

        for link in links {
            if link.weight < 0.0 {
                return Err(Error::config(format!(
                    "negative link weight between {} and {}",
                    link.source_name, link.target_name
                )));
            }
            let src_id = *name_to_id
                .get(&link.source_name)
                .ok_or_else(|| Error::config(format!("unknown node {}", link.source_name)))?;
            let dst_id = *name_to_id
                .get(&link.target_name)
                .ok_or_else(|| Error::config(format!("unknown node {}", link.target_name)))?;

            let shaping = TopologyLink {
                latency_ms: link.latency_ms,
                jitter_ms: link.jitter_ms,
                packet_loss: link.packet_loss,
                queue_len: link.queue_len,
                weight: link.weight,
            };

            if src_id == dst_id {
                if !hosts[src_id as usize].client {
                    return Err(Error::config(format!(
                        "reflexive link on non-client node {}",
                        link.source_name
                    )));
                }
                self.pipeline
                    .submit(WorkOrder::SetSelfLink { id: src_id, link: shaping })?;
                continue;
            }

            let batch = self
                .macs
                .take_batch(2)
                .ok_or_else(|| Error::exhausted("MAC address pool exhausted"))?;
            let src_ip = hosts[src_id as usize].ip;
            let dst_ip = hosts[dst_id as usize].ip;
            self.pipeline.submit(WorkOrder::AddLink {
                src_id,
                dst_id,
                src_ip,
                dst_ip,
                macs: [batch[0], batch[1]],
                link: shaping,
            })?;

            planner.set_weight(src_id, dst_id, link.weight as f32);
            planner.set_weight(dst_id, src_id, link.weight as f32);
        }
        self.pipeline.join(false)?;
        planner.plan();
        Ok(planner)
    }

    /// Phase 5: client subnet assignment and static routing.
    fn static_routing(
        &mut self,
        edges: &mut [EdgeNode],
        name_to_id: &HashMap<String, u32>,
        hosts: &[HostInfo],
        mut planner: RoutePlanner,
    ) -> Result<Vec<usize>> {
        if edges.is_empty() {
            return Err(Error::config("at least one edge node is required"));
        }
        let mut client_ids: Vec<u32> = name_to_id
            .values()
            .copied()
            .filter(|id| hosts[*id as usize].client)
            .collect();
        client_ids.sort_unstable();

        if (client_ids.len() as u32) < edges.len() as u32 {
            return Err(Error::config(
                "fewer clients than edges; every edge needs at least one client",
            ));
        }

        let mut per_edge_clients: Vec<Vec<u32>> = vec![Vec::new(); edges.len()];
        for (i, client_id) in client_ids.iter().enumerate() {
            per_edge_clients[i % edges.len()].push(*client_id);
        }

        let mut client_subnets: HashMap<u32, Ipv4Cidr> = HashMap::new();
        for (edge, assigned) in edges.iter().zip(per_edge_clients.iter()) {
            if assigned.is_empty() {
                continue;
            }
            let subnet = edge.virtual_client_subnet.expect("assigned during preflight");
            let fragments = fragment(subnet, assigned.len() as u32)?;
            for (client_id, fragment_subnet) in assigned.iter().zip(fragments) {
                client_subnets.insert(*client_id, fragment_subnet);
            }
        }

        for (edge, assigned) in edges.iter().zip(per_edge_clients.iter()) {
            for client_id in assigned {
                let host = &hosts[*client_id as usize];
                self.pipeline.join(false)?;
                self.pipeline.submit(WorkOrder::AddClientRoutes {
                    client_id: *client_id,
                    macs: host.macs,
                    subnet: client_subnets[client_id],
                    edge_port: edge.port.expect("assigned during root setup"),
                })?;
                self.pipeline.join(false)?;
            }
        }

        for (a_idx, &client_a) in client_ids.iter().enumerate() {
            for &client_b in &client_ids[a_idx + 1..] {
                let Some(path) = planner.route(client_a, client_b) else {
                    log::warn!("no route between client {client_a} and client {client_b}");
                    continue;
                };
                let subnet_a = client_subnets[&client_a];
                let subnet_b = client_subnets[&client_b];
                for hop in path.windows(2) {
                    let (p, q) = (hop[0], hop[1]);
                    self.pipeline.submit(WorkOrder::AddInternalRoutes {
                        id1: p,
                        id2: q,
                        ip1: hosts[p as usize].ip,
                        ip2: hosts[q as usize].ip,
                        subnet1: subnet_a,
                        subnet2: subnet_b,
                    })?;
                }
            }
        }
        self.pipeline.join(false)?;

        let client_counts = per_edge_clients.iter().map(Vec::len).collect();
        Ok(client_counts)
    }
}

/// Render one `netmirage-edge` invocation line per edge: every edge's
/// virtual subnet (so the edge process can recognize traffic destined for
/// its siblings), the number of clients routed behind this particular edge,
/// its local interface, real address, and its own virtual subnet.
fn render_edge_commands(edges: &[EdgeNode], client_counts: &[usize]) -> Vec<String> {
    let all_subnets: Vec<Ipv4Cidr> = edges
        .iter()
        .filter_map(|e| e.virtual_client_subnet)
        .collect();

    edges
        .iter()
        .zip(client_counts)
        .map(|(edge, count)| {
            let mut line = String::from("netmirage-edge");
            for subnet in &all_subnets {
                line.push_str(&format!(" -e {subnet}"));
            }
            line.push_str(&format!(" -c {count}"));
            line.push(' ');
            line.push_str(&edge.interface_name);
            line.push(' ');
            line.push_str(&edge.real_ip.to_string());
            if let Some(subnet) = edge.virtual_client_subnet {
                line.push(' ');
                line.push_str(&subnet.to_string());
            }
            // Number of remote applications behind this edge equals its
            // client count: every client namespace hosts exactly one.
            line.push_str(&format!(" {count}"));
            line
        })
        .collect()
}

/// Write rendered edge command lines, one per line, to `out`.
pub fn write_edge_commands(out: &mut impl Write, lines: &[String]) -> Result<()> {
    for line in lines {
        writeln!(out, "{line}").map_err(Error::from)?;
    }
    Ok(())
}
