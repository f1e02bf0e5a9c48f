//! Worker body: a single-threaded order-dispatch loop run inside a process
//! that has forked off the driver, reading orders from stdin and writing
//! responses to stdout.

use std::io::{self, Write};
use std::net::Ipv4Addr;

use crate::address::{Ipv4Cidr, MacAddr};
use crate::error::{Error, Result};
use crate::kernel::{self, NetemParams, Route, TicksPerMs};
use crate::nscache::NamespaceCache;
use crate::ovs::{self, L3FlowSpec, OvsContext};
use crate::pipeline::{read_frame, write_frame, LogLevel, WorkOrder, WorkerResponse};

const ROOT_NS_ID: u32 = u32::MAX;

// Only consulted when `kernel::USE_POLICY_TABLE` is enabled.
const POLICY_TABLE_SELF: u32 = 100;
const POLICY_TABLE_OTHER: u32 = 101;
const POLICY_RULE_PRIORITY_BASE: u32 = 32000;

struct WorkerState {
    configured: bool,
    cache: Option<NamespaceCache>,
    ovs: Option<OvsContext>,
    ovs_dir: String,
    ovs_schema: Option<String>,
    ticks_per_ms: TicksPerMs,
    edge_ports: Vec<(String, u32)>,
    log_threshold: LogLevel,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            configured: false,
            cache: None,
            ovs: None,
            ovs_dir: String::new(),
            ovs_schema: None,
            ticks_per_ms: TicksPerMs(1.0),
            edge_ports: Vec::new(),
            log_threshold: LogLevel::Info,
        }
    }

    fn cache(&mut self) -> Result<&mut NamespaceCache> {
        self.cache
            .as_mut()
            .ok_or_else(|| Error::protocol("worker used before Configure"))
    }
}

/// Run the worker loop to completion against `stdin`/`stdout`. Returns once
/// a `Terminate` order is read or the stream closes.
pub fn run(mut stdin: impl io::Read, mut stdout: impl Write) -> Result<()> {
    let mut state = WorkerState::new();
    loop {
        let order: Option<WorkOrder> = read_frame(&mut stdin)?;
        let Some(order) = order else {
            return Ok(());
        };
        if matches!(order, WorkOrder::Terminate) {
            return Ok(());
        }
        match dispatch(&mut state, order) {
            Ok(Some(response)) => write_frame(&mut stdout, &response)?,
            Ok(None) => {}
            Err(e) => {
                log::error!("{e}");
                write_frame(
                    &mut stdout,
                    &WorkerResponse::Error {
                        code: crate::pipeline::error_code(&e),
                    },
                )?;
            }
        }
    }
}

fn dispatch(state: &mut WorkerState, order: WorkOrder) -> Result<Option<WorkerResponse>> {
    match order {
        WorkOrder::Terminate => unreachable!("handled by caller"),
        WorkOrder::Ping => Ok(Some(WorkerResponse::Pong)),
        WorkOrder::Configure {
            ns_prefix,
            ovs_dir,
            ovs_schema,
            soft_mem_cap,
            log_threshold,
            log_colorize: _,
        } => {
            if state.configured {
                return Err(Error::protocol("Configure received twice"));
            }
            state.cache = Some(NamespaceCache::new(ns_prefix, soft_mem_cap)?);
            state.ovs_dir = ovs_dir;
            state.ovs_schema = ovs_schema;
            state.ticks_per_ms = kernel::read_ticks_per_ms().unwrap_or(TicksPerMs(1.0));
            state.log_threshold = log_threshold;
            state.configured = true;
            Ok(None)
        }
        WorkOrder::GetEdgeRemoteMac { intf, ip } => {
            let cache = state.cache()?;
            let root = cache.open(ROOT_NS_ID, true, false)?;
            let index = kernel::get_index(root, &intf)?;
            for attempt in 0..3 {
                if attempt > 0 {
                    let _ = std::process::Command::new("ping")
                        .args(["-c", "1", "-W", "1"])
                        .arg(ip.to_string())
                        .status();
                    std::thread::sleep(std::time::Duration::from_secs(1));
                }
                let root = state.cache()?.open(ROOT_NS_ID, false, false)?;
                match kernel::get_entry(root.netlink(), index, ip)? {
                    kernel::NeighLookup::Found(mac) => {
                        return Ok(Some(WorkerResponse::GotMac { mac }))
                    }
                    kernel::NeighLookup::AgainNotCached => continue,
                }
            }
            Err(Error::exhausted(format!(
                "could not resolve remote MAC for {ip} on {intf} after 3 attempts"
            )))
        }
        WorkOrder::GetEdgeLocalMac { intf } => {
            let cache = state.cache()?;
            let root = cache.open(ROOT_NS_ID, true, false)?;
            let index = kernel::get_index(root, &intf)?;
            let mac = kernel::get_local_mac(root.netlink(), index)?;
            Ok(Some(WorkerResponse::GotMac { mac }))
        }
        WorkOrder::AddRoot {
            self_ip,
            other_ip,
            existing,
        } => {
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let ctx = cache.open(ROOT_NS_ID, !existing, false)?;
            if !existing {
                let self_idx = kernel::get_index(ctx, "lo")?;
                kernel::add_address(
                    ctx.netlink(),
                    self_idx,
                    kernel::IfAddr {
                        address: self_ip,
                        prefix_len: 32,
                        broadcast: None,
                    },
                )?;
                kernel::add_address(
                    ctx.netlink(),
                    self_idx,
                    kernel::IfAddr {
                        address: other_ip,
                        prefix_len: 32,
                        broadcast: None,
                    },
                )?;
                // Root forwards between edge interfaces and the internal
                // fabric; IPv6 is never programmed here.
                kernel::set_ip_forward(true)?;
                kernel::set_disable_ipv6(true)?;
                if kernel::USE_POLICY_TABLE {
                    for (i, (addr, table)) in
                        [(self_ip, POLICY_TABLE_SELF), (other_ip, POLICY_TABLE_OTHER)]
                            .into_iter()
                            .enumerate()
                    {
                        let priority = POLICY_RULE_PRIORITY_BASE + i as u32;
                        // A stale rule from a prior run at this priority
                        // would otherwise make the EXCL add below fail.
                        if kernel::exists_at(ctx.netlink(), priority)? {
                            kernel::delete_rule_at(ctx.netlink(), priority)?;
                        }
                        kernel::add_rule(
                            ctx.netlink(),
                            kernel::Rule {
                                priority,
                                src: Some((addr, 32)),
                                table: kernel::Table::Custom(table),
                            },
                        )?;
                    }
                }
                state.ovs = Some(OvsContext::start(
                    state.ovs_dir.clone().into(),
                    state.ovs_schema.clone().map(Into::into),
                    "netmirage-br0".to_string(),
                )?);
            } else if state.ovs.is_none() {
                // The driver elects one worker to run existing=false, then
                // broadcasts existing=true to every worker including that
                // one. Skip re-attaching where AddRoot already ran, or this
                // would drop the live ovsdb/vswitchd child handles.
                state.ovs = Some(OvsContext::attach_existing(
                    state.ovs_dir.clone().into(),
                    state.ovs_schema.clone().map(Into::into),
                    "netmirage-br0".to_string(),
                )?);
            }
            Ok(None)
        }
        WorkOrder::AddEdgeInterface { intf } => {
            if let Some((_, port)) = state.edge_ports.iter().find(|(name, _)| name == &intf) {
                return Ok(Some(WorkerResponse::AddedEdgeInterface { port: *port }));
            }
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let root_ns_fd = cache.open(ROOT_NS_ID, false, false)?.ns_fd();

            // The interface still lives in the host's default namespace; a
            // netlink socket only sees it there, so it has to be resolved
            // and moved before anything in `root` can touch it.
            let mut host = kernel::open_default()?;
            let host_index = kernel::get_index(&host, &intf)?;
            kernel::move_to_namespace(host.netlink(), host_index, root_ns_fd)?;

            let root = state
                .cache
                .as_mut()
                .ok_or_else(|| Error::protocol("not configured"))?
                .open(ROOT_NS_ID, false, false)?;
            kernel::set_up(root, &intf)?;
            kernel::disable_gro(root, &intf)?;
            let ovs = state
                .ovs
                .as_mut()
                .ok_or_else(|| Error::protocol("AddEdgeInterface before AddRoot"))?;
            let port = ovs.add_port(&intf)?;
            state.edge_ports.push((intf, port));
            Ok(Some(WorkerResponse::AddedEdgeInterface { port }))
        }
        WorkOrder::AddHost { id, ip, macs, node } => {
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let ns_name = format!("host-{id}");
            let ctx = cache.open(id, true, true)?;
            kernel::set_up(ctx, "lo")?;
            if node.client {
                build_client_links(cache, id, ip, macs, node, state.ticks_per_ms)?;
            }
            let _ = ns_name;
            Ok(None)
        }
        WorkOrder::SetSelfLink { id, link } => {
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let ctx = cache.open(id, false, false)?;
            let ifname = format!("self-{id}");
            let index = kernel::get_index(ctx, &ifname)?;
            kernel::set_netem(
                ctx.netlink(),
                index,
                NetemParams {
                    latency_ms: link.latency_ms,
                    jitter_ms: link.jitter_ms,
                    loss: link.packet_loss,
                    queue_len: link.queue_len,
                    rate_mbps: None,
                },
                state.ticks_per_ms,
            )?;
            Ok(None)
        }
        WorkOrder::EnsureSystemScaling {
            links: _,
            nodes: _,
            clients,
        } => {
            kernel::set_gc_thresholds_if_needed(clients * 4)?;
            Ok(None)
        }
        WorkOrder::AddLink {
            src_id,
            dst_id,
            src_ip,
            dst_ip,
            macs,
            link,
        } => {
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let src_if = format!("l{src_id}-{dst_id}");
            let dst_if = format!("l{dst_id}-{src_id}");

            // Grab the destination namespace's fd before switching the
            // active namespace to the source, since create_veth_pair needs
            // both: the source as the currently active namespace and the
            // destination fd to park the peer end in.
            let dst_ns_fd = cache.open(dst_id, false, false)?.ns_fd();

            let src_ctx = cache.open(src_id, false, false)?;
            kernel::create_veth_pair(src_ctx.netlink(), &src_if, &dst_if, dst_ns_fd)?;
            let src_index = kernel::get_index(src_ctx, &src_if)?;
            kernel::set_hw_address(src_ctx.netlink(), src_index, macs[0].octets())?;
            kernel::add_address(
                src_ctx.netlink(),
                src_index,
                kernel::IfAddr {
                    address: src_ip,
                    prefix_len: 32,
                    broadcast: None,
                },
            )?;
            kernel::set_up(src_ctx, &src_if)?;
            kernel::disable_gro(src_ctx, &src_if)?;
            kernel::set_netem(
                src_ctx.netlink(),
                src_index,
                netem_from_link(&link),
                state.ticks_per_ms,
            )?;
            kernel::add_route(
                src_ctx.netlink(),
                Route {
                    destination: dst_ip,
                    prefix_len: 32,
                    gateway: None,
                    out_interface: Some(src_index),
                    table: kernel::Table::Main,
                    scope: kernel::Scope::Link,
                    creator: kernel::Creator::Admin,
                },
            )?;

            let dst_ctx = cache.open(dst_id, false, false)?;
            let dst_index = kernel::get_index(dst_ctx, &dst_if)?;
            kernel::set_hw_address(dst_ctx.netlink(), dst_index, macs[1].octets())?;
            kernel::add_address(
                dst_ctx.netlink(),
                dst_index,
                kernel::IfAddr {
                    address: dst_ip,
                    prefix_len: 32,
                    broadcast: None,
                },
            )?;
            kernel::set_up(dst_ctx, &dst_if)?;
            kernel::disable_gro(dst_ctx, &dst_if)?;
            kernel::set_netem(
                dst_ctx.netlink(),
                dst_index,
                netem_from_link(&link),
                state.ticks_per_ms,
            )?;
            kernel::add_route(
                dst_ctx.netlink(),
                Route {
                    destination: src_ip,
                    prefix_len: 32,
                    gateway: None,
                    out_interface: Some(dst_index),
                    table: kernel::Table::Main,
                    scope: kernel::Scope::Link,
                    creator: kernel::Creator::Admin,
                },
            )?;
            Ok(None)
        }
        WorkOrder::AddInternalRoutes {
            id1,
            id2,
            ip1,
            ip2,
            subnet1,
            subnet2,
        } => {
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let ctx1 = cache.open(id1, false, false)?;
            add_or_log_route(ctx1.netlink(), subnet2, ip2, kernel::Table::Main)?;
            let ctx2 = cache.open(id2, false, false)?;
            add_or_log_route(ctx2.netlink(), subnet1, ip1, kernel::Table::Main)?;
            Ok(None)
        }
        WorkOrder::AddClientRoutes {
            client_id,
            macs,
            subnet,
            edge_port,
        } => {
            let cache = state.cache.as_mut().ok_or_else(|| Error::protocol("not configured"))?;
            let ctx = cache.open(client_id, false, false)?;
            let up_if = format!("up-{client_id}");
            let up_index = kernel::get_index(ctx, &up_if)?;
            kernel::add_route(
                ctx.netlink(),
                Route {
                    destination: subnet.network(),
                    prefix_len: subnet.prefix_len(),
                    gateway: None,
                    out_interface: Some(up_index),
                    table: kernel::Table::Main,
                    scope: kernel::Scope::Link,
                    creator: kernel::Creator::Admin,
                },
            )?;
            let ovs = state
                .ovs
                .as_ref()
                .ok_or_else(|| Error::protocol("AddClientRoutes before AddRoot"))?;
            ovs.add_l3_flow(L3FlowSpec {
                in_port: Some(edge_port),
                src_subnet: None,
                dst_subnet: Some(subnet),
                rewrite_src_mac: Some(macs[1]),
                rewrite_dst_mac: Some(macs[2]),
                out_port: edge_port,
                priority: 100,
            })?;
            Ok(None)
        }
        WorkOrder::AddEdgeRoutes {
            edge_subnet,
            edge_port,
            local_mac,
            remote_mac,
        } => {
            let ovs = state
                .ovs
                .as_ref()
                .ok_or_else(|| Error::protocol("AddEdgeRoutes before AddRoot"))?;
            for host in edge_subnet.addresses(Vec::new(), true) {
                ovs.add_arp_responder_flow(host, local_mac, 200)?;
            }
            ovs.add_l3_flow(L3FlowSpec {
                in_port: None,
                src_subnet: Some(edge_subnet),
                dst_subnet: None,
                rewrite_src_mac: Some(local_mac),
                rewrite_dst_mac: Some(remote_mac),
                out_port: edge_port,
                priority: 50,
            })?;
            Ok(None)
        }
        WorkOrder::DestroyHosts => {
            if let Some(cache) = state.cache.as_mut() {
                restore_edge_interfaces(cache, &state.edge_ports);
                cache.clear()?;
            }
            state.edge_ports.clear();
            if let Some(ovs) = state.ovs.as_mut() {
                ovs.destroy()?;
            }
            Ok(None)
        }
    }
}

/// Best-effort: move every attached edge interface back to the host's
/// default namespace before the root namespace is deleted underneath it.
/// Failures are logged, not propagated, matching the destroy pass's
/// log-and-continue policy for cleanup.
fn restore_edge_interfaces(cache: &mut NamespaceCache, edge_ports: &[(String, u32)]) {
    if edge_ports.is_empty() {
        return;
    }
    let Ok(root) = cache.open(ROOT_NS_ID, false, false) else {
        return;
    };
    let Ok(host) = kernel::open_default() else {
        log::warn!("could not reach default namespace to restore edge interfaces");
        return;
    };
    let host_fd = host.ns_fd();
    for (name, _) in edge_ports {
        match kernel::get_index(root, name) {
            Ok(index) => {
                if let Err(e) = kernel::move_to_namespace(root.netlink(), index, host_fd) {
                    log::warn!("failed to restore edge interface {name}: {e}");
                }
            }
            Err(e) => log::warn!("failed to resolve edge interface {name} during teardown: {e}"),
        }
    }
}

fn netem_from_link(link: &crate::pipeline::TopologyLink) -> NetemParams {
    NetemParams {
        latency_ms: link.latency_ms,
        jitter_ms: link.jitter_ms,
        loss: link.packet_loss,
        queue_len: link.queue_len,
        rate_mbps: None,
    }
}

fn add_or_log_route(
    netlink: &mut crate::netlink::NetlinkSocket,
    subnet: Ipv4Cidr,
    gateway: Ipv4Addr,
    table: kernel::Table,
) -> Result<()> {
    kernel::add_route(
        netlink,
        Route {
            destination: subnet.network(),
            prefix_len: subnet.prefix_len(),
            gateway: Some(gateway),
            out_interface: None,
            table,
            scope: kernel::Scope::Global,
            creator: kernel::Creator::Admin,
        },
    )
}

fn build_client_links(
    cache: &mut NamespaceCache,
    id: u32,
    ip: Ipv4Addr,
    macs: [MacAddr; 4],
    node: crate::pipeline::TopologyNode,
    ticks_per_ms: TicksPerMs,
) -> Result<()> {
    let self_if = format!("self-{id}");
    let up_if = format!("up-{id}");
    let self_peer_if = format!("{self_if}-r");
    let up_peer_if = format!("{up_if}-r");

    // Both peers land in root, not in the client's own namespace: root is
    // what bridges a client to every other client and to the edges.
    let root_ns_fd = cache.open(ROOT_NS_ID, false, false)?.ns_fd();

    let ctx = cache.open(id, false, false)?;
    kernel::create_veth_pair(ctx.netlink(), &self_if, &self_peer_if, root_ns_fd)?;
    let self_index = kernel::get_index(ctx, &self_if)?;
    kernel::set_hw_address(ctx.netlink(), self_index, macs[0].octets())?;
    kernel::add_address(
        ctx.netlink(),
        self_index,
        kernel::IfAddr {
            address: ip,
            prefix_len: 32,
            broadcast: None,
        },
    )?;
    kernel::set_up(ctx, &self_if)?;
    kernel::disable_gro(ctx, &self_if)?;

    kernel::create_veth_pair(ctx.netlink(), &up_if, &up_peer_if, root_ns_fd)?;
    let up_index = kernel::get_index(ctx, &up_if)?;
    kernel::set_hw_address(ctx.netlink(), up_index, macs[2].octets())?;
    kernel::set_up(ctx, &up_if)?;
    kernel::disable_gro(ctx, &up_if)?;
    // The client forwards between self and up; accept_local lets return
    // traffic whose source equals a local address arrive on the other leg.
    kernel::set_ip_forward(true)?;
    kernel::set_accept_local(&up_if, true)?;
    kernel::set_netem(
        ctx.netlink(),
        up_index,
        NetemParams {
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss: node.packet_loss,
            queue_len: 0,
            rate_mbps: Some(node.bandwidth_up),
        },
        ticks_per_ms,
    )?;

    let neigh_entry = kernel::NeighEntry { ip, mac: macs[0] };
    kernel::set_static_entry(ctx.netlink(), self_index, neigh_entry)?;

    let root = cache.open(ROOT_NS_ID, false, false)?;
    let self_peer_index = kernel::get_index(root, &self_peer_if)?;
    kernel::set_hw_address(root.netlink(), self_peer_index, macs[1].octets())?;
    kernel::set_up(root, &self_peer_if)?;
    kernel::disable_gro(root, &self_peer_if)?;

    let up_peer_index = kernel::get_index(root, &up_peer_if)?;
    kernel::set_hw_address(root.netlink(), up_peer_index, macs[3].octets())?;
    kernel::set_up(root, &up_peer_if)?;
    kernel::disable_gro(root, &up_peer_if)?;

    let _ = ovs::ensure_kernel_module();
    Ok(())
}
