//! Thin CLI shim: receives this crate's own configuration record (worker
//! count, namespace prefix, OVS directory, memory cap, log level/color) and
//! wires it directly into [`netmirage_core::builder::Builder`].
//!
//! Parsing a general setup-file format and tokenizing GraphML documents are
//! external collaborators (see `SPEC_FULL.md` §1); this binary only accepts
//! a minimal line-oriented topology format so the crate is runnable
//! end-to-end for manual verification.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;

use netmirage_core::address::{Ipv4Cidr, MacAddr};
use netmirage_core::builder::{write_edge_commands, BuildOptions, Builder, EdgeNode, GraphEvent, LinkEvent, NodeEvent};
use netmirage_core::pipeline::LogLevel;
use netmirage_core::{Error, Result};

/// `netmirage-core` — orchestration engine for virtual test networks.
#[derive(Parser)]
#[command(about = "Build a virtual network of namespaces bridged to edge machines", long_about = None)]
struct Cli {
    /// Internal: run the worker order-dispatch loop on stdin/stdout instead
    /// of the builder. Set automatically when this binary respawns itself.
    #[arg(long, hide = true)]
    worker: bool,

    #[command(flatten)]
    build: BuildArgs,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Number of worker processes (0 selects the CPU count).
    #[arg(short = 'w', long, default_value_t = 0)]
    workers: usize,

    /// Filename prefix for entries under `/var/run/netns`.
    #[arg(long, default_value = "nm-")]
    ns_prefix: String,

    /// Working directory for the OVS database and daemon sockets.
    #[arg(long, default_value = "/var/lib/netmirage/ovs")]
    ovs_dir: String,

    /// Override the OVS schema file location.
    #[arg(long)]
    ovs_schema: Option<String>,

    /// Soft memory budget for each worker's namespace cache, in bytes.
    #[arg(long, default_value_t = 64 << 20)]
    soft_mem_cap: usize,

    /// Minimum level a worker forwards as a log line.
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Colorize forwarded worker log lines.
    #[arg(long)]
    log_color: bool,

    /// Subnet internal link/node addresses are drawn from.
    #[arg(long, default_value = "10.0.0.0/8")]
    internal_pool: String,

    /// Global virtual client address space, fragmented across edges.
    #[arg(long, default_value = "172.16.0.0/12")]
    client_subnet: String,

    /// Default edge-facing interface name when an edge omits one.
    #[arg(long, default_value = "eth0")]
    default_interface: String,

    /// First MAC address handed out by the allocator.
    #[arg(long, default_value = "02:00:00:00:00:01")]
    mac_start: String,

    /// Path to the edge-descriptor file (one `ip[,iface[,subnet]]` per
    /// line), or `-` for stdin.
    edges: String,

    /// Path to the topology file (line-oriented node/link records), or `-`
    /// for stdin.
    topology: String,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for LogLevel {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => LogLevel::Error,
            CliLogLevel::Warn => LogLevel::Warn,
            CliLogLevel::Info => LogLevel::Info,
            CliLogLevel::Debug => LogLevel::Debug,
            CliLogLevel::Trace => LogLevel::Trace,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.worker {
        let stdin = io::stdin();
        let stdout = io::stdout();
        return match netmirage_core::worker::run(stdin.lock(), stdout.lock()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("worker exited: {e}");
                ExitCode::FAILURE
            }
        };
    }

    env_logger::Builder::new()
        .filter_level(log::Level::from(LogLevel::from(cli.build.log_level)).to_level_filter())
        .write_style(if cli.build.log_color {
            env_logger::WriteStyle::Always
        } else {
            env_logger::WriteStyle::Never
        })
        .init();

    match run(cli.build) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: BuildArgs) -> Result<()> {
    let mut edges = read_edges(&args.edges)?;
    let events = read_topology(&args.topology)?;

    let options = BuildOptions {
        worker_count: args.workers,
        ns_prefix: args.ns_prefix,
        ovs_dir: args.ovs_dir,
        ovs_schema: args.ovs_schema,
        soft_mem_cap: args.soft_mem_cap,
        log_threshold: args.log_level.into(),
        log_colorize: args.log_color,
        internal_pool: Ipv4Cidr::from_str(&args.internal_pool)?,
        global_client_subnet: Ipv4Cidr::from_str(&args.client_subnet)?,
        default_interface: args.default_interface,
        mac_pool_start: MacAddr::from_str(&args.mac_start)?,
    };

    let builder = Builder::new(options)?;
    let lines = builder.build(events.into_iter().map(Ok::<GraphEvent, Error>), &mut edges)?;
    write_edge_commands(&mut io::stdout().lock(), &lines)
}

fn open_source(path: &str) -> Result<Box<dyn BufRead>> {
    if path == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(File::open(path).map_err(Error::from)?)))
    }
}

/// `ip[,iface[,subnet]]` per line.
fn read_edges(path: &str) -> Result<Vec<EdgeNode>> {
    let reader = open_source(path)?;
    let mut edges = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(Error::from)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split(',');
        let ip: Ipv4Addr = parts
            .next()
            .ok_or_else(|| Error::config("empty edge line"))?
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid edge address in {line:?}")))?;
        let mut edge = EdgeNode::new(ip);
        if let Some(iface) = parts.next() {
            let iface = iface.trim();
            if !iface.is_empty() {
                edge.interface_name = iface.to_string();
            }
        }
        if let Some(subnet) = parts.next() {
            let subnet = subnet.trim();
            if !subnet.is_empty() {
                edge.virtual_client_subnet = Some(Ipv4Cidr::from_str(subnet)?);
            }
        }
        edges.push(edge);
    }
    Ok(edges)
}

/// `node,<name>,<client 0|1>,<loss>,<up-mbps>,<down-mbps>` or
/// `link,<src>,<dst>,<latency-ms>,<jitter-ms>,<loss>,<queue>,<weight>` per
/// line.
fn read_topology(path: &str) -> Result<Vec<GraphEvent>> {
    let reader = open_source(path)?;
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(Error::from)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        match fields.as_slice() {
            ["node", name, client, loss, up, down] => {
                events.push(GraphEvent::Node(NodeEvent {
                    name: (*name).to_string(),
                    client: parse_field::<u8>(client)? != 0u8,
                    packet_loss: parse_field(loss)?,
                    bandwidth_up: parse_field(up)?,
                    bandwidth_down: parse_field(down)?,
                }));
            }
            ["link", src, dst, latency, jitter, loss, queue, weight] => {
                events.push(GraphEvent::Link(LinkEvent {
                    source_name: (*src).to_string(),
                    target_name: (*dst).to_string(),
                    latency_ms: parse_field(latency)?,
                    jitter_ms: parse_field(jitter)?,
                    packet_loss: parse_field(loss)?,
                    queue_len: parse_field(queue)?,
                    weight: parse_field(weight)?,
                }));
            }
            _ => return Err(Error::config(format!("malformed topology line {line:?}"))),
        }
    }
    Ok(events)
}

fn parse_field<T: FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::config(format!("invalid field {s:?}")))
}
