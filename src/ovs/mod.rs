//! Open vSwitch control: spawn an isolated `ovsdb-server`/`ovs-vswitchd`
//! pair inside a namespace, manage a bridge and its ports, and compose the
//! OpenFlow rules the builder needs (ARP responder, L3 match/rewrite).
//!
//! Every OVS binary is invoked as a child process with `OVS_RUNDIR` pointed
//! at this context's private state directory, so multiple contexts (one per
//! namespace that hosts a bridge) never collide on sockets or pidfiles.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::address::{Ipv4Cidr, MacAddr};
use crate::error::{Error, Result};

const COMPAT_VERSION_MAJOR: u32 = 2;
const COMPAT_VERSION_MINOR: u32 = 4;

/// A running (or about-to-be-started) OVS instance confined to one
/// namespace's working directory.
pub struct OvsContext {
    dir: PathBuf,
    schema: Option<PathBuf>,
    bridge: String,
    next_port: u32,
    needs_log_workaround: bool,
    ovsdb: Option<Child>,
    vswitchd: Option<Child>,
    known_ports: Vec<String>,
}

fn run(dir: &Path, program: &str, args: &[&str], needs_log_workaround: bool) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.env("OVS_RUNDIR", dir);
    cmd.args(args);
    if needs_log_workaround {
        cmd.arg("--log-file=/dev/null");
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    let output = cmd
        .output()
        .map_err(|e| Error::kernel(format!("failed to spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::OvsFailed {
            code: output.status.code().unwrap_or(-1),
            command: format!("{program} {}", args.join(" ")),
        });
    }
    Ok(())
}

fn spawn_daemon(dir: &Path, program: &str, args: &[&str], needs_log_workaround: bool) -> Result<Child> {
    let mut cmd = Command::new(program);
    cmd.env("OVS_RUNDIR", dir);
    cmd.args(args);
    if needs_log_workaround {
        cmd.arg("--log-file=/dev/null");
    }
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    cmd.spawn()
        .map_err(|e| Error::kernel(format!("failed to spawn {program}: {e}")))
}

/// Query `ovs-vsctl --version`, returning `(major, minor)`.
fn detect_version() -> Result<(u32, u32)> {
    let output = Command::new("ovs-vsctl")
        .arg("--version")
        .output()
        .map_err(|e| Error::kernel(format!("failed to run ovs-vsctl --version: {e}")))?;
    let text = String::from_utf8_lossy(&output.stdout);
    let version = text
        .lines()
        .find_map(|line| line.split_whitespace().last())
        .ok_or_else(|| Error::protocol("unexpected ovs-vsctl --version output"))?;
    let mut parts = version.split('.');
    let major: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol("unparseable ovs version"))?;
    let minor: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol("unparseable ovs version"))?;
    Ok((major, minor))
}

/// Probe `/proc/modules` for `openvswitch`, attempting `modprobe` once if
/// it's absent. A failed `modprobe` is logged as a warning, not fatal — a
/// kernel with the module built in never lists it in `/proc/modules`.
pub fn ensure_kernel_module() -> Result<()> {
    let modules = std::fs::read_to_string("/proc/modules").unwrap_or_default();
    if modules.lines().any(|l| l.starts_with("openvswitch ")) {
        return Ok(());
    }
    let status = Command::new("modprobe")
        .arg("openvswitch")
        .status();
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => {
            log::warn!("modprobe openvswitch exited with {s}; continuing");
            Ok(())
        }
        Err(e) => {
            log::warn!("failed to invoke modprobe openvswitch: {e}");
            Ok(())
        }
    }
}

impl OvsContext {
    /// Create a fresh database and spawn both daemons for `bridge` under
    /// `dir`. `schema` defaults to the package's standard vswitch schema
    /// path when `None`.
    pub fn start(dir: PathBuf, schema: Option<PathBuf>, bridge: String) -> Result<Self> {
        ensure_kernel_module()?;
        std::fs::create_dir_all(&dir).map_err(Error::from)?;
        let (major, minor) = detect_version()?;
        let needs_log_workaround = (major, minor) > (COMPAT_VERSION_MAJOR, COMPAT_VERSION_MINOR);

        let db_path = dir.join("conf.db");
        let schema_arg = schema
            .clone()
            .unwrap_or_else(|| PathBuf::from("/usr/share/openvswitch/vswitch.ovsschema"));
        run(
            &dir,
            "ovsdb-tool",
            &[
                "create",
                db_path.to_str().unwrap_or_default(),
                schema_arg.to_str().unwrap_or_default(),
            ],
            needs_log_workaround,
        )?;

        let sock_path = dir.join("db.sock");
        let ovsdb = spawn_daemon(
            &dir,
            "ovsdb-server",
            &[
                db_path.to_str().unwrap_or_default(),
                "--remote",
                &format!("punix:{}", sock_path.display()),
                "--pidfile",
                "--detach",
            ],
            needs_log_workaround,
        )?;

        run(
            &dir,
            "ovs-vsctl",
            &["--no-wait", "init"],
            needs_log_workaround,
        )?;

        let vswitchd = spawn_daemon(
            &dir,
            "ovs-vswitchd",
            &[&format!("unix:{}", sock_path.display()), "--pidfile", "--detach"],
            needs_log_workaround,
        )?;

        let ctx = Self {
            dir,
            schema,
            bridge: bridge.clone(),
            next_port: 1,
            needs_log_workaround,
            ovsdb: Some(ovsdb),
            vswitchd: Some(vswitchd),
            known_ports: Vec::new(),
        };
        ctx.add_bridge(&bridge)?;
        ctx.clear_flows(&bridge)?;
        Ok(ctx)
    }

    /// Attach to an already-running instance (used by every worker other
    /// than the one that called [`OvsContext::start`]).
    pub fn attach_existing(dir: PathBuf, schema: Option<PathBuf>, bridge: String) -> Result<Self> {
        let (major, minor) = detect_version()?;
        Ok(Self {
            dir,
            schema,
            bridge,
            next_port: 1,
            needs_log_workaround: (major, minor) > (COMPAT_VERSION_MAJOR, COMPAT_VERSION_MINOR),
            ovsdb: None,
            vswitchd: None,
            known_ports: Vec::new(),
        })
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        run(&self.dir, program, args, self.needs_log_workaround)
    }

    /// Tear down the OVS instance: stop daemons this context owns, then
    /// remove its working directory.
    pub fn destroy(&mut self) -> Result<()> {
        let _ = self.run("ovs-vsctl", &["--no-wait", "del-br", &self.bridge]);
        if let Some(mut child) = self.vswitchd.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(mut child) = self.ovsdb.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        std::fs::remove_dir_all(&self.dir).map_err(Error::from)
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        self.run("ovs-vsctl", &["--may-exist", "add-br", name])
    }

    /// Delete a bridge if present.
    pub fn delete_bridge(&self, name: &str) -> Result<()> {
        self.run("ovs-vsctl", &["--if-exists", "del-br", name])
    }

    /// Set a bridge's MTU.
    pub fn set_bridge_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.run(
            "ovs-vsctl",
            &["set", "interface", name, &format!("mtu_request={mtu}")],
        )
    }

    /// Add `iface` as a port on the bridge, returning its OpenFlow port
    /// number. Adding the same interface name twice is a no-op that returns
    /// the previously assigned number (scenario 5 of the testable
    /// properties: repeated `AddEdgeInterface` must not duplicate ports).
    pub fn add_port(&mut self, iface: &str) -> Result<u32> {
        if let Some(pos) = self.known_ports.iter().position(|p| p == iface) {
            return self.port_number(iface).or(Ok(pos as u32 + 1));
        }
        self.run("ovs-vsctl", &["--may-exist", "add-port", &self.bridge, iface])?;
        self.known_ports.push(iface.to_string());
        let port = self.port_number(iface)?;
        self.next_port = self.next_port.max(port + 1);
        Ok(port)
    }

    fn port_number(&self, iface: &str) -> Result<u32> {
        let output = Command::new("ovs-vsctl")
            .env("OVS_RUNDIR", &self.dir)
            .args(["get", "interface", iface, "ofport"])
            .output()
            .map_err(|e| Error::kernel(format!("failed to run ovs-vsctl get: {e}")))?;
        if !output.status.success() {
            return Err(Error::OvsFailed {
                code: output.status.code().unwrap_or(-1),
                command: format!("ovs-vsctl get interface {iface} ofport"),
            });
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| Error::protocol("unexpected ofport value"))
    }

    /// Remove all flows from the bridge.
    pub fn clear_flows(&self, bridge: &str) -> Result<()> {
        self.run("ovs-ofctl", &["del-flows", bridge])
    }

    /// Install a flow that answers ARP requests for `ip` with `mac`,
    /// rewriting the incoming request into a reply in place via explicit
    /// NXM field moves/loads, and sends it back out `in_port`.
    pub fn add_arp_responder_flow(&self, ip: Ipv4Addr, mac: MacAddr, priority: u16) -> Result<()> {
        let mac_hex = mac
            .octets()
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | byte as u64);
        let actions = format!(
            "move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],\
             mod_dl_src:{mac},\
             load:0x2->NXM_OF_ARP_OP[],\
             move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
             move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
             load:0x{mac_hex:x}->NXM_NX_ARP_SHA[],\
             load:0x{ip_hex:x}->NXM_OF_ARP_SPA[],\
             in_port",
            mac = mac,
            ip_hex = u32::from(ip),
        );
        let flow = format!(
            "priority={priority},arp,arp_op=1,arp_tpa={ip},actions={actions}"
        );
        self.run("ovs-ofctl", &["add-flow", &self.bridge, &flow])
    }

    /// Install an L3 match/rewrite flow: optionally match on an input port
    /// and/or source/destination subnet, rewrite source/destination MACs,
    /// then output on `out_port`.
    pub fn add_l3_flow(&self, spec: L3FlowSpec) -> Result<()> {
        let mut matches = vec!["ip".to_string()];
        if let Some(in_port) = spec.in_port {
            matches.push(format!("in_port={in_port}"));
        }
        if let Some(src) = spec.src_subnet {
            matches.push(format!("nw_src={src}"));
        }
        if let Some(dst) = spec.dst_subnet {
            matches.push(format!("nw_dst={dst}"));
        }
        let mut actions = Vec::new();
        if let Some(mac) = spec.rewrite_src_mac {
            actions.push(format!("mod_dl_src:{mac}"));
        }
        if let Some(mac) = spec.rewrite_dst_mac {
            actions.push(format!("mod_dl_dst:{mac}"));
        }
        actions.push(format!("output:{}", spec.out_port));
        let flow = format!(
            "priority={},{},actions={}",
            spec.priority,
            matches.join(","),
            actions.join(",")
        );
        self.run("ovs-ofctl", &["add-flow", &self.bridge, &flow])
    }

    /// The schema path this context was configured with, if any.
    pub fn schema(&self) -> Option<&Path> {
        self.schema.as_deref()
    }
}

/// Parameters for [`OvsContext::add_l3_flow`].
#[derive(Debug, Clone, Copy)]
pub struct L3FlowSpec {
    /// Optional input-port match.
    pub in_port: Option<u32>,
    /// Optional source-subnet match.
    pub src_subnet: Option<Ipv4Cidr>,
    /// Optional destination-subnet match.
    pub dst_subnet: Option<Ipv4Cidr>,
    /// Optional source MAC rewrite.
    pub rewrite_src_mac: Option<MacAddr>,
    /// Optional destination MAC rewrite.
    pub rewrite_dst_mac: Option<MacAddr>,
    /// Output port.
    pub out_port: u32,
    /// Flow priority.
    pub priority: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_workaround_triggers_above_2_4() {
        assert!((2u32, 5u32) > (COMPAT_VERSION_MAJOR, COMPAT_VERSION_MINOR));
        assert!((2u32, 4u32) == (COMPAT_VERSION_MAJOR, COMPAT_VERSION_MINOR));
        assert!(!((2u32, 4u32) > (COMPAT_VERSION_MAJOR, COMPAT_VERSION_MINOR)));
    }
}
