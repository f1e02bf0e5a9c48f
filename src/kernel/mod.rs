//! Kernel network interface: namespace lifecycle, interfaces, addresses,
//! shaping, ARP, routes, policy rules, and the handful of sysctl/procfs
//! toggles the builder needs.
//!
//! Every operation here fails with [`crate::Error::Kernel`], carrying the OS
//! error number, so the driver can surface the original `errno` to the
//! operator.

mod addr;
mod link;
mod namespace;
mod neigh;
mod route;
mod rule;
mod shaping;
mod sysctl;

pub use addr::{add_address, IfAddr};
pub use link::{create_veth_pair, disable_gro, get_index, move_to_namespace, set_hw_address, set_up, LinkIndex};
pub use namespace::{open_default, switch, NamespaceContext, NamespaceDir, NamespaceId};
pub use neigh::{get_entry, get_local_mac, set_gc_thresholds_if_needed, set_static_entry, NeighEntry, NeighLookup};
pub use route::{add_route, Creator, Route, Scope, Table};
pub use rule::{add_rule, delete_rule_at, exists_at, Rule, USE_POLICY_TABLE};
pub use shaping::{set_netem, NetemParams, TicksPerMs};
pub use sysctl::{read_ticks_per_ms, set_accept_local, set_disable_ipv6, set_ip_forward};
