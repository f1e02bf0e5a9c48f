//! Integration tests that manipulate real kernel state: namespaces and veth
//! pairs. Skipped unless run as root, since namespace creation needs
//! `CAP_SYS_ADMIN`.

#![allow(clippy::unwrap_used)]

use std::net::Ipv4Addr;

use netmirage_core::kernel::{self, IfAddr, NamespaceDir};
use nix::unistd::Uid;

fn require_root() -> bool {
    if !Uid::effective().is_root() {
        eprintln!("skipping: test requires root (CAP_SYS_ADMIN)");
        return false;
    }
    true
}

#[test]
fn namespace_create_and_delete_round_trips() {
    if !require_root() {
        return;
    }
    let dir = NamespaceDir::init("nmtest-").unwrap();
    {
        let mut ctx = dir.open(9001, true, true).unwrap();
        kernel::set_up(&ctx, "lo").unwrap();
        let index = kernel::get_index(&ctx, "lo").unwrap();
        kernel::add_address(
            ctx.netlink(),
            index,
            IfAddr {
                address: Ipv4Addr::new(127, 0, 0, 1),
                prefix_len: 8,
                broadcast: None,
            },
        )
        .unwrap();
    }
    dir.delete(9001).unwrap();
}

#[test]
fn veth_pair_links_two_namespaces() {
    if !require_root() {
        return;
    }
    let dir = NamespaceDir::init("nmtest-").unwrap();
    // Open the peer first: opening a namespace switches the calling
    // process into it, so the source end must be opened last in order to
    // be the active namespace when create_veth_pair runs. `b` must stay
    // alive (and its fd open) for the duration of that call.
    let b = dir.open(9003, true, true).unwrap();
    let mut a = dir.open(9002, true, true).unwrap();
    kernel::create_veth_pair(a.netlink(), "nmtest-a", "nmtest-b", b.ns_fd()).unwrap();

    let a_index = kernel::get_index(&a, "nmtest-a").unwrap();
    kernel::set_up(&a, "nmtest-a").unwrap();
    kernel::add_address(
        a.netlink(),
        a_index,
        IfAddr {
            address: Ipv4Addr::new(10, 250, 0, 1),
            prefix_len: 30,
            broadcast: None,
        },
    )
    .unwrap();

    dir.delete(9002).unwrap();
    dir.delete(9003).unwrap();
}
