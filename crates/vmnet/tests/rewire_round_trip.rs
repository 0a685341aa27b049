// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Round-trip test of the rewiring engine inside a throwaway namespace.
//! Manipulates real links, so it quietly skips unless run as root.

use std::os::unix::io::AsRawFd;

use cni::{Interface, IpConfig, NetworkResult, Route};
use vmnet::link::{extract_link_result, get_link_by_name};
use vmnet::netns::{create_pod_netns, destroy_pod_netns, with_netlink, with_netlink_in};
use vmnet::rewire::{configure_escape_link, create_escape_veth, ContainerSideNetwork};

fn sample_result(sandbox: &str) -> NetworkResult {
    NetworkResult {
        interfaces: vec![Interface {
            name: "eth0".to_string(),
            mac: "aa:bb:cc:00:11:22".to_string(),
            sandbox: sandbox.to_string(),
        }],
        ips: vec![IpConfig {
            interface: 0,
            address: "10.1.90.5/24".to_string(),
            gateway: "10.1.90.1".to_string(),
        }],
        routes: vec![Route {
            dst: "0.0.0.0/0".to_string(),
            gw: "10.1.90.1".to_string(),
        }],
        dns: Default::default(),
    }
}

#[test]
fn test_rewire_and_teardown_leave_no_trace() {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("skipping: requires root to manipulate namespaces");
        return;
    }

    let pod_id = "rt-p1";
    let ns = create_pod_netns(pod_id).unwrap();
    let ns_file = std::fs::File::open(ns.path()).unwrap();
    let ns_fd = ns_file.as_raw_fd();

    let result = sample_result(&ns.path().to_string_lossy());

    // provisioner stand-in: a veth pair with the container end configured
    with_netlink(|handle| async move {
        create_escape_veth(&handle, ns_fd, pod_id, "eth0").await
    })
    .unwrap();
    let cfg = result.clone();
    with_netlink_in(&ns, |handle| async move {
        configure_escape_link(&handle, pod_id, "eth0", 0, 1500, &cfg).await
    })
    .unwrap();

    // rewire: the tap must carry the veth's MAC, the bridge must exist
    let setup_result = result.clone();
    let csn = with_netlink_in(&ns, |handle| async move {
        ContainerSideNetwork::setup(&handle, &setup_result).await
    })
    .unwrap();
    assert_eq!(csn.container_mac(), "aa:bb:cc:00:11:22");
    assert!(csn.tap_fd() >= 0);

    with_netlink_in(&ns, |handle| async move {
        get_link_by_name(&handle, "vbr0").await.map(|_| ())
    })
    .unwrap();

    // teardown must restore the original addressing
    let captured = with_netlink_in(&ns, |handle| async move {
        let mut csn = csn;
        csn.teardown(&handle).await
    })
    .unwrap()
    .expect("single-IP capture missing");

    assert_eq!(captured.interfaces[0].name, "eth0");
    assert_eq!(captured.interfaces[0].mac, "aa:bb:cc:00:11:22");
    assert_eq!(captured.ips.len(), 1);
    assert_eq!(captured.ips[0].address, "10.1.90.5/24");
    assert_eq!(captured.ips[0].gateway, "10.1.90.1");
    assert_eq!(captured.routes.len(), 1);

    // the rewiring artifacts must be gone
    let leftover = with_netlink_in(&ns, |handle| async move {
        Ok(get_link_by_name(&handle, "vbr0").await.is_ok())
    })
    .unwrap();
    assert!(!leftover, "bridge vbr0 survived teardown");

    drop(ns);
    destroy_pod_netns(pod_id).unwrap();
}
