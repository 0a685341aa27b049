// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Turns provisioner-configured veth endpoints into a VM-consumable
//! tap-plus-bridge topology and back. All functions must run with a netlink
//! handle bound inside the pod namespace
//! (see [`crate::netns::with_netlink_in`]).

use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use rtnetlink::Handle;
use slog::warn;

use cni::{Interface, NetworkResult};

use crate::link::{
    apply_link_info, extract_link_info, extract_link_result, flush_link, get_link_by_name,
    parse_ip_cidr, parse_mac, LinkInfo,
};
use crate::tap::Tap;

macro_rules! sl {
    () => {
        slog_scope::logger().new(slog::o!("subsystem" => "rewire"))
    };
}

/// One rewired interface: the original veth, the tap carrying its MAC, and
/// the bridge gluing the two together.
#[derive(Debug)]
pub struct RewiredInterface {
    pub name: String,
    pub hard_addr: String,
    pub tap_name: String,
    pub bridge_name: String,
    pub info: LinkInfo,
    pub tap: Tap,
}

/// The pod's container-side network state while a VM owns its taps.
#[derive(Debug)]
pub struct ContainerSideNetwork {
    pub result: NetworkResult,
    ifaces: Vec<RewiredInterface>,
}

impl ContainerSideNetwork {
    /// Rewire every sandbox interface of `result`. On failure, interfaces
    /// already rewired are unwound and the namespace is left as the
    /// provisioner configured it.
    pub async fn setup(handle: &Handle, result: &NetworkResult) -> Result<Self> {
        let mut ifaces: Vec<RewiredInterface> = Vec::new();
        for (idx, iface) in result.sandbox_interfaces() {
            match rewire_interface(handle, idx, iface).await {
                Ok(rewired) => ifaces.push(rewired),
                Err(e) => {
                    while let Some(done) = ifaces.pop() {
                        let name = done.name.clone();
                        if let Err(undo_err) = teardown_interface(handle, done).await {
                            warn!(
                                sl!(),
                                "failed to unwind interface {:?} after setup error: {:?}",
                                name,
                                undo_err
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        if ifaces.is_empty() {
            bail!("network result contains no sandbox interfaces");
        }
        Ok(ContainerSideNetwork {
            result: result.clone(),
            ifaces,
        })
    }

    /// Descriptor of the tap handed to the VM launcher.
    pub fn tap_fd(&self) -> RawFd {
        self.ifaces[0].tap.as_raw_fd()
    }

    /// MAC of the container link, now presented by the tap.
    pub fn container_mac(&self) -> &str {
        &self.ifaces[0].hard_addr
    }

    /// Undo the rewiring, leaving the namespace as the provisioner left it.
    ///
    /// When the result carries exactly one IP, the restored link's state is
    /// re-read and returned so callers can check that the rewiring was
    /// externally invisible.
    pub async fn teardown(&mut self, handle: &Handle) -> Result<Option<NetworkResult>> {
        while let Some(iface) = self.ifaces.pop() {
            let name = iface.name.clone();
            teardown_interface(handle, iface)
                .await
                .with_context(|| format!("unwire interface {:?}", name))?;
        }

        if self.result.ips.len() == 1 {
            let ip = &self.result.ips[0];
            let iface = self
                .result
                .interfaces
                .get(ip.interface)
                .ok_or_else(|| anyhow!("bad interface index {}", ip.interface))?;
            let captured = extract_link_result(handle, &iface.name, &iface.sandbox)
                .await
                .context("capture link state after teardown")?;
            return Ok(Some(captured));
        }
        // TODO: also capture multi-interface configurations once the result
        // format can attribute routes to interfaces
        Ok(None)
    }
}

async fn rewire_interface(
    handle: &Handle,
    idx: usize,
    iface: &Interface,
) -> Result<RewiredInterface> {
    let tap_name = format!("vtap{}", idx);
    let bridge_name = format!("vbr{}", idx);

    let info = extract_link_info(handle, &iface.name)
        .await
        .with_context(|| format!("inspect container link {:?}", iface.name))?;

    flush_link(handle, &info)
        .await
        .with_context(|| format!("detach addresses from {:?}", iface.name))?;

    // The link is bare from here on: every failure below must put its
    // addresses back before surfacing.
    match glue_tap_and_bridge(handle, &info, &tap_name, &bridge_name).await {
        Ok(tap) => Ok(RewiredInterface {
            name: info.name.clone(),
            hard_addr: info.hard_addr.clone(),
            tap_name: tap.name(),
            bridge_name,
            info,
            tap,
        }),
        Err(e) => {
            if let Err(restore_err) = apply_link_info(handle, &info, info.index).await {
                warn!(
                    sl!(),
                    "failed to restore {:?} after rewire error: {:?}", info.name, restore_err
                );
            }
            Err(e)
        }
    }
}

async fn glue_tap_and_bridge(
    handle: &Handle,
    info: &LinkInfo,
    tap_name: &str,
    bridge_name: &str,
) -> Result<Tap> {
    // The tap link exists while this fd is held; dropping `tap` on any error
    // below removes it again. Look the link up under the name the kernel
    // actually assigned.
    let tap = Tap::open_named(tap_name).with_context(|| format!("open tap {:?}", tap_name))?;
    let tap_index = get_link_by_name(handle, &tap.name()).await?.header.index;

    let mac =
        parse_mac(&info.hard_addr).ok_or_else(|| anyhow!("bad mac {:?}", info.hard_addr))?;
    handle
        .link()
        .set(tap_index)
        .address(mac.to_vec())
        .mtu(info.mtu)
        .up()
        .execute()
        .await
        .with_context(|| format!("configure tap {:?}", tap_name))?;

    handle
        .link()
        .add()
        .bridge(bridge_name.to_string())
        .execute()
        .await
        .with_context(|| format!("create bridge {:?}", bridge_name))?;
    let bridge_index = get_link_by_name(handle, bridge_name).await?.header.index;

    let glued = async {
        handle
            .link()
            .set(bridge_index)
            .mtu(info.mtu)
            .up()
            .execute()
            .await
            .with_context(|| format!("bring bridge {:?} up", bridge_name))?;
        handle
            .link()
            .set(info.index)
            .master(bridge_index)
            .execute()
            .await
            .with_context(|| format!("enslave {:?} to {:?}", info.name, bridge_name))?;
        handle
            .link()
            .set(tap_index)
            .master(bridge_index)
            .execute()
            .await
            .with_context(|| format!("enslave {:?} to {:?}", tap_name, bridge_name))?;
        apply_link_info(handle, info, bridge_index)
            .await
            .with_context(|| format!("move addresses of {:?} to {:?}", info.name, bridge_name))
    }
    .await;

    if let Err(e) = glued {
        if let Err(del_err) = handle.link().del(bridge_index).execute().await {
            warn!(
                sl!(),
                "failed to remove bridge {:?}: {:?}", bridge_name, del_err
            );
        }
        return Err(e);
    }
    Ok(tap)
}

async fn teardown_interface(handle: &Handle, iface: RewiredInterface) -> Result<()> {
    // Closing the tap fd removes the tap link.
    drop(iface.tap);

    let bridge_index = get_link_by_name(handle, &iface.bridge_name).await?.header.index;
    handle
        .link()
        .del(bridge_index)
        .execute()
        .await
        .with_context(|| format!("delete bridge {:?}", iface.bridge_name))?;

    apply_link_info(handle, &iface.info, iface.info.index)
        .await
        .with_context(|| format!("restore addresses to {:?}", iface.name))?;
    Ok(())
}

/// Create a veth pair whose peer sits inside the pod namespace. Used by test
/// provisioners that have no plugin chain to delegate to. `tag` keeps the
/// host-side names of concurrently wired pods apart. The peer is left
/// unconfigured; finish it with [`configure_escape_link`] from inside the
/// namespace.
pub async fn create_escape_veth(
    handle: &Handle,
    ns_fd: RawFd,
    tag: &str,
    ifname: &str,
) -> Result<String> {
    let host_name = format!("vh{}-{}", tag, ifname);
    let peer_name = format!("vc{}-{}", tag, ifname);

    handle
        .link()
        .add()
        .veth(host_name.clone(), peer_name.clone())
        .execute()
        .await
        .with_context(|| format!("create escape veth pair for {:?}", ifname))?;

    let host_index = get_link_by_name(handle, &host_name).await?.header.index;
    let peer_index = get_link_by_name(handle, &peer_name).await?.header.index;

    handle
        .link()
        .set(host_index)
        .up()
        .execute()
        .await
        .with_context(|| format!("bring {:?} up", host_name))?;
    handle
        .link()
        .set(peer_index)
        .setns_by_fd(ns_fd)
        .execute()
        .await
        .with_context(|| format!("move {:?} into pod netns", peer_name))?;

    Ok(host_name)
}

/// Give the escape peer its container identity: final name, the MAC and MTU
/// from the result, and the result's addresses and routes. Must run inside
/// the pod namespace.
pub async fn configure_escape_link(
    handle: &Handle,
    tag: &str,
    ifname: &str,
    iface_index: usize,
    mtu: u32,
    result: &NetworkResult,
) -> Result<()> {
    let peer_name = format!("vc{}-{}", tag, ifname);
    let peer_index = get_link_by_name(handle, &peer_name).await?.header.index;

    let iface = result
        .interfaces
        .get(iface_index)
        .ok_or_else(|| anyhow!("bad interface index {}", iface_index))?;
    let mac = parse_mac(&iface.mac).ok_or_else(|| anyhow!("bad mac {:?}", iface.mac))?;

    handle
        .link()
        .set(peer_index)
        .name(ifname.to_string())
        .address(mac.to_vec())
        .mtu(mtu)
        .up()
        .execute()
        .await
        .with_context(|| format!("configure escape link {:?}", ifname))?;

    for ip in result.ips.iter().filter(|ip| ip.interface == iface_index) {
        let (addr, prefix_len) = parse_ip_cidr(&ip.address)?;
        handle
            .address()
            .add(peer_index, addr, prefix_len)
            .execute()
            .await
            .with_context(|| format!("add address {} to {:?}", ip.address, ifname))?;
    }

    for route in &result.routes {
        if route.gw.is_empty() {
            continue;
        }
        let gw = match IpAddr::from_str(&route.gw).context("parse route gateway")? {
            IpAddr::V4(gw) => gw,
            IpAddr::V6(_) => continue,
        };
        let (dst, dst_prefix) = parse_ip_cidr(&route.dst)?;
        let dst = match dst {
            IpAddr::V4(dst) => dst,
            IpAddr::V6(_) => continue,
        };
        handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst, dst_prefix)
            .output_interface(peer_index)
            .gateway(gw)
            .execute()
            .await
            .with_context(|| format!("add route {} via {}", route.dst, route.gw))?;
    }

    Ok(())
}
