// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Link inspection and L3 state transfer via rtnetlink.
//!
//! The rewiring engine needs to lift the addresses and routes off a
//! provisioner-configured veth and later put them back, byte for byte.
//! [`LinkInfo`] is that portable snapshot: it keeps the raw netlink messages
//! around so a flushed address or route can be deleted and re-added without
//! re-deriving any attribute.

use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use futures::stream::TryStreamExt;
use netlink_packet_route::nlas::address::Nla as AddressNla;
use netlink_packet_route::nlas::link::Nla as LinkNla;
use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage, AF_INET, RT_TABLE_MAIN};
use rtnetlink::{Handle, IpVersion};

use cni::{Interface, IpConfig, NetworkResult, Route};

#[derive(Debug, Clone)]
pub struct AddressInfo {
    pub addr: IpAddr,
    pub prefix_len: u8,
    msg: AddressMessage,
}

#[derive(Debug, Clone)]
pub struct RouteInfo {
    /// None stands for the default route.
    pub dest: Option<(IpAddr, u8)>,
    pub gateway: IpAddr,
    msg: RouteMessage,
}

/// Snapshot of one link's identity and IPv4 L3 state.
///
/// Routes are restricted to gatewayed main-table entries: the kernel
/// recreates directly-connected subnet routes on its own whenever the
/// addresses are re-added, so capturing them would only produce duplicates
/// at restore time.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub name: String,
    pub index: u32,
    pub hard_addr: String,
    pub mtu: u32,
    pub addresses: Vec<AddressInfo>,
    pub routes: Vec<RouteInfo>,
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let v: Vec<_> = s.split(':').collect();
    if v.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for i in 0..6 {
        bytes[i] = u8::from_str_radix(v[i], 16).ok()?;
    }
    Some(bytes)
}

pub fn format_mac(b: &[u8]) -> Result<String> {
    if b.len() != 6 {
        Err(anyhow!("invalid mac address {:?}", b))
    } else {
        Ok(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        ))
    }
}

pub fn parse_ip_cidr(ip: &str) -> Result<(IpAddr, u8)> {
    let items: Vec<&str> = ip.split('/').collect();
    if items.len() != 2 {
        return Err(anyhow!("{} is a bad IP address in format of CIDR", ip));
    }
    let ipaddr = IpAddr::from_str(items[0]).context("parse IP address from string")?;
    let mask = u8::from_str(items[1]).context("parse mask")?;
    if ipaddr.is_ipv4() && mask > 32 {
        return Err(anyhow!("bad IPv4 mask {}", mask));
    }
    if mask > 128 {
        return Err(anyhow!("bad mask {}", mask));
    }
    Ok((ipaddr, mask))
}

pub async fn get_link_by_name(handle: &Handle, name: &str) -> Result<LinkMessage> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    links
        .try_next()
        .await
        .with_context(|| format!("get link {:?}", name))?
        .ok_or_else(|| anyhow!("link {:?} not found", name))
}

/// Pull name, MAC and MTU out of a link message.
pub fn link_attrs(msg: &LinkMessage) -> (u32, String, Vec<u8>, u32) {
    let mut name = String::new();
    let mut hard_addr = Vec::new();
    let mut mtu = 0;
    for nla in &msg.nlas {
        match nla {
            LinkNla::IfName(n) => name = n.clone(),
            LinkNla::Address(a) => hard_addr = a.clone(),
            LinkNla::Mtu(m) => mtu = *m,
            _ => {}
        }
    }
    (msg.header.index, name, hard_addr, mtu)
}

fn parse_address_msg(msg: &AddressMessage) -> Option<(IpAddr, u8)> {
    for nla in &msg.nlas {
        if let AddressNla::Address(a) = nla {
            if a.len() == 4 {
                let octets: [u8; 4] = [a[0], a[1], a[2], a[3]];
                return Some((IpAddr::from(octets), msg.header.prefix_len));
            }
        }
    }
    None
}

/// Snapshot `name`'s identity plus its IPv4 addresses and gatewayed routes.
pub async fn extract_link_info(handle: &Handle, name: &str) -> Result<LinkInfo> {
    let msg = get_link_by_name(handle, name).await?;
    let (index, link_name, hard_addr, mtu) = link_attrs(&msg);
    let hard_addr = format_mac(&hard_addr).with_context(|| format!("link {:?} mac", name))?;

    let mut addresses = Vec::new();
    let mut addrs = handle.address().get().execute();
    while let Some(msg) = addrs.try_next().await.context("dump addresses")? {
        if msg.header.index != index || msg.header.family as u16 != AF_INET {
            continue;
        }
        if let Some((addr, prefix_len)) = parse_address_msg(&msg) {
            addresses.push(AddressInfo {
                addr,
                prefix_len,
                msg,
            });
        }
    }

    let mut routes = Vec::new();
    let mut route_dump = handle.route().get(IpVersion::V4).execute();
    while let Some(msg) = route_dump.try_next().await.context("dump routes")? {
        if msg.header.table != RT_TABLE_MAIN || msg.output_interface() != Some(index) {
            continue;
        }
        let gateway = match msg.gateway() {
            Some(gw) => gw,
            None => continue,
        };
        routes.push(RouteInfo {
            dest: msg.destination_prefix(),
            gateway,
            msg,
        });
    }

    Ok(LinkInfo {
        name: link_name,
        index,
        hard_addr,
        mtu,
        addresses,
        routes,
    })
}

/// Detach the captured addresses and routes from their link.
pub async fn flush_link(handle: &Handle, info: &LinkInfo) -> Result<()> {
    for route in &info.routes {
        handle
            .route()
            .del(route.msg.clone())
            .execute()
            .await
            .with_context(|| format!("delete route via {} on {:?}", route.gateway, info.name))?;
    }
    for address in &info.addresses {
        handle
            .address()
            .del(address.msg.clone())
            .execute()
            .await
            .with_context(|| format!("delete address {} on {:?}", address.addr, info.name))?;
    }
    Ok(())
}

/// Put the captured addresses and routes onto the link with index `target`.
pub async fn apply_link_info(handle: &Handle, info: &LinkInfo, target: u32) -> Result<()> {
    for address in &info.addresses {
        handle
            .address()
            .add(target, address.addr, address.prefix_len)
            .execute()
            .await
            .with_context(|| format!("add address {} to link {}", address.addr, target))?;
    }
    for route in &info.routes {
        let gateway = match route.gateway {
            IpAddr::V4(gw) => gw,
            IpAddr::V6(_) => continue,
        };
        let mut req = handle.route().add().v4().output_interface(target);
        match route.dest {
            Some((IpAddr::V4(dst), prefix)) => {
                req = req.destination_prefix(dst, prefix);
            }
            Some((IpAddr::V6(_), _)) => continue,
            None => {
                req = req.destination_prefix(std::net::Ipv4Addr::UNSPECIFIED, 0);
            }
        }
        req.gateway(gateway)
            .execute()
            .await
            .with_context(|| format!("add route via {} to link {}", gateway, target))?;
    }
    Ok(())
}

/// Express a link's current state as a provisioner-style result document,
/// the shape used to check that rewiring left no externally visible trace.
pub async fn extract_link_result(
    handle: &Handle,
    name: &str,
    sandbox: &str,
) -> Result<NetworkResult> {
    let info = extract_link_info(handle, name).await?;

    let default_gw = info
        .routes
        .iter()
        .find(|r| r.dest.is_none())
        .map(|r| r.gateway.to_string())
        .unwrap_or_default();

    Ok(NetworkResult {
        interfaces: vec![Interface {
            name: info.name.clone(),
            mac: info.hard_addr.clone(),
            sandbox: sandbox.to_string(),
        }],
        ips: info
            .addresses
            .iter()
            .map(|a| IpConfig {
                interface: 0,
                address: format!("{}/{}", a.addr, a.prefix_len),
                gateway: default_gw.clone(),
            })
            .collect(),
        routes: info
            .routes
            .iter()
            .map(|r| Route {
                dst: match r.dest {
                    Some((addr, prefix)) => format!("{}/{}", addr, prefix),
                    None => "0.0.0.0/0".to_string(),
                },
                gw: r.gateway.to_string(),
            })
            .collect(),
        dns: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert!(parse_mac("1:2:3").is_none());
        assert!(parse_mac("aa:bb:cc:dd:ee:zz").is_none());
        assert_eq!(
            parse_mac("0a:0b:80:03:04:05"),
            Some([10, 11, 128, 3, 4, 5])
        );
    }

    #[test]
    fn test_format_mac() {
        assert!(format_mac(&[1, 2, 3]).is_err());
        assert_eq!(
            format_mac(&[10, 11, 128, 3, 4, 5]).unwrap(),
            "0a:0b:80:03:04:05"
        );
    }

    #[test]
    fn test_mac_round_trip() {
        let mac = "aa:bb:cc:00:11:22";
        assert_eq!(format_mac(&parse_mac(mac).unwrap()).unwrap(), mac);
    }

    #[test]
    fn test_parse_ip_cidr() {
        let (addr, mask) = parse_ip_cidr("10.1.90.5/24").unwrap();
        assert_eq!(addr.to_string(), "10.1.90.5");
        assert_eq!(mask, 24);

        assert!(parse_ip_cidr("10.1.90.5").is_err());
        assert!(parse_ip_cidr("10.1.90.5/33").is_err());
        assert!(parse_ip_cidr("10.1.90.5/24/1").is_err());
    }
}
