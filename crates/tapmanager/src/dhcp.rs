// Copyright (c) 2025 The vmtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Single-lease DHCP responder.
//!
//! The responder hands the VM exactly the configuration the provisioner
//! assigned to the pod: one address, its mask, the gateway, DNS and the
//! gatewayed routes, keyed by the captured container MAC. It binds and runs
//! inside the pod namespace; packet encoding is `dhcproto`'s business.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use ipnet::Ipv4Net;
use slog::{debug, info};

use cni::NetworkResult;
use vmnet::link::{parse_ip_cidr, parse_mac};

macro_rules! sl {
    () => {
        slog_scope::logger().new(slog::o!("subsystem" => "dhcp"))
    };
}

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;
const LEASE_TIME_SECS: u32 = 86400;

// How often the serve loop wakes up to notice a close() while idle.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct Lease {
    yiaddr: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    router: Option<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
    routes: Vec<(Ipv4Net, Ipv4Addr)>,
}

fn mask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len)))
    }
}

impl Lease {
    fn from_result(result: &NetworkResult) -> Result<Self> {
        let ip = result
            .ips
            .first()
            .ok_or_else(|| anyhow!("network result carries no IP configuration"))?;
        let (addr, prefix_len) = parse_ip_cidr(&ip.address)?;
        let yiaddr = match addr {
            std::net::IpAddr::V4(addr) => addr,
            std::net::IpAddr::V6(_) => bail!("IPv6 lease {} is not supported", ip.address),
        };

        let router = ip.gateway.parse::<Ipv4Addr>().ok();

        let dns = result
            .dns
            .nameservers
            .iter()
            .filter_map(|ns| ns.parse::<Ipv4Addr>().ok())
            .collect();

        let mut routes = Vec::new();
        for route in &result.routes {
            let gw = match route.gw.parse::<Ipv4Addr>() {
                Ok(gw) => gw,
                Err(_) => continue,
            };
            let (dst, dst_prefix) = parse_ip_cidr(&route.dst)?;
            if let std::net::IpAddr::V4(dst) = dst {
                routes.push((
                    Ipv4Net::new(dst, dst_prefix).context("bad route destination")?,
                    gw,
                ));
            }
        }

        Ok(Lease {
            yiaddr,
            subnet_mask: mask_from_prefix(prefix_len),
            router,
            dns,
            routes,
        })
    }
}

/// Serves the pod's single lease to the peer identified by the container
/// MAC. `serve` blocks; `close` makes it return from another thread.
pub struct DhcpServer {
    lease: Lease,
    peer_mac: [u8; 6],
    server_id: Ipv4Addr,
    socket: Mutex<Option<UdpSocket>>,
    shutdown: AtomicBool,
}

impl DhcpServer {
    pub fn new(result: &NetworkResult, peer_mac: &str) -> Result<Self> {
        let lease = Lease::from_result(result)?;
        let peer_mac =
            parse_mac(peer_mac).ok_or_else(|| anyhow!("bad peer mac {:?}", peer_mac))?;
        let server_id = lease.router.unwrap_or(lease.yiaddr);
        Ok(DhcpServer {
            lease,
            peer_mac,
            server_id,
            socket: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Bind the listener. Must be called on a thread entered in the pod
    /// namespace so the socket belongs to it.
    pub fn bind(&self) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, SERVER_PORT))
            .context("bind dhcp listener")?;
        socket.set_broadcast(true).context("enable broadcast")?;
        socket
            .set_read_timeout(Some(SHUTDOWN_POLL))
            .context("set read timeout")?;
        *self.socket.lock().unwrap() = Some(socket);
        Ok(())
    }

    /// Answer requests until [`DhcpServer::close`] is called. The calling
    /// thread must stay entered in the pod namespace for the whole loop.
    pub fn serve(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("dhcp listener is not bound"))?;

        info!(sl!(), "dhcp responder ready"; "lease" => %self.lease.yiaddr);
        let mut buf = [0u8; 1500];
        while !self.shutdown.load(Ordering::SeqCst) {
            let n = match socket.recv_from(&mut buf) {
                Ok((n, _peer)) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e).context("receive dhcp request"),
            };
            if let Err(e) = self.handle_request(&socket, &buf[..n]) {
                debug!(sl!(), "ignoring dhcp request: {:?}", e);
            }
        }
        Ok(())
    }

    /// Asynchronously stop `serve`.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn handle_request(&self, socket: &UdpSocket, buf: &[u8]) -> Result<()> {
        let msg = Message::decode(&mut Decoder::new(buf)).context("decode dhcp message")?;
        if msg.opcode() != Opcode::BootRequest {
            return Ok(());
        }
        if msg.chaddr().len() < 6 || msg.chaddr()[..6] != self.peer_mac {
            debug!(sl!(), "dhcp request from unknown peer"; "chaddr" => format!("{:?}", msg.chaddr()));
            return Ok(());
        }
        let reply_type = match msg.opts().msg_type() {
            Some(MessageType::Discover) => MessageType::Offer,
            Some(MessageType::Request) => MessageType::Ack,
            other => {
                debug!(sl!(), "dhcp message type {:?} left unanswered", other);
                return Ok(());
            }
        };

        let reply = self.build_reply(&msg, reply_type);
        let mut out = Vec::new();
        reply
            .encode(&mut Encoder::new(&mut out))
            .context("encode dhcp reply")?;
        // The peer has no address yet; replies always go out as broadcast.
        socket
            .send_to(&out, (Ipv4Addr::BROADCAST, CLIENT_PORT))
            .context("send dhcp reply")?;
        debug!(sl!(), "served dhcp {:?}", reply_type; "yiaddr" => %self.lease.yiaddr);
        Ok(())
    }

    fn build_reply(&self, msg: &Message, reply_type: MessageType) -> Message {
        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_xid(msg.xid())
            .set_yiaddr(self.lease.yiaddr)
            .set_siaddr(self.server_id)
            .set_flags(msg.flags())
            .set_chaddr(msg.chaddr());

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(reply_type));
        opts.insert(DhcpOption::ServerIdentifier(self.server_id));
        opts.insert(DhcpOption::AddressLeaseTime(LEASE_TIME_SECS));
        opts.insert(DhcpOption::SubnetMask(self.lease.subnet_mask));
        if let Some(router) = self.lease.router {
            opts.insert(DhcpOption::Router(vec![router]));
        }
        if !self.lease.dns.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(self.lease.dns.clone()));
        }
        if !self.lease.routes.is_empty() {
            opts.insert(DhcpOption::ClasslessStaticRoute(self.lease.routes.clone()));
        }
        reply
    }
}
