//! Interface monitor (C2).
//!
//! Tracks which host network interfaces are up, enumerates their addresses,
//! and owns the per-interface multicast/broadcast sockets the name-service
//! engine sends and receives on. Enumeration walks `/sys/class/net` plus
//! `getifaddrs(3)` for addresses; liveness changes are observed on a
//! `NETLINK_ROUTE` multicast subscription and only trigger reconciliation,
//! never themselves decide what's live.

use std::collections::HashMap;
use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::netlink::{MessageIter, NetlinkSocket, NlMsgType, Protocol, rtnetlink_groups};
use crate::util::ifname;

/// Reconciliation runs no more often than this...
pub const LAZY_UPDATE_MIN_SECS: u64 = 5;
/// ...and no less often than this.
pub const LAZY_UPDATE_MAX_SECS: u64 = 15;

const IFF_UP: u32 = 0x1;

/// Legacy AllJoyn NS multicast port, shared by IPv4 and IPv6 groups.
pub const NS_MULTICAST_PORT: u16 = 9956;
/// Legacy IPv4 multicast group.
pub const NS_IPV4_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 113);
/// Legacy IPv6 multicast group (`ff02::13a`).
pub const NS_IPV6_MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x13a, 0);

/// A snapshot of one host network interface.
#[derive(Debug, Clone)]
pub struct IfConfigEntry {
    pub name: String,
    pub index: u32,
    pub addresses: Vec<(IpAddr, u8)>,
    pub mtu: u32,
    pub flags: u32,
    pub broadcast: Option<Ipv4Addr>,
}

impl IfConfigEntry {
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    pub fn primary_ipv4(&self) -> Option<(Ipv4Addr, u8)> {
        self.addresses.iter().find_map(|(addr, prefix)| match addr {
            IpAddr::V4(v4) => Some((*v4, *prefix)),
            IpAddr::V6(_) => None,
        })
    }

    pub fn primary_ipv6(&self) -> Option<(Ipv6Addr, u8)> {
        self.addresses.iter().find_map(|(addr, prefix)| match addr {
            IpAddr::V6(v6) => Some((*v6, *prefix)),
            IpAddr::V4(_) => None,
        })
    }
}

/// Enumerate the host's interfaces with name, index, addresses, MTU and flags.
pub fn list_interfaces() -> Result<Vec<IfConfigEntry>> {
    let mut addresses = enumerate_addresses()?;
    let names = ifname::list_interfaces().map_err(|e| Error::SocketError(e.to_string()))?;

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let index = ifname::name_to_index(&name).unwrap_or(0);
        let mtu = read_sys_decimal(&name, "mtu").unwrap_or(0);
        let flags = read_sys_hex(&name, "flags").unwrap_or(0);
        let broadcast = read_broadcast(&name);
        entries.push(IfConfigEntry {
            name: name.clone(),
            index,
            addresses: addresses.remove(&name).unwrap_or_default(),
            mtu,
            flags,
            broadcast,
        });
    }
    Ok(entries)
}

fn read_sys_decimal(name: &str, attr: &str) -> Option<u32> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/{attr}"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn read_sys_hex(name: &str, attr: &str) -> Option<u32> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/{attr}")).ok()?;
    let trimmed = raw.trim().trim_start_matches("0x");
    u32::from_str_radix(trimmed, 16).ok()
}

fn read_broadcast(name: &str) -> Option<Ipv4Addr> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/broadcast"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Walk `getifaddrs(3)` and group `(address, prefix_len)` pairs by interface name.
fn enumerate_addresses() -> Result<HashMap<String, Vec<(IpAddr, u8)>>> {
    let mut result: HashMap<String, Vec<(IpAddr, u8)>> = HashMap::new();

    unsafe {
        let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            cur = ifa.ifa_next;

            if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
                continue;
            }
            let name = CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
            let family = (*ifa.ifa_addr).sa_family as i32;

            if family == libc::AF_INET {
                let sa = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                let addr = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                let prefix_len = if !ifa.ifa_netmask.is_null() {
                    let nm = &*(ifa.ifa_netmask as *const libc::sockaddr_in);
                    u32::from_be(nm.sin_addr.s_addr).count_ones() as u8
                } else {
                    32
                };
                result
                    .entry(name)
                    .or_default()
                    .push((IpAddr::V4(addr), prefix_len));
            } else if family == libc::AF_INET6 {
                let sa = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                let addr = Ipv6Addr::from(sa.sin6_addr.s6_addr);
                let prefix_len = if !ifa.ifa_netmask.is_null() {
                    let nm = &*(ifa.ifa_netmask as *const libc::sockaddr_in6);
                    nm.sin6_addr.s6_addr.iter().map(|b| b.count_ones()).sum::<u32>() as u8
                } else {
                    128
                };
                result
                    .entry(name)
                    .or_default()
                    .push((IpAddr::V6(addr), prefix_len));
            }
        }

        libc::freeifaddrs(ifap);
    }

    Ok(result)
}

/// What a caller asked C2 to make reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub transport_mask: u16,
    pub name: Option<String>,
    pub address: Option<IpAddr>,
}

/// An interface the reconciler has brought up sockets for.
pub struct LiveInterface {
    pub transport_mask: u16,
    pub name: String,
    pub index: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub mtu: u32,
    pub flags: u32,
    pub socket: std::sync::Arc<UdpSocket>,
}

impl std::fmt::Debug for LiveInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveInterface")
            .field("transport_mask", &self.transport_mask)
            .field("name", &self.name)
            .field("index", &self.index)
            .field("address", &self.address)
            .finish()
    }
}

/// Slab-indexed live interfaces, desired requests, and externally fabricated
/// virtual entries, with a reconciliation loop bounded by
/// [`LAZY_UPDATE_MIN_SECS`]/[`LAZY_UPDATE_MAX_SECS`].
pub struct Monitor {
    requests: Mutex<Vec<InterfaceRequest>>,
    live: Mutex<Vec<Option<LiveInterface>>>,
    virtual_entries: Mutex<Vec<IfConfigEntry>>,
    dirty: Notify,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            virtual_entries: Mutex::new(Vec::new()),
            dirty: Notify::new(),
        }
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Record a request; reconciliation will open sockets once a matching
    /// interface is up.
    pub fn open(&self, transport_mask: u16, name: Option<String>, address: Option<IpAddr>) {
        self.requests.lock().unwrap().push(InterfaceRequest {
            transport_mask,
            name,
            address,
        });
        self.mark_dirty();
    }

    /// Remove a matching request; reconciliation will close the socket if no
    /// other request still wants it.
    pub fn close(&self, transport_mask: u16, name: Option<&str>, address: Option<IpAddr>) {
        self.requests.lock().unwrap().retain(|r| {
            !(r.transport_mask == transport_mask
                && r.name.as_deref() == name
                && r.address == address)
        });
        self.mark_dirty();
    }

    /// Register an externally fabricated interface (e.g. a soft-AP the host
    /// stack doesn't expose through the usual enumeration).
    pub fn create_virtual(&self, entry: IfConfigEntry) {
        self.virtual_entries.lock().unwrap().push(entry);
        self.mark_dirty();
    }

    /// Remove a previously registered virtual interface by name.
    pub fn delete_virtual(&self, name: &str) {
        self.virtual_entries.lock().unwrap().retain(|e| e.name != name);
        self.mark_dirty();
    }

    /// Snapshot of currently live interfaces (one entry per transport/address
    /// pairing that has an open socket).
    pub fn live_snapshot(&self) -> Vec<(u16, String, IpAddr)> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|l| (l.transport_mask, l.name.clone(), l.address))
            .collect()
    }

    /// Live sockets, grouped per transport, for the engine's send/receive loop.
    pub fn live_sockets(&self) -> Vec<(u16, IpAddr, u8, std::sync::Arc<UdpSocket>)> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|l| (l.transport_mask, l.address, l.prefix_len, l.socket.clone()))
            .collect()
    }

    /// Compare desired requests against real+virtual interfaces, opening
    /// sockets for newly satisfiable requests and closing ones whose backing
    /// interface disappeared or whose request was withdrawn.
    pub async fn reconcile(&self) {
        let real = list_interfaces().unwrap_or_else(|e| {
            warn!(error = %e, "failed to enumerate interfaces");
            Vec::new()
        });
        let virtual_entries = self.virtual_entries.lock().unwrap().clone();
        let mut all: Vec<IfConfigEntry> = real;
        all.extend(virtual_entries);

        let requests = self.requests.lock().unwrap().clone();
        let mut desired: Vec<(u16, IfConfigEntry, IpAddr, u8)> = Vec::new();
        for req in &requests {
            for entry in &all {
                if !entry.is_up() {
                    continue;
                }
                if let Some(name) = &req.name
                    && &entry.name != name
                {
                    continue;
                }
                for (addr, prefix) in &entry.addresses {
                    if let Some(wanted) = req.address
                        && wanted != *addr
                    {
                        continue;
                    }
                    desired.push((req.transport_mask, entry.clone(), *addr, *prefix));
                }
            }
        }

        let mut live = self.live.lock().unwrap();

        live.retain_mut(|slot| {
            let keep = slot.as_ref().is_some_and(|l| {
                desired
                    .iter()
                    .any(|(mask, entry, addr, _)| *mask == l.transport_mask && entry.name == l.name && *addr == l.address)
            });
            if !keep {
                if let Some(l) = slot {
                    debug!(name = %l.name, transport_mask = l.transport_mask, "closing interface socket");
                }
                *slot = None;
            }
            true
        });

        for (mask, entry, addr, prefix) in desired {
            let already_live = live.iter().flatten().any(|l| {
                l.transport_mask == mask && l.name == entry.name && l.address == addr
            });
            if already_live {
                continue;
            }
            match open_ns_socket(addr, entry.index, entry.broadcast).await {
                Ok(socket) => {
                    info!(name = %entry.name, %addr, transport_mask = mask, "opened interface socket");
                    let live_entry = LiveInterface {
                        transport_mask: mask,
                        name: entry.name.clone(),
                        index: entry.index,
                        address: addr,
                        prefix_len: prefix,
                        mtu: entry.mtu,
                        flags: entry.flags,
                        socket: std::sync::Arc::new(socket),
                    };
                    if let Some(slot) = live.iter_mut().find(|s| s.is_none()) {
                        *slot = Some(live_entry);
                    } else {
                        live.push(Some(live_entry));
                    }
                }
                Err(e) => {
                    warn!(name = %entry.name, %addr, error = %e, "failed to open interface socket");
                }
            }
        }
    }

    /// Release every live socket (process suspend). Reconciliation on resume
    /// reopens whatever is still requested and up.
    pub fn suspend(&self) {
        let mut live = self.live.lock().unwrap();
        live.clear();
    }

    /// Wake the reconciliation loop so it reopens sockets for every request
    /// still desired and up, without waiting out the rest of its bounded delay.
    pub fn resume(&self) {
        self.mark_dirty();
    }

    /// Run the bounded reconciliation loop forever.
    pub async fn run(self: std::sync::Arc<Self>) {
        let mut last_run = Instant::now() - Duration::from_secs(LAZY_UPDATE_MAX_SECS);
        loop {
            let since_last = last_run.elapsed();
            if since_last < Duration::from_secs(LAZY_UPDATE_MIN_SECS) {
                tokio::time::sleep(Duration::from_secs(LAZY_UPDATE_MIN_SECS) - since_last).await;
            }

            let max_wait = Duration::from_secs(LAZY_UPDATE_MAX_SECS)
                .saturating_sub(last_run.elapsed());
            tokio::select! {
                _ = self.dirty.notified() => {}
                _ = tokio::time::sleep(max_wait) => {}
            }

            self.reconcile().await;
            last_run = Instant::now();
        }
    }

    /// Run the netlink link/address change watcher forever, marking the
    /// monitor dirty on every notification so the next reconcile picks it up.
    pub async fn watch_netlink(self: std::sync::Arc<Self>) -> Result<()> {
        let mut socket = NetlinkSocket::new(Protocol::Route)?;
        socket.add_membership(rtnetlink_groups::RTNLGRP_LINK)?;
        socket.add_membership(rtnetlink_groups::RTNLGRP_IPV4_IFADDR)?;
        socket.add_membership(rtnetlink_groups::RTNLGRP_IPV6_IFADDR)?;

        loop {
            let buf = socket.recv_msg().await?;
            for msg in MessageIter::new(&buf) {
                match msg {
                    Ok((hdr, _payload)) => match hdr.nlmsg_type {
                        NlMsgType::RTM_NEWLINK
                        | NlMsgType::RTM_DELLINK
                        | NlMsgType::RTM_NEWADDR
                        | NlMsgType::RTM_DELADDR => {
                            self.mark_dirty();
                        }
                        _ => {}
                    },
                    Err(e) => {
                        warn!(error = %e, "malformed netlink notification");
                    }
                }
            }
        }
    }
}

/// Bind a UDP socket for name-service traffic on `NS_MULTICAST_PORT`, joined
/// to the appropriate multicast group for `addr`'s family, with broadcast
/// enabled when `broadcast` names a subnet-directed address.
async fn open_ns_socket(
    addr: IpAddr,
    ifindex: u32,
    broadcast: Option<Ipv4Addr>,
) -> std::io::Result<UdpSocket> {
    match addr {
        IpAddr::V4(v4) => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            if broadcast.is_some() {
                socket.set_broadcast(true)?;
            }
            let bind_addr = std::net::SocketAddr::V4(std::net::SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                NS_MULTICAST_PORT,
            ));
            socket.bind(&bind_addr.into())?;
            socket.join_multicast_v4(&NS_IPV4_MULTICAST_GROUP, &v4)?;
            UdpSocket::from_std(socket.into())
        }
        IpAddr::V6(_) => {
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProtocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            let bind_addr = std::net::SocketAddr::V6(std::net::SocketAddrV6::new(
                Ipv6Addr::UNSPECIFIED,
                NS_MULTICAST_PORT,
                0,
                0,
            ));
            socket.bind(&bind_addr.into())?;
            socket.join_multicast_v6(&NS_IPV6_MULTICAST_GROUP, ifindex)?;
            UdpSocket::from_std(socket.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_discoverable() {
        let ifaces = list_interfaces().unwrap();
        assert!(ifaces.iter().any(|e| e.name == "lo"));
    }

    #[test]
    fn up_flag_is_decoded() {
        let ifaces = list_interfaces().unwrap();
        let lo = ifaces.iter().find(|e| e.name == "lo").unwrap();
        assert!(lo.is_up());
    }

    #[test]
    fn open_then_close_removes_request() {
        let monitor = Monitor::new();
        monitor.open(0x0001, Some("eth0".into()), None);
        assert_eq!(monitor.requests.lock().unwrap().len(), 1);
        monitor.close(0x0001, Some("eth0"), None);
        assert!(monitor.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn create_then_delete_virtual_interface() {
        let monitor = Monitor::new();
        monitor.create_virtual(IfConfigEntry {
            name: "softap0".into(),
            index: 9999,
            addresses: vec![],
            mtu: 1500,
            flags: IFF_UP,
            broadcast: None,
        });
        assert_eq!(monitor.virtual_entries.lock().unwrap().len(), 1);
        monitor.delete_virtual("softap0");
        assert!(monitor.virtual_entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_with_no_requests_stays_empty() {
        let monitor = Monitor::new();
        monitor.reconcile().await;
        assert!(monitor.live_snapshot().is_empty());
    }
}
