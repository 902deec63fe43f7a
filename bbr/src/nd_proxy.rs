//! ND-Proxy: answers Neighbor Solicitations for registered DUAs on the
//! backbone link on behalf of the Thread devices that hold them.
//!
//! The raw ICMPv6 socket is owned by a dedicated OS thread; everything
//! async-facing talks to it over a bounded channel, matching how the
//! multicast router and the NCP syslog receiver are each given their
//! own thread rather than sharing the event loop with a blocking
//! syscall.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::sync::mpsc;

const ICMPV6_NEIGHBOR_SOLICIT: u8 = 135;
const ICMPV6_NEIGHBOR_ADVERT: u8 = 136;
pub const COAP_PORT: u16 = 61631;

const NA_FLAG_SOLICITED: u32 = 0x4000_0000;
const NA_FLAG_OVERRIDE: u32 = 0x2000_0000;

/// A committed registration keeps its Override bit for this long after
/// `registered_at`, so a recently-moved device wins any stale neighbor
/// cache entry on the backbone link.
const RECENT_WINDOW_SECS: i64 = 5;
const UNSOLICITED_NA_COUNT: usize = 2;
const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

enum NdCommand {
    /// A DUA finished DAD and is now live: join its solicited-node
    /// group and announce it unsolicited.
    Commit { dua: Ipv6Addr, registered_at: i64 },
    /// A DUA left the registry: stop proxying it.
    Withdraw { dua: Ipv6Addr },
}

/// Seam `dad.rs`/`b_ba.rs`/`a_ae.rs` commit or withdraw a DUA through,
/// without depending on the raw-socket machinery directly.
#[async_trait]
pub trait DuaNeighborPort: Send + Sync {
    async fn commit(&self, dua: Ipv6Addr, registered_at: i64);
    async fn withdraw(&self, dua: Ipv6Addr);
}

pub struct NdProxy {
    command_tx: mpsc::Sender<NdCommand>,
}

impl NdProxy {
    /// Spawn the blocking receive thread that owns the raw socket.
    pub fn spawn(interface_name: &str, interface_index: u32, link_local: Ipv6Addr) -> anyhow::Result<Self> {
        let socket = raw_icmpv6_socket(interface_name)?;
        let (command_tx, command_rx) = mpsc::channel(64);

        std::thread::Builder::new()
            .name("bbr-nd-proxy".into())
            .spawn(move || nd_proxy_thread(socket, command_rx, interface_index, link_local))?;

        Ok(Self { command_tx })
    }
}

#[async_trait]
impl DuaNeighborPort for NdProxy {
    async fn commit(&self, dua: Ipv6Addr, registered_at: i64) {
        let _ = self.command_tx.send(NdCommand::Commit { dua, registered_at }).await;
    }

    async fn withdraw(&self, dua: Ipv6Addr) {
        let _ = self.command_tx.send(NdCommand::Withdraw { dua }).await;
    }
}

fn raw_icmpv6_socket(interface_name: &str) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
    socket.set_nonblocking(false)?;
    bind_to_device(&socket, interface_name)?;
    set_icmp6_filter(&socket)?;
    configure_hop_limits(&socket)?;
    configure_checksum_offload(&socket)?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, interface_name: &str) -> anyhow::Result<()> {
    SockRef::from(socket).bind_device(Some(interface_name.as_bytes()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, _interface_name: &str) -> anyhow::Result<()> {
    Ok(())
}

/// Restrict the raw socket to Neighbor Solicitation so the blocking
/// thread is not woken for unrelated ICMPv6 traffic. Collision
/// detection no longer rides on observed Advertisements, so those are
/// no longer passed.
#[cfg(target_os = "linux")]
fn set_icmp6_filter(socket: &Socket) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    let mut filter = libc::icmp6_filter { data: [0xFFFF_FFFFu32; 8] };
    unsafe {
        libc::ICMP6_FILTER_SETPASS(ICMPV6_NEIGHBOR_SOLICIT as i32, &mut filter);
    }
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_ICMPV6,
            libc::ICMP6_FILTER,
            &filter as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::icmp6_filter>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        anyhow::bail!("setsockopt(ICMP6_FILTER) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_icmp6_filter(_socket: &Socket) -> anyhow::Result<()> {
    Ok(())
}

/// Accept NS from any hop count but always send our own with 255, the
/// convention every Neighbor Discovery message relies on to reject
/// anything that crossed a router.
fn configure_hop_limits(socket: &Socket) -> anyhow::Result<()> {
    socket.set_unicast_hops_v6(255)?;
    socket.set_multicast_hops_v6(255)?;
    Ok(())
}

/// Ask the kernel to fill in the ICMPv6 checksum at byte offset 2 of
/// the payload on send, rather than computing the IPv6 pseudo-header
/// checksum by hand for every packet this proxy emits.
#[cfg(target_os = "linux")]
fn configure_checksum_offload(socket: &Socket) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    let offset: libc::c_int = 2;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_CHECKSUM,
            &offset as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        anyhow::bail!("setsockopt(IPV6_CHECKSUM) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn configure_checksum_offload(_socket: &Socket) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn join_solicited_node_group(socket: &std::net::UdpSocket, interface_index: u32, target: Ipv6Addr) -> anyhow::Result<()> {
    set_multicast_group(socket, interface_index, target, libc::IPV6_JOIN_GROUP)
}

#[cfg(target_os = "linux")]
fn leave_solicited_node_group(socket: &std::net::UdpSocket, interface_index: u32, target: Ipv6Addr) -> anyhow::Result<()> {
    set_multicast_group(socket, interface_index, target, libc::IPV6_LEAVE_GROUP)
}

#[cfg(target_os = "linux")]
fn set_multicast_group(socket: &std::net::UdpSocket, interface_index: u32, target: Ipv6Addr, option: libc::c_int) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    let group = solicited_node_multicast(target);
    let mreq = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr { s6_addr: group.octets() },
        ipv6mr_interface: interface_index,
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            option,
            &mreq as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        anyhow::bail!("setsockopt(multicast group) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn join_solicited_node_group(_socket: &std::net::UdpSocket, _interface_index: u32, _target: Ipv6Addr) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn leave_solicited_node_group(_socket: &std::net::UdpSocket, _interface_index: u32, _target: Ipv6Addr) -> anyhow::Result<()> {
    Ok(())
}

/// The solicited-node multicast group for `target`: `ff02::1:ffXX:XXXX`
/// over its low 24 bits.
fn solicited_node_multicast(target: Ipv6Addr) -> Ipv6Addr {
    let o = target.octets();
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 1, 0xff00 | o[13] as u16, ((o[14] as u16) << 8) | o[15] as u16)
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn nd_proxy_thread(socket: Socket, mut commands: mpsc::Receiver<NdCommand>, interface_index: u32, link_local: Ipv6Addr) {
    // A single OS thread multiplexes inbound ICMPv6 with outbound
    // commands using a short poll timeout rather than a second thread,
    // keeping one socket owner.
    let std_socket: std::net::UdpSocket = socket.into();
    let _ = std_socket.set_read_timeout(Some(Duration::from_millis(100)));
    let mut recent: HashMap<Ipv6Addr, i64> = HashMap::new();
    let mut buf = [0u8; 1500];
    loop {
        while let Ok(command) = commands.try_recv() {
            match command {
                NdCommand::Commit { dua, registered_at } => {
                    recent.insert(dua, registered_at);
                    if let Err(e) = join_solicited_node_group(&std_socket, interface_index, dua) {
                        tracing::warn!(error = %e, %dua, "failed to join solicited-node group");
                    }
                    send_unsolicited_na(&std_socket, dua);
                }
                NdCommand::Withdraw { dua } => {
                    recent.remove(&dua);
                    if let Err(e) = leave_solicited_node_group(&std_socket, interface_index, dua) {
                        tracing::warn!(error = %e, %dua, "failed to leave solicited-node group");
                    }
                }
            }
        }
        match std_socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if let Some(target) = parse_neighbor_solicitation(&buf[..n]) {
                    handle_solicitation(&std_socket, &recent, link_local, target, from);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::warn!(error = %e, "ND-Proxy raw socket read failed");
            }
        }
    }
}

/// Answer an NS for `target` if it is either our own configured
/// address or a DUA we are currently proxying. Replies toward our own
/// address go out immediately; proxied replies are dampened by a
/// random [64, 128] ms delay so a directly-attached device's own
/// reply, if any, wins the race.
fn handle_solicitation(socket: &std::net::UdpSocket, recent: &HashMap<Ipv6Addr, i64>, link_local: Ipv6Addr, target: Ipv6Addr, from: SocketAddr) {
    let is_ours = target == link_local;
    let registered_at = recent.get(&target).copied();
    if !is_ours && registered_at.is_none() {
        return;
    }
    let override_flag = is_ours || registered_at.map(|at| now_secs() - at < RECENT_WINDOW_SECS).unwrap_or(false);
    let packet = build_na(target, true, override_flag);

    if is_ours {
        send_na(socket, from, &packet);
        return;
    }
    match socket.try_clone() {
        Ok(clone) => {
            let delay = Duration::from_millis(rand::thread_rng().gen_range(64..=128));
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                send_na(&clone, from, &packet);
            });
        }
        Err(e) => tracing::warn!(error = %e, "failed to clone ND-Proxy socket for delayed reply"),
    }
}

fn send_unsolicited_na(socket: &std::net::UdpSocket, target: Ipv6Addr) {
    let packet = build_na(target, false, true);
    let dest = SocketAddr::new(ALL_NODES.into(), 0);
    for _ in 0..UNSOLICITED_NA_COUNT {
        send_na(socket, dest, &packet);
    }
}

fn send_na(socket: &std::net::UdpSocket, dest: SocketAddr, packet: &[u8]) {
    if let Err(e) = socket.send_to(packet, dest) {
        tracing::warn!(error = %e, %dest, "ND-Proxy failed to send neighbor advertisement");
    }
}

/// Build a 24-byte Neighbor Advertisement: type, code, checksum
/// (left zero, filled by the kernel), flags, then the target address.
/// No Target Link-Layer Address option is attached — this proxy has no
/// source of a real MAC address to offer.
fn build_na(target: Ipv6Addr, solicited: bool, override_flag: bool) -> [u8; 24] {
    let mut flags = 0u32;
    if solicited {
        flags |= NA_FLAG_SOLICITED;
    }
    if override_flag {
        flags |= NA_FLAG_OVERRIDE;
    }
    let mut packet = [0u8; 24];
    packet[0] = ICMPV6_NEIGHBOR_ADVERT;
    packet[4..8].copy_from_slice(&flags.to_be_bytes());
    packet[8..24].copy_from_slice(&target.octets());
    packet
}

fn parse_neighbor_solicitation(data: &[u8]) -> Option<Ipv6Addr> {
    if data.len() < 8 + 16 || data[0] != ICMPV6_NEIGHBOR_SOLICIT {
        return None;
    }
    let target_bytes: [u8; 16] = data[8..24].try_into().ok()?;
    Some(Ipv6Addr::from(target_bytes))
}

/// Derive the backbone-reachable socket address an interior RLOC16
/// maps to for out-of-band CoAP notifications. The low 16 bits of the
/// mesh-local prefix's interface identifier carry the RLOC16 per the
/// Thread mesh-local EID convention (`0000:00ff:fe00:<rloc16>`).
pub fn rloc16_to_backbone_addr(mesh_local_prefix: &Ipv6Addr, rloc16: u16) -> SocketAddr {
    let mut octets = mesh_local_prefix.octets();
    octets[8..16].copy_from_slice(&[0x00, 0x00, 0x00, 0xff, 0xfe, 0x00, (rloc16 >> 8) as u8, rloc16 as u8]);
    SocketAddr::new(Ipv6Addr::from(octets).into(), COAP_PORT)
}

/// No-op `DuaNeighborPort` for unit tests elsewhere in the crate that
/// only need a `BbrState` to construct, not real ND-Proxy behavior.
#[cfg(test)]
pub(crate) struct NullDuaNeighborPort;

#[cfg(test)]
#[async_trait]
impl DuaNeighborPort for NullDuaNeighborPort {
    async fn commit(&self, _dua: Ipv6Addr, _registered_at: i64) {}
    async fn withdraw(&self, _dua: Ipv6Addr) {}
}
