//! Kernel-assisted IPv6 multicast routing between the Thread mesh and
//! the backbone link, via the Linux `MRT6` API. Forwarding cache
//! entries are installed lazily: the kernel upcalls `MRT6MSG_NOCACHE`
//! the first time it sees traffic for a registered group with no
//! matching `MFC`, and this router installs one from the current MLR
//! registry rather than pre-provisioning every group at registration
//! time.

use std::net::Ipv6Addr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;

use crate::state::BbrState;

const MRT6_BASE: libc::c_int = 200;
const MRT6_INIT: libc::c_int = MRT6_BASE;
const MRT6_ADD_MIF: libc::c_int = MRT6_BASE + 2;
const MRT6_ADD_MFC: libc::c_int = MRT6_BASE + 4;
const MRT6_DEL_MFC: libc::c_int = MRT6_BASE + 5;
const MRT6MSG_NOCACHE: u8 = 1;

/// Mirrors `struct mif6ctl` from `linux/mroute6.h`.
#[repr(C)]
struct Mif6Ctl {
    mif6c_mifi: u16,
    mif6c_flags: u8,
    vifc_threshold: u8,
    mif6c_pifi: u16,
    vifc_rate_limit: libc::c_uint,
}

/// Mirrors `struct mf6cctl`.
#[repr(C)]
struct Mf6cCtl {
    mf6cc_origin: libc::sockaddr_in6,
    mf6cc_mcastgrp: libc::sockaddr_in6,
    mf6cc_parent: u16,
    mf6cc_ifset: [libc::c_ulong; 2], // IF_SET bitmap, 128 interfaces
}

pub struct MifAssignment {
    pub mesh_mif: u16,
    pub mesh_ifindex: libc::c_uint,
    pub backbone_mif: u16,
    pub backbone_ifindex: libc::c_uint,
}

pub struct McastRouter {
    socket: Socket,
    mifs: MifAssignment,
}

impl McastRouter {
    pub fn new(mifs: MifAssignment) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        let router = Self { socket, mifs };
        router.init()?;
        router.add_mif(router.mifs.mesh_mif, router.mifs.mesh_ifindex)?;
        router.add_mif(router.mifs.backbone_mif, router.mifs.backbone_ifindex)?;
        Ok(router)
    }

    fn setsockopt<T>(&self, optname: libc::c_int, value: &T) -> anyhow::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IPV6,
                optname,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            anyhow::bail!("setsockopt({optname}) failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn init(&self) -> anyhow::Result<()> {
        let enable: libc::c_int = 1;
        self.setsockopt(MRT6_INIT, &enable)
    }

    fn add_mif(&self, mifi: u16, ifindex: libc::c_uint) -> anyhow::Result<()> {
        let ctl = Mif6Ctl { mif6c_mifi: mifi, mif6c_flags: 0, vifc_threshold: 1, mif6c_pifi: ifindex as u16, vifc_rate_limit: 0 };
        self.setsockopt(MRT6_ADD_MIF, &ctl)
    }

    /// Install a forwarding cache entry so the kernel forwards future
    /// packets for `group` from the mesh interface to the backbone
    /// interface without another upcall.
    pub fn add_forwarding_entry(&self, origin: Ipv6Addr, group: Ipv6Addr) -> anyhow::Result<()> {
        let mut ifset = [0u64; 2];
        set_bit(&mut ifset, self.mifs.backbone_mif);
        let ctl = Mf6cCtl {
            mf6cc_origin: sockaddr_in6(origin),
            mf6cc_mcastgrp: sockaddr_in6(group),
            mf6cc_parent: self.mifs.mesh_mif,
            mf6cc_ifset: [ifset[0] as libc::c_ulong, ifset[1] as libc::c_ulong],
        };
        self.setsockopt(MRT6_ADD_MFC, &ctl)
    }

    pub fn remove_forwarding_entry(&self, origin: Ipv6Addr, group: Ipv6Addr) -> anyhow::Result<()> {
        let ctl = Mf6cCtl {
            mf6cc_origin: sockaddr_in6(origin),
            mf6cc_mcastgrp: sockaddr_in6(group),
            mf6cc_parent: self.mifs.mesh_mif,
            mf6cc_ifset: [0, 0],
        };
        self.setsockopt(MRT6_DEL_MFC, &ctl)
    }

    /// Blocking-recv loop for `MRT6MSG_NOCACHE` upcalls, run on a
    /// dedicated thread the same way the ND-Proxy socket is.
    pub fn spawn_upcall_loop(self: Arc<Self>) -> mpsc::Receiver<(Ipv6Addr, Ipv6Addr)> {
        let (tx, rx) = mpsc::channel(128);
        let router = self;
        std::thread::Builder::new()
            .name("bbr-mcast-upcall".into())
            .spawn(move || {
                let fd = router.socket.as_raw_fd();
                let std_socket = unsafe { <std::net::UdpSocket as std::os::fd::FromRawFd>::from_raw_fd(fd) };
                let mut buf = [0u8; 1500];
                loop {
                    match std::io::Read::read(&mut &std_socket, &mut buf) {
                        Ok(n) => {
                            if let Some((origin, group)) = parse_nocache_upcall(&buf[..n]) {
                                if tx.blocking_send((origin, group)).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "multicast upcall socket read failed");
                            break;
                        }
                    }
                }
                std::mem::forget(std_socket);
            })
            .expect("spawning multicast upcall thread");
        rx
    }
}

fn set_bit(set: &mut [u64; 2], bit: u16) {
    let idx = (bit / 64) as usize;
    let offset = bit % 64;
    set[idx] |= 1u64 << offset;
}

fn sockaddr_in6(addr: Ipv6Addr) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: 0,
        sin6_flowinfo: 0,
        sin6_addr: libc::in6_addr { s6_addr: addr.octets() },
        sin6_scope_id: 0,
    }
}

/// Mirrors `struct mrt6msg`: a one-byte message type, then mif/origin/
/// group fields the kernel fills in for a cache-miss notification.
fn parse_nocache_upcall(data: &[u8]) -> Option<(Ipv6Addr, Ipv6Addr)> {
    if data.len() < 4 + 16 + 16 || data[0] != MRT6MSG_NOCACHE {
        return None;
    }
    let origin: [u8; 16] = data[4..20].try_into().ok()?;
    let group: [u8; 16] = data[20..36].try_into().ok()?;
    Some((Ipv6Addr::from(origin), Ipv6Addr::from(group)))
}

/// Reconcile a `MRT6MSG_NOCACHE` upcall against the current MLR
/// registry, installing a forwarding entry only while this BBR is
/// primary and the group is actually registered.
pub async fn handle_upcall(state: &Arc<BbrState>, router: &McastRouter, origin: Ipv6Addr, group: Ipv6Addr) {
    if !state.current_role().await.is_primary() {
        return;
    }
    let registered = state.mlr_registry.lock().await.get(&group).is_some();
    if !registered {
        return;
    }
    if let Err(e) = router.add_forwarding_entry(origin, group) {
        tracing::warn!(%origin, %group, error = %e, "failed to install multicast forwarding entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bit_marks_correct_word_and_offset() {
        let mut set = [0u64; 2];
        set_bit(&mut set, 0);
        set_bit(&mut set, 64);
        set_bit(&mut set, 65);
        assert_eq!(set[0], 1);
        assert_eq!(set[1], 0b11);
    }

    #[test]
    fn parse_nocache_upcall_reads_origin_and_group() {
        let mut packet = vec![MRT6MSG_NOCACHE, 0, 0, 0];
        packet.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        packet.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
        let (origin, group) = parse_nocache_upcall(&packet).unwrap();
        assert_eq!(origin, Ipv6Addr::LOCALHOST);
        assert_eq!(group, Ipv6Addr::UNSPECIFIED);
    }

    #[test]
    fn parse_nocache_upcall_rejects_wrong_message_type() {
        let mut packet = vec![0u8, 0, 0, 0];
        packet.extend_from_slice(&[0u8; 32]);
        assert!(parse_nocache_upcall(&packet).is_none());
    }
}
