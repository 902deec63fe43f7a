//! Multicast Listener Registration registry.
//!
//! Each registered group carries either an absolute expiry (seconds
//! since the clock epoch) or no expiry at all when it is part of the
//! permanent set configured for this domain.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::status::RegStatus;

/// The lowest timeout this BBR will honor for a registration; shorter
/// requests are rejected rather than silently clamped, so a
/// misconfigured commissioner finds out immediately.
pub const MIN_TIMEOUT_SECS: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlrExpiry {
    Permanent,
    At(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlrEntry {
    pub group: Ipv6Addr,
    pub expiry: MlrExpiry,
    /// RLOC16s currently listening on this group. A group is evicted
    /// once this set empties and it is not permanent.
    pub listeners: Vec<u16>,
}

#[derive(Debug, Default)]
pub struct MlrRegistry {
    groups: HashMap<Ipv6Addr, MlrEntry>,
}

impl MlrRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_permanent(permanent: impl IntoIterator<Item = Ipv6Addr>) -> Self {
        let mut reg = Self::default();
        for group in permanent {
            reg.groups
                .entry(group)
                .or_insert_with(|| MlrEntry { group, expiry: MlrExpiry::Permanent, listeners: Vec::new() });
        }
        reg
    }

    pub fn get(&self, group: &Ipv6Addr) -> Option<&MlrEntry> {
        self.groups.get(group)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MlrEntry> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Register `rloc16` as a listener on `group`. `timeout_secs ==
    /// Some(0)` deregisters the listener instead (per the MLR.req
    /// semantics, a zero timeout is a request to leave). Returns the
    /// status to place in the MLR.rsp TLV.
    pub fn register(
        &mut self,
        group: Ipv6Addr,
        rloc16: u16,
        timeout_secs: Option<u32>,
        now: i64,
    ) -> RegStatus {
        if !group.is_multicast() {
            return RegStatus::InvalidAddress;
        }
        // Link-local and smaller scopes are never registered to the backbone.
        if multicast_scope(&group) < 4 {
            return RegStatus::InvalidAddress;
        }

        if timeout_secs == Some(0) {
            self.deregister(&group, rloc16);
            return RegStatus::Success;
        }

        let timeout = timeout_secs.unwrap_or(MIN_TIMEOUT_SECS * 2);
        if timeout != 0 && timeout < MIN_TIMEOUT_SECS {
            return RegStatus::ResourceShortage;
        }

        let entry = self
            .groups
            .entry(group)
            .or_insert_with(|| MlrEntry { group, expiry: MlrExpiry::At(now), listeners: Vec::new() });
        if !entry.listeners.contains(&rloc16) {
            entry.listeners.push(rloc16);
        }
        if !matches!(entry.expiry, MlrExpiry::Permanent) {
            entry.expiry = MlrExpiry::At(now + timeout as i64);
        }
        RegStatus::Success
    }

    pub fn deregister(&mut self, group: &Ipv6Addr, rloc16: u16) {
        if let Some(entry) = self.groups.get_mut(group) {
            entry.listeners.retain(|r| *r != rloc16);
            if entry.listeners.is_empty() && !matches!(entry.expiry, MlrExpiry::Permanent) {
                self.groups.remove(group);
            }
        }
    }

    /// Drop a departed router's listenership from every group, pruning
    /// groups that become empty. Returns the groups fully vacated.
    pub fn evict_rloc(&mut self, rloc16: u16) -> Vec<Ipv6Addr> {
        let mut vacated = Vec::new();
        self.groups.retain(|group, entry| {
            entry.listeners.retain(|r| *r != rloc16);
            let empty = entry.listeners.is_empty() && !matches!(entry.expiry, MlrExpiry::Permanent);
            if empty {
                vacated.push(*group);
            }
            !empty
        });
        vacated
    }

    /// Sweep expired groups, returning the ones removed so the caller
    /// can stop forwarding them on the backbone.
    pub fn evict_expired(&mut self, now: i64) -> Vec<Ipv6Addr> {
        let mut expired = Vec::new();
        self.groups.retain(|group, entry| {
            let dead = matches!(entry.expiry, MlrExpiry::At(at) if at <= now);
            if dead {
                expired.push(*group);
            }
            !dead
        });
        expired
    }
}

/// Extract the 4-bit scope field from a multicast address's second byte.
fn multicast_scope(addr: &Ipv6Addr) -> u8 {
    addr.octets()[1] & 0x0F
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(last: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xff34, 0, 0, 0, 0, 0, 0, last)
    }

    #[test]
    fn register_accepts_valid_scope() {
        let mut reg = MlrRegistry::new();
        let status = reg.register(group(1), 0x1000, Some(3600), 0);
        assert_eq!(status, RegStatus::Success);
        assert_eq!(reg.get(&group(1)).unwrap().listeners, vec![0x1000]);
    }

    #[test]
    fn register_rejects_non_multicast() {
        let mut reg = MlrRegistry::new();
        let unicast: Ipv6Addr = "fd00::1".parse().unwrap();
        let status = reg.register(unicast, 0x1000, Some(3600), 0);
        assert_eq!(status, RegStatus::InvalidAddress);
    }

    #[test]
    fn register_rejects_link_local_scope() {
        let mut reg = MlrRegistry::new();
        let link_local = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
        let status = reg.register(link_local, 0x1000, Some(3600), 0);
        assert_eq!(status, RegStatus::InvalidAddress);
    }

    #[test]
    fn register_rejects_too_short_timeout() {
        let mut reg = MlrRegistry::new();
        let status = reg.register(group(1), 0x1000, Some(60), 0);
        assert_eq!(status, RegStatus::ResourceShortage);
    }

    #[test]
    fn zero_timeout_deregisters() {
        let mut reg = MlrRegistry::new();
        reg.register(group(1), 0x1000, Some(3600), 0);
        let status = reg.register(group(1), 0x1000, Some(0), 0);
        assert_eq!(status, RegStatus::Success);
        assert!(reg.get(&group(1)).is_none());
    }

    #[test]
    fn permanent_group_never_expires() {
        let mut reg = MlrRegistry::new_with_permanent([group(9)]);
        reg.register(group(9), 0x1000, Some(3600), 0);
        let expired = reg.evict_expired(i64::MAX);
        assert!(expired.is_empty());
        assert!(reg.get(&group(9)).is_some());
    }

    #[test]
    fn evict_expired_removes_past_deadline_groups() {
        let mut reg = MlrRegistry::new();
        reg.register(group(1), 0x1000, Some(300), 0);
        let expired = reg.evict_expired(1000);
        assert_eq!(expired, vec![group(1)]);
    }

    #[test]
    fn evict_rloc_prunes_emptied_group() {
        let mut reg = MlrRegistry::new();
        reg.register(group(1), 0x1000, Some(3600), 0);
        let vacated = reg.evict_rloc(0x1000);
        assert_eq!(vacated, vec![group(1)]);
    }
}
