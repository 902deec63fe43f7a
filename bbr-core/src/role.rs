//! BBR role state and the primary/secondary arbitration inputs carried
//! in the Thread Network Data BBR Service TLV.

use std::cmp::Ordering;
use std::net::Ipv6Addr;

/// Where this device currently stands with respect to backbone duties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrRole {
    Off,
    Secondary,
    Primary,
}

impl BbrRole {
    pub fn is_primary(self) -> bool {
        matches!(self, BbrRole::Primary)
    }
}

impl std::fmt::Display for BbrRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BbrRole::Off => "off",
            BbrRole::Secondary => "secondary",
            BbrRole::Primary => "primary",
        };
        f.write_str(s)
    }
}

/// The BBR Service TLV fields advertised by every candidate BBR in
/// Thread Network Data: a sequence number, a reregistration delay
/// (seconds), and the default MLR timeout (seconds) it will apply to
/// registrations that omit an explicit timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbrServiceEntry {
    pub rloc16: u16,
    pub sequence_number: u8,
    pub reregistration_delay: u16,
    pub mlr_timeout: u32,
}

/// Elect the primary BBR from the set of candidates currently present
/// in Network Data, per the sequence-number comparison defined for
/// Thread 1.2 BBR arbitration: the higher sequence number wins, with
/// wraparound handled by treating a difference in the upper half of
/// the `u8` range as the smaller value being newer. Ties (identical
/// sequence number) favor the entry appearing later in `candidates`,
/// on the read that a peer's just-refreshed entry is fresher than our
/// own possibly-stale view of it.
pub fn elect_primary(candidates: &[BbrServiceEntry]) -> Option<BbrServiceEntry> {
    candidates.iter().copied().fold(None, |best, candidate| match best {
        None => Some(candidate),
        Some(current) => {
            if sequence_is_newer(candidate.sequence_number, current.sequence_number)
                || candidate.sequence_number == current.sequence_number
            {
                Some(candidate)
            } else {
                Some(current)
            }
        }
    })
}

/// Serial-number arithmetic (RFC 1982) over a `u8` space: `a` is newer
/// than `b` if the forward distance from `b` to `a` is strictly less
/// than half the sequence space.
fn sequence_is_newer(a: u8, b: u8) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < 0x80
}

pub fn sequence_cmp(a: u8, b: u8) -> Ordering {
    if a == b {
        Ordering::Equal
    } else if sequence_is_newer(a, b) {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// Derive the RFC 3306 unicast-prefix-based multicast address for a
/// given flags/scope nibble, group ID and 64-bit network prefix: `FF3x:0040:<prefix><group_id>`
/// where `x` is the scope nibble (a domain prefix's All-Domain-BBRs
/// address uses scope 3 — site-local — while the mesh-local variant
/// uses scope 2 — realm-local).
pub fn derive_rfc3306_multicast(scope: u8, group_id: u16, prefix: &Ipv6Addr) -> Ipv6Addr {
    let prefix_bytes = prefix.octets();
    let mut out = [0u8; 16];
    out[0] = 0xFF;
    out[1] = 0x30 | (scope & 0x0F);
    out[2] = 0x00;
    out[3] = 0x40;
    out[4..12].copy_from_slice(&prefix_bytes[0..8]);
    out[14..16].copy_from_slice(&group_id.to_be_bytes());
    Ipv6Addr::from(out)
}

/// All Network BBRs address derived from the mesh-local prefix (group ID 0x0002).
pub fn all_network_bbrs(mesh_local_prefix: &Ipv6Addr) -> Ipv6Addr {
    derive_rfc3306_multicast(0x2, 0x0002, mesh_local_prefix)
}

/// All Domain BBRs address derived from the backbone domain prefix (group ID 0x0003).
pub fn all_domain_bbrs(domain_prefix: &Ipv6Addr) -> Ipv6Addr {
    derive_rfc3306_multicast(0x3, 0x0003, domain_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rloc16: u16, seq: u8) -> BbrServiceEntry {
        BbrServiceEntry { rloc16, sequence_number: seq, reregistration_delay: 10, mlr_timeout: 3600 }
    }

    #[test]
    fn higher_sequence_number_wins() {
        let candidates = [entry(0x1000, 5), entry(0x2000, 9)];
        let winner = elect_primary(&candidates).unwrap();
        assert_eq!(winner.rloc16, 0x2000);
    }

    #[test]
    fn wraparound_is_handled() {
        // 2 is "newer" than 250 under RFC 1982 serial arithmetic.
        let candidates = [entry(0x1000, 250), entry(0x2000, 2)];
        let winner = elect_primary(&candidates).unwrap();
        assert_eq!(winner.rloc16, 0x2000);
    }

    #[test]
    fn tie_favors_later_candidate() {
        let candidates = [entry(0x1000, 7), entry(0x2000, 7)];
        let winner = elect_primary(&candidates).unwrap();
        assert_eq!(winner.rloc16, 0x2000);
    }

    #[test]
    fn no_candidates_elects_none() {
        assert!(elect_primary(&[]).is_none());
    }

    #[test]
    fn all_network_bbrs_address_matches_rfc3306() {
        let mesh_local: Ipv6Addr = "fd00:1234:5678:9abc::1".parse().unwrap();
        let addr = all_network_bbrs(&mesh_local);
        assert_eq!(&addr.to_string()[..4], "ff32");
        assert_eq!(addr.octets()[2], 0x00);
        assert_eq!(addr.octets()[3], 0x40);
        assert_eq!(&addr.octets()[14..16], &[0x00, 0x02]);
    }

    #[test]
    fn all_domain_bbrs_address_matches_rfc3306() {
        let domain_prefix: Ipv6Addr = "fd00:aabb:ccdd:eeff::".parse().unwrap();
        let addr = all_domain_bbrs(&domain_prefix);
        assert_eq!(&addr.to_string()[..4], "ff33");
        assert_eq!(&addr.octets()[14..16], &[0x00, 0x03]);
    }
}
