//! UDP syslog receiver for unsolicited NCP events: address cache
//! changes, role transitions, dataset updates, join outcomes. Parses
//! the RFC 5424-ish preamble the NCP emits and dispatches by msgid.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::state::BbrState;

/// Enterprise number the NCP tags its structured-data element with;
/// messages carrying a different one are not ours and are ignored.
const ENTERPRISE_ID: &str = "49166";

#[derive(Debug, Clone)]
pub enum NcpEvent {
    AddressCacheAdded { rloc16: u16 },
    AddressCacheRemoved { rloc16: u16 },
    RoleChanged { role: String },
    UnicastAddressAdded { address: String },
    ActiveDatasetChanged,
    JoinSucceeded,
    JoinFailed { reason: String },
}

/// Parse one syslog line into the `(msgid, payload)` pair this
/// receiver dispatches on. Returns `None` for anything that doesn't
/// match the expected preamble or enterprise id.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    // <62>1 - - - - - {msgid} [origin enterpriseId="49166"][meta sysUpTime="..."] {payload}
    let rest = line.strip_prefix('<')?;
    let (_, rest) = rest.split_once('>')?;
    let mut fields = rest.splitn(7, ' ');
    let _version = fields.next()?;
    for _ in 0..5 {
        fields.next()?;
    }
    let remainder = fields.next()?;
    let (msgid, remainder) = remainder.split_once(' ')?;
    if !remainder.contains(ENTERPRISE_ID) {
        return None;
    }
    let payload = remainder.rsplit(']').next().unwrap_or("").trim_start();
    Some((msgid, payload))
}

fn to_event(msgid: &str, payload: &str) -> Option<NcpEvent> {
    match msgid {
        "ADDR_CACHE_ADD" => payload.trim().parse().ok().map(|rloc16| NcpEvent::AddressCacheAdded { rloc16 }),
        "ADDR_CACHE_DEL" => payload.trim().parse().ok().map(|rloc16| NcpEvent::AddressCacheRemoved { rloc16 }),
        "ROLE_CHANGED" => Some(NcpEvent::RoleChanged { role: payload.trim().to_string() }),
        "UNICAST_ADDR_ADD" => Some(NcpEvent::UnicastAddressAdded { address: payload.trim().to_string() }),
        "ACTIVE_DATASET_CHANGED" => Some(NcpEvent::ActiveDatasetChanged),
        "JOIN_SUCCESS" => Some(NcpEvent::JoinSucceeded),
        "JOIN_FAILED" => Some(NcpEvent::JoinFailed { reason: payload.trim().to_string() }),
        _ => None,
    }
}

pub struct SyslogReceiver {
    socket: UdpSocket,
    events_tx: mpsc::Sender<NcpEvent>,
}

impl SyslogReceiver {
    pub async fn bind(local: std::net::SocketAddr, events_tx: mpsc::Sender<NcpEvent>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, events_tx })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let Ok(line) = std::str::from_utf8(&buf[..n]) else {
                tracing::debug!(%from, "dropping non-UTF8 syslog datagram");
                continue;
            };
            let Some((msgid, payload)) = parse_line(line) else {
                continue;
            };
            let Some(event) = to_event(msgid, payload) else {
                tracing::trace!(msgid, "unhandled NCP syslog msgid");
                continue;
            };
            if self.events_tx.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Apply an [`NcpEvent`] to shared state: evict a departed router's
/// DUA/MLR entries, flip the cached role, or just log the rest.
pub async fn apply_event(state: &Arc<BbrState>, event: NcpEvent) {
    match event {
        NcpEvent::AddressCacheRemoved { rloc16 } => {
            let evicted_duas = state.dua_registry.lock().await.evict_rloc(rloc16);
            let evicted_groups = state.mlr_registry.lock().await.evict_rloc(rloc16);
            for dua in evicted_duas {
                if let Err(e) = state.packet_filter.deny_dua(dua).await {
                    tracing::warn!(%dua, error = %e, "failed to remove filter rule for evicted DUA");
                }
            }
            for group in evicted_groups {
                if let Err(e) = state.packet_filter.deny_multicast_group(group).await {
                    tracing::warn!(%group, error = %e, "failed to remove filter rule for evicted group");
                }
            }
        }
        NcpEvent::RoleChanged { role } => {
            tracing::info!(%role, "NCP reported a role change");
        }
        NcpEvent::JoinFailed { reason } => {
            tracing::warn!(%reason, "NCP join attempt failed");
        }
        other => {
            tracing::debug!(?other, "NCP syslog event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_cache_add() {
        let line = "<62>1 - - - - - ADDR_CACHE_ADD [origin enterpriseId=\"49166\"][meta sysUpTime=\"123\"] 4096";
        let (msgid, payload) = parse_line(line).unwrap();
        assert_eq!(msgid, "ADDR_CACHE_ADD");
        let event = to_event(msgid, payload).unwrap();
        assert!(matches!(event, NcpEvent::AddressCacheAdded { rloc16: 4096 }));
    }

    #[test]
    fn rejects_mismatched_enterprise_id() {
        let line = "<62>1 - - - - - ADDR_CACHE_ADD [origin enterpriseId=\"1\"][meta sysUpTime=\"123\"] 4096";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn unknown_msgid_yields_no_event() {
        let line = "<62>1 - - - - - SOMETHING_ELSE [origin enterpriseId=\"49166\"][meta sysUpTime=\"1\"] x";
        let (msgid, payload) = parse_line(line).unwrap();
        assert!(to_event(msgid, payload).is_none());
    }

    #[test]
    fn parses_join_failed_with_reason() {
        let line = "<62>1 - - - - - JOIN_FAILED [origin enterpriseId=\"49166\"][meta sysUpTime=\"1\"] timeout";
        let (msgid, payload) = parse_line(line).unwrap();
        let event = to_event(msgid, payload).unwrap();
        assert!(matches!(event, NcpEvent::JoinFailed { reason } if reason == "timeout"));
    }
}
