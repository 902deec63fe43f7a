//! Backbone event bus: internal state changes (a DUA clearing DAD, an
//! MLR group gaining or losing its last listener, a role flip) fan out
//! to whichever subsystems care, decoupling the CoAP handlers that
//! cause these changes from the code that reacts to them — the
//! Proactive Backbone Notification sender chief among them.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::broadcast;

use bbr_core::role::all_domain_bbrs;
use bbr_core::tlv::{self, TlvType};

use crate::state::BbrState;

#[derive(Debug, Clone)]
pub enum BackboneEvent {
    DuaCleared(Ipv6Addr),
    DuaRetracted(Ipv6Addr),
    MlrGroupAdded(Ipv6Addr),
    MlrGroupRemoved(Ipv6Addr),
    RoleChanged(bbr_core::role::BbrRole),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BackboneEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: BackboneEvent) {
        // No subscribers is the normal case right after startup; a
        // dropped event here is never load-bearing on its own, PRO_BB.ntf
        // is a proactive courtesy and peers fall back to `/b/bq`.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackboneEvent> {
        self.sender.subscribe()
    }
}

const ACTION_ADDED: u8 = 1;
const ACTION_REMOVED: u8 = 0;

/// Forwards MLR group membership changes to the known peer BBRs on
/// this domain as PRO_BB.ntf (`/b/bmr`), run for the lifetime of the
/// primary role.
pub async fn run_notification_sender(state: Arc<BbrState>, mut events: broadcast::Receiver<BackboneEvent>, peers: Vec<std::net::SocketAddr>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "PRO_BB.ntf sender lagged behind the event bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if !state.current_role().await.is_primary() {
            continue;
        }

        match event {
            BackboneEvent::MlrGroupAdded(group) => send_mlr_notification(&state, &peers, group, ACTION_ADDED).await,
            BackboneEvent::MlrGroupRemoved(group) => send_mlr_notification(&state, &peers, group, ACTION_REMOVED).await,
            BackboneEvent::DuaCleared(dua) => send_dua_notification(&state, dua).await,
            BackboneEvent::DuaRetracted(_) | BackboneEvent::RoleChanged(_) => {}
        }
    }
}

async fn send_mlr_notification(state: &Arc<BbrState>, peers: &[SocketAddr], group: Ipv6Addr, action: u8) {
    let payload = tlv::concat(&[
        tlv::build(TlvType::Ipv6Addresses, &group.octets()),
        tlv::build(TlvType::Status, &[action]),
    ]);
    for peer in peers {
        if let Err(e) = state.coap_client.send_non(*peer, "/b/bmr", payload.clone()).await {
            tracing::debug!(%peer, error = %e, "PRO_BB.ntf delivery failed");
        }
    }
}

/// Announce a cleared or refreshed DUA to the rest of the domain by
/// multicasting a Backbone Answer to the All-Domain-BBRs address,
/// rather than waiting for a peer to ask via `/b/bq`.
pub(crate) async fn send_dua_notification(state: &Arc<BbrState>, dua: Ipv6Addr) {
    let Some(entry) = state.dua_registry.lock().await.get(&dua).cloned() else {
        return;
    };
    let elapsed = (state.clock.now() - entry.registered_at).max(0) as u32;
    let payload = tlv::concat(&[
        tlv::build(TlvType::TargetEid, &dua.octets()),
        tlv::build(TlvType::MlEid, &entry.ml_eid),
        tlv::build(TlvType::TimeSinceLastTransaction, &elapsed.to_be_bytes()),
    ]);
    let domain_prefix = *state.domain_prefix.read().await;
    let dest = SocketAddr::new(all_domain_bbrs(&domain_prefix).into(), crate::nd_proxy::COAP_PORT);
    if let Err(e) = state.coap_client.send_non(dest, "/b/ba", payload).await {
        tracing::debug!(error = %e, "PRO_BB.ntf (DUA) delivery failed");
    }
}
