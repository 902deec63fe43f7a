//! `/b/ba` — Backbone Answer: a peer BBR telling us what it knows
//! about a DUA, in one of three shapes depending on the query it
//! answers:
//!
//! - The direct reply to our own unicast `/b/bq` DAD probe. Recognized
//!   by our own registry entry still having `dad_in_progress` set. A
//!   matching ML-EID means the peer is re-announcing the same device we
//!   are registering, not a collision; a differing one flags the entry
//!   `pending_delete` so `dad.rs` retracts it once the query window closes.
//! - An echo of a query relayed on behalf of an `/a/aq` mesh ingest,
//!   carrying the requester's RLOC16 back. Answered with an `/a/an`
//!   toward that RLOC16 regardless of our own DAD state.
//! - An unsolicited PRO_BB.ntf multicast to All Domain BBRs, announcing
//!   or refreshing a DUA we already hold post-DAD. Compared by elapsed
//!   time since each side's last transaction to decide who re-announces
//!   and who steps aside.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::registry::DuaEntry;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::state::{BbrState, RemoteDuaInfo};

/// Destination for the multicast-differ `/a/ae` relay: Realm-Local All
/// Routers on the interior mesh, reaching every router that might be
/// holding a stale filter rule for the DUA being withdrawn.
const MESH_REALM_LOCAL_ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff03, 0, 0, 0, 0, 0, 0, 0x0002);

pub struct BackboneAnswerHandler {
    state: Arc<BbrState>,
}

impl BackboneAnswerHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }

    /// Direct reply to our own `/b/bq` DAD probe.
    async fn handle_unicast_dad_reply(&self, target: Ipv6Addr, peer_ml_eid: [u8; 8]) {
        let mut registry = self.state.dua_registry.lock().await;
        let Some(entry) = registry.get(&target) else { return };
        if entry.ml_eid == peer_ml_eid {
            drop(registry);
            crate::events::send_dua_notification(&self.state, target).await;
        } else {
            registry.mark_pending_delete(&target);
        }
    }

    /// PRO_BB.ntf multicast describing a DUA we already hold post-DAD.
    async fn handle_multicast_known(&self, target: Ipv6Addr, peer_ml_eid: [u8; 8], elapsed: Option<u32>, entry: DuaEntry) {
        if entry.ml_eid == peer_ml_eid {
            let Some(peer_elapsed) = elapsed else { return };
            let our_elapsed = (self.state.clock.now() - entry.registered_at).max(0) as u32;
            if our_elapsed < peer_elapsed {
                // Ours is the fresher copy; re-announce it.
                crate::events::send_dua_notification(&self.state, target).await;
            } else {
                self.withdraw(target).await;
            }
        } else {
            self.withdraw(target).await;
            self.relay_address_error(target).await;
        }
    }

    async fn withdraw(&self, target: Ipv6Addr) {
        self.state.dua_registry.lock().await.deregister(&target);
        self.state.dua_neighbors.withdraw(target).await;
        if let Err(e) = self.state.packet_filter.deny_dua(target).await {
            tracing::warn!(%target, error = %e, "failed to retract filter rule after Backbone Answer");
        }
    }

    async fn relay_address_error(&self, target: Ipv6Addr) {
        let payload = tlv::build(TlvType::TargetEid, &target.octets());
        let dest = SocketAddr::new(MESH_REALM_LOCAL_ALL_ROUTERS.into(), crate::nd_proxy::COAP_PORT);
        if let Err(e) = self.state.coap_client.send_non(dest, "/a/ae", payload).await {
            tracing::debug!(%target, error = %e, "address-error relay into the mesh failed");
        }
    }

    /// Echo of a query relayed from `/a/aq`: answer with ADDR_NTF.ans
    /// toward the requester's RLOC16, falling back to our own
    /// mesh-local address when the RLOC16 named is our own.
    async fn send_addr_notification(&self, target: Ipv6Addr, rloc16: u16) {
        let own = *self.state.own_rloc16.read().await;
        let dest = if rloc16 == own {
            SocketAddr::new(self.state.mesh_local_prefix.into(), crate::nd_proxy::COAP_PORT)
        } else {
            crate::nd_proxy::rloc16_to_backbone_addr(&self.state.mesh_local_prefix, rloc16)
        };
        let payload = tlv::build(TlvType::TargetEid, &target.octets());
        if let Err(e) = self.state.coap_client.send_con(dest, "/a/an", payload).await {
            tracing::warn!(error = %e, %target, rloc16, "failed to send ADDR_NTF.ans");
        }
    }
}

#[async_trait]
impl ResourceHandler for BackboneAnswerHandler {
    async fn handle(&self, request: &CoapMessage, _from: SocketAddr) -> anyhow::Result<CoapResponse> {
        let tlvs = tlv::parse(&request.payload)?;
        let target = tlv::find(&tlvs, TlvType::TargetEid)
            .and_then(|t| t.as_ipv6())
            .ok_or_else(|| anyhow::anyhow!("ba missing Target EID"))?;
        let ml_eid = tlv::find(&tlvs, TlvType::MlEid)
            .and_then(|t| t.as_eui64())
            .ok_or_else(|| anyhow::anyhow!("ba missing ML-EID"))?;
        let elapsed = tlv::find(&tlvs, TlvType::TimeSinceLastTransaction).and_then(|t| t.as_u32());
        let rloc16 = tlv::find(&tlvs, TlvType::Rloc16).and_then(|t| t.as_u16());

        {
            let mut cache = self.state.remote_dua_cache.lock().await;
            cache.insert(target, RemoteDuaInfo { ml_eid, learned_at: self.state.clock.now() });
        }

        let our_entry = self.state.dua_registry.lock().await.get(&target).cloned();
        match our_entry {
            Some(entry) if entry.dad_in_progress => {
                self.handle_unicast_dad_reply(target, ml_eid).await;
            }
            Some(entry) => {
                if let Some(rloc16) = rloc16 {
                    self.send_addr_notification(target, rloc16).await;
                } else {
                    self.handle_multicast_known(target, ml_eid, elapsed, entry).await;
                }
            }
            None => {
                // Unknown DUA: the cache update above is all there is
                // to do, nothing locally held needs reconciling.
            }
        }

        Ok(CoapResponse::empty(CoapCode::CHANGED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbr_core::config::{ConfigSchema, ConfigStore};
    use bbr_core::ports::fakes::RecordingPacketFilter;
    use bbr_core::role::BbrRole;
    use bbr_core::time::TestClock;
    use std::collections::HashMap;
    use tokio::sync::{mpsc, Mutex, RwLock};

    use crate::coap::{CoapClient, CoapType};
    use crate::ncp::commander::NullNcpCommander;

    async fn test_state() -> Arc<BbrState> {
        let (dad_tx, _rx) = mpsc::channel(8);
        let client = CoapClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        Arc::new(BbrState {
            config: Arc::new(ConfigStore::new(ConfigSchema::new(), None)),
            clock: Arc::new(TestClock::new(9000)),
            packet_filter: Arc::new(RecordingPacketFilter::default()),
            ncp: Arc::new(NullNcpCommander),
            coap_client: Arc::new(client),
            dua_registry: Mutex::new(Default::default()),
            mlr_registry: Mutex::new(Default::default()),
            remote_dua_cache: Mutex::new(HashMap::new()),
            role: RwLock::new(BbrRole::Secondary),
            mesh_local_prefix: "fd00:1111::".parse().unwrap(),
            domain_prefix: RwLock::new("fd00:dddd::".parse().unwrap()),
            own_rloc16: RwLock::new(0),
            dad_tx,
            events: Arc::new(crate::events::EventBus::new(8)),
            dua_neighbors: Arc::new(crate::nd_proxy::NullDuaNeighborPort),
        })
    }

    fn answer_payload(dua: Ipv6Addr, ml_eid: [u8; 8], elapsed: Option<u32>, rloc16: Option<u16>) -> Vec<u8> {
        let mut parts = vec![tlv::build(TlvType::TargetEid, &dua.octets()), tlv::build(TlvType::MlEid, &ml_eid)];
        if let Some(elapsed) = elapsed {
            parts.push(tlv::build(TlvType::TimeSinceLastTransaction, &elapsed.to_be_bytes()));
        }
        if let Some(rloc16) = rloc16 {
            parts.push(tlv::build(TlvType::Rloc16, &rloc16.to_be_bytes()));
        }
        tlv::concat(&parts)
    }

    fn request(payload: Vec<u8>) -> CoapMessage {
        CoapMessage::new_request(CoapType::NonConfirmable, CoapCode::POST, 1, "/b/ba").with_payload(payload)
    }

    #[tokio::test]
    async fn answer_is_cached_by_target_eid() {
        let state = test_state().await;
        let handler = BackboneAnswerHandler::new(state.clone());
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        handler.handle(&request(answer_payload(dua, [7; 8], None, None)), "127.0.0.1:1".parse().unwrap()).await.unwrap();

        let cache = state.remote_dua_cache.lock().await;
        assert_eq!(cache.get(&dua).unwrap().ml_eid, [7; 8]);
    }

    #[tokio::test]
    async fn unicast_reply_with_matching_ml_eid_is_not_a_collision() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 9000);

        let handler = BackboneAnswerHandler::new(state.clone());
        handler.handle(&request(answer_payload(dua, [1; 8], None, None)), "127.0.0.1:1".parse().unwrap()).await.unwrap();

        let entry = state.dua_registry.lock().await.get(&dua).cloned().unwrap();
        assert!(entry.dad_in_progress);
        assert!(!entry.pending_delete);
    }

    #[tokio::test]
    async fn unicast_reply_with_differing_ml_eid_marks_pending_delete() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 9000);

        let handler = BackboneAnswerHandler::new(state.clone());
        handler.handle(&request(answer_payload(dua, [2; 8], None, None)), "127.0.0.1:1".parse().unwrap()).await.unwrap();

        let entry = state.dua_registry.lock().await.get(&dua).cloned().unwrap();
        assert!(entry.pending_delete);
        assert!(entry.dad_in_progress);
    }

    #[tokio::test]
    async fn relayed_rloc16_sends_addr_notification() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 9000);
        state.dua_registry.lock().await.resolve_dad(&dua, false);

        let handler = BackboneAnswerHandler::new(state.clone());
        // send_con retries against an unreachable peer; the assertion
        // here is only that the handler does not error out attempting it.
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            handler.handle(&request(answer_payload(dua, [1; 8], None, Some(0x7000))), "127.0.0.1:1".parse().unwrap()),
        )
        .await;
        assert!(result.is_err() || result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn multicast_fresher_peer_re_announces() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 8000);
        state.dua_registry.lock().await.resolve_dad(&dua, false);

        // our_elapsed = 9000 - 8000 = 1000, peer reports a larger elapsed
        // (2000), so ours is fresher and the entry survives.
        let handler = BackboneAnswerHandler::new(state.clone());
        handler
            .handle(&request(answer_payload(dua, [1; 8], Some(2000), None)), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();

        assert!(state.dua_registry.lock().await.get(&dua).is_some());
    }

    #[tokio::test]
    async fn multicast_stale_local_copy_is_withdrawn() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 8000);
        state.dua_registry.lock().await.resolve_dad(&dua, false);
        state.packet_filter.allow_dua(dua).await.unwrap();

        // our_elapsed = 1000, peer reports a smaller elapsed (100): the
        // peer's copy is fresher, ours steps aside.
        let handler = BackboneAnswerHandler::new(state.clone());
        handler
            .handle(&request(answer_payload(dua, [1; 8], Some(100), None)), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();

        assert!(state.dua_registry.lock().await.get(&dua).is_none());
    }

    #[tokio::test]
    async fn multicast_differing_ml_eid_is_withdrawn() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 8000);
        state.dua_registry.lock().await.resolve_dad(&dua, false);
        state.packet_filter.allow_dua(dua).await.unwrap();

        let handler = BackboneAnswerHandler::new(state.clone());
        handler
            .handle(&request(answer_payload(dua, [9; 8], Some(100), None)), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();

        assert!(state.dua_registry.lock().await.get(&dua).is_none());
    }

    #[tokio::test]
    async fn unknown_dua_only_populates_cache() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::5".parse().unwrap();

        let handler = BackboneAnswerHandler::new(state.clone());
        handler.handle(&request(answer_payload(dua, [1; 8], Some(100), None)), "127.0.0.1:1".parse().unwrap()).await.unwrap();

        assert!(state.dua_registry.lock().await.get(&dua).is_none());
        assert!(state.remote_dua_cache.lock().await.get(&dua).is_some());
    }
}
