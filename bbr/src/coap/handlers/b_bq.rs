//! `/b/bq` — Backbone Query: a peer BBR on the same domain asking
//! whether we hold a given DUA, used to resolve a DUA across Thread
//! networks sharing one backbone domain before DAD commits to it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::state::BbrState;

pub struct BackboneQueryHandler {
    state: Arc<BbrState>,
}

impl BackboneQueryHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ResourceHandler for BackboneQueryHandler {
    async fn handle(&self, request: &CoapMessage, from: SocketAddr) -> anyhow::Result<CoapResponse> {
        // Only the primary holds the registry a query can be answered
        // from; a secondary has nothing authoritative to say.
        if !self.state.current_role().await.is_primary() {
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        }

        let tlvs = tlv::parse(&request.payload)?;
        let target = tlv::find(&tlvs, TlvType::TargetEid)
            .and_then(|t| t.as_ipv6())
            .ok_or_else(|| anyhow::anyhow!("bq missing Target EID"))?;
        // Present when this query was relayed from an `/a/aq` ingest on
        // behalf of a mesh Address Query; echoed back unchanged so the
        // relaying BBR can tell its own answer from an ordinary DAD reply.
        let requester_rloc16 = tlv::find(&tlvs, TlvType::Rloc16).and_then(|t| t.as_u16());

        let entry = self.state.dua_registry.lock().await.get(&target).cloned();
        if let Some(entry) = entry {
            if !entry.dad_in_progress {
                let elapsed = (self.state.clock.now() - entry.registered_at).max(0) as u32;
                let mut parts = vec![
                    tlv::build(TlvType::TargetEid, &target.octets()),
                    tlv::build(TlvType::MlEid, &entry.ml_eid),
                    tlv::build(TlvType::TimeSinceLastTransaction, &elapsed.to_be_bytes()),
                ];
                if let Some(rloc16) = requester_rloc16 {
                    parts.push(tlv::build(TlvType::Rloc16, &rloc16.to_be_bytes()));
                }
                let payload = tlv::concat(&parts);
                if let Err(e) = self.state.coap_client.send_non(from, "/b/ba", payload).await {
                    tracing::warn!(error = %e, %from, "failed to send Backbone Answer");
                }
            }
        }
        // bq is always NON; the CoAP server only sends this CoAP-level
        // ack if the peer happened to mark it confirmable.
        Ok(CoapResponse::empty(CoapCode::CHANGED))
    }
}
