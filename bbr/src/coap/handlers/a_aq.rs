//! `/a/aq` — Address Query: an interior router asks the primary BBR to
//! resolve a DUA it could not find locally. Ingested on the mesh-facing
//! Realm-Local-All-Routers binding; answered not directly but by
//! relaying the query onto the backbone as a `/b/bq` carrying the
//! requester's RLOC16, so whichever BBR on the domain actually holds
//! the DUA can answer with an `/a/an` straight back to the requester.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::role::all_domain_bbrs;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::state::BbrState;

pub struct AddressQueryHandler {
    state: Arc<BbrState>,
}

impl AddressQueryHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ResourceHandler for AddressQueryHandler {
    async fn handle(&self, request: &CoapMessage, from: SocketAddr) -> anyhow::Result<CoapResponse> {
        // Only the primary relays onto the backbone; a secondary has
        // no business spending a query on a DUA it cannot answer for.
        if !self.state.current_role().await.is_primary() {
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        }

        let tlvs = tlv::parse(&request.payload)?;
        let target = tlv::find(&tlvs, TlvType::TargetEid)
            .and_then(|t| t.as_ipv6())
            .ok_or_else(|| anyhow::anyhow!("aq missing Target EID"))?;

        if !dua_is_in_domain(&target, &*self.state.domain_prefix.read().await) {
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        }

        let Some(requester_rloc16) = requester_rloc16_from(&from) else {
            tracing::debug!(%from, "aq source address carries no RLOC16, dropping");
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        };

        let payload = tlv::concat(&[
            tlv::build(TlvType::TargetEid, &target.octets()),
            tlv::build(TlvType::Rloc16, &requester_rloc16.to_be_bytes()),
        ]);
        let domain_prefix = *self.state.domain_prefix.read().await;
        let dest = SocketAddr::new(all_domain_bbrs(&domain_prefix).into(), crate::nd_proxy::COAP_PORT);
        if let Err(e) = self.state.coap_client.send_non(dest, "/b/bq", payload).await {
            tracing::warn!(%target, error = %e, "failed to relay Address Query onto the backbone");
        }

        // aq is answered asynchronously by a later /a/an, never directly.
        Ok(CoapResponse::empty(CoapCode::CHANGED))
    }
}

fn dua_is_in_domain(dua: &std::net::Ipv6Addr, domain_prefix: &std::net::Ipv6Addr) -> bool {
    dua.octets()[..8] == domain_prefix.octets()[..8]
}

/// Recover the RLOC16 embedded in a mesh-local EID's interface
/// identifier (`0000:00ff:fe00:<rloc16>`), the convention every
/// interior router's source address follows on this binding.
fn requester_rloc16_from(from: &SocketAddr) -> Option<u16> {
    let SocketAddr::V6(v6) = from else { return None };
    let octets = v6.ip().octets();
    if octets[8..14] != [0x00, 0x00, 0x00, 0xff, 0xfe, 0x00] {
        return None;
    }
    Some(u16::from_be_bytes([octets[14], octets[15]]))
}
