//! `/a/ae` — Address Error: the mesh reports that a DUA it believed
//! was uniquely ours collided with another device, after DAD already
//! cleared it. The BBR retracts the registration rather than leave a
//! stale forwarding rule on the backbone.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::state::BbrState;

pub struct AddressErrorHandler {
    state: Arc<BbrState>,
}

impl AddressErrorHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ResourceHandler for AddressErrorHandler {
    async fn handle(&self, request: &CoapMessage, _from: SocketAddr) -> anyhow::Result<CoapResponse> {
        // Only the primary's registry is authoritative over the DUA
        // this reports against.
        if !self.state.current_role().await.is_primary() {
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        }

        let tlvs = tlv::parse(&request.payload)?;
        let target = tlv::find(&tlvs, TlvType::TargetEid)
            .and_then(|t| t.as_ipv6())
            .ok_or_else(|| anyhow::anyhow!("ae missing Target EID"))?;
        let ml_eid = tlv::find(&tlvs, TlvType::MlEid)
            .and_then(|t| t.as_eui64())
            .ok_or_else(|| anyhow::anyhow!("ae missing ML-EID"))?;

        if !dua_is_in_domain(&target, &*self.state.domain_prefix.read().await) {
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        }

        let mut registry = self.state.dua_registry.lock().await;
        let should_remove = registry
            .get(&target)
            .map(|entry| !entry.dad_in_progress && entry.ml_eid != ml_eid)
            .unwrap_or(false);
        if should_remove {
            registry.deregister(&target);
            drop(registry);
            if let Err(e) = self.state.packet_filter.deny_dua(target).await {
                tracing::warn!(%target, error = %e, "failed to retract filter rule after address error");
            }
            self.state.dua_neighbors.withdraw(target).await;
            tracing::info!(%target, "DUA retracted after ADDR_ERR.ntf");
        }
        Ok(CoapResponse::empty(CoapCode::CHANGED))
    }
}

fn dua_is_in_domain(dua: &std::net::Ipv6Addr, domain_prefix: &std::net::Ipv6Addr) -> bool {
    dua.octets()[..8] == domain_prefix.octets()[..8]
}
