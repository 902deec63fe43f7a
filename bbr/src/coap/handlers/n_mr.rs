//! `/n/mr` — MLR.req: Multicast Listener Registration relayed from an
//! interior router to the primary BBR.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::status::RegStatus;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::state::BbrState;

pub struct MlrRegistrationHandler {
    state: Arc<BbrState>,
}

impl MlrRegistrationHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ResourceHandler for MlrRegistrationHandler {
    async fn handle(&self, request: &CoapMessage, _from: SocketAddr) -> anyhow::Result<CoapResponse> {
        let tlvs = tlv::parse(&request.payload)?;

        let groups = tlv::find(&tlvs, TlvType::Ipv6Addresses)
            .and_then(|t| t.as_ipv6_list())
            .ok_or_else(|| anyhow::anyhow!("MLR.req missing IPv6 Addresses"))?;
        let rloc16 = tlv::find(&tlvs, TlvType::Rloc16)
            .and_then(|t| t.as_u16())
            .ok_or_else(|| anyhow::anyhow!("MLR.req missing RLOC16"))?;
        let timeout_secs = tlv::find(&tlvs, TlvType::Timeout).and_then(|t| t.as_u32());

        if !self.state.current_role().await.is_primary() {
            return Ok(aggregate_response(RegStatus::NotPrimary, &groups));
        }

        let now = self.state.clock.now();
        let mut failed = Vec::new();
        let mut worst = RegStatus::Success;
        for group in &groups {
            let status = {
                let mut registry = self.state.mlr_registry.lock().await;
                registry.register(*group, rloc16, timeout_secs, now)
            };
            if status != RegStatus::Success {
                failed.push(*group);
                worst = status;
            } else {
                self.state
                    .packet_filter
                    .allow_multicast_group(*group)
                    .await
                    .map_err(|e| anyhow::anyhow!("filter update for group {group}: {e}"))?;
            }
        }

        if failed.is_empty() {
            Ok(aggregate_response(RegStatus::Success, &[]))
        } else {
            Ok(aggregate_response(worst, &failed))
        }
    }
}

fn aggregate_response(status: RegStatus, failed_addrs: &[std::net::Ipv6Addr]) -> CoapResponse {
    let mut parts = vec![tlv::build(TlvType::Status, &[status.as_u8()])];
    if !failed_addrs.is_empty() {
        let mut addr_bytes = Vec::with_capacity(failed_addrs.len() * 16);
        for addr in failed_addrs {
            addr_bytes.extend_from_slice(&addr.octets());
        }
        parts.push(tlv::build(TlvType::Ipv6Addresses, &addr_bytes));
    }
    CoapResponse::new(CoapCode::CHANGED, tlv::concat(&parts))
}
