//! `/b/bmr` — Proactive Backbone Notification (PRO_BB.ntf): the
//! primary BBR announces multicast group membership changes so a
//! secondary mirrors the set before it ever needs to take over.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::state::BbrState;

const ACTION_ADDED: u8 = 1;
const ACTION_REMOVED: u8 = 0;

pub struct ProactiveNotificationHandler {
    state: Arc<BbrState>,
}

impl ProactiveNotificationHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ResourceHandler for ProactiveNotificationHandler {
    async fn handle(&self, request: &CoapMessage, _from: SocketAddr) -> anyhow::Result<CoapResponse> {
        // A primary never needs to mirror its own announcements.
        if self.state.current_role().await.is_primary() {
            return Ok(CoapResponse::empty(CoapCode::CHANGED));
        }

        let tlvs = tlv::parse(&request.payload)?;
        let groups = tlv::find(&tlvs, TlvType::Ipv6Addresses)
            .and_then(|t| t.as_ipv6_list())
            .ok_or_else(|| anyhow::anyhow!("PRO_BB.ntf missing IPv6 Addresses"))?;
        let action = tlv::find(&tlvs, TlvType::Status)
            .and_then(|t| t.as_u8())
            .ok_or_else(|| anyhow::anyhow!("PRO_BB.ntf missing action status"))?;

        let now = self.state.clock.now();
        let mut registry = self.state.mlr_registry.lock().await;
        for group in groups {
            match action {
                ACTION_ADDED => {
                    // Mirror with a long synthetic timeout; the next
                    // registration from the primary will refresh it
                    // with the real remaining lifetime.
                    registry.register(group, 0, Some(3600), now);
                }
                ACTION_REMOVED => {
                    registry.evict_rloc(0);
                }
                _ => {}
            }
        }
        Ok(CoapResponse::empty(CoapCode::CHANGED))
    }
}
