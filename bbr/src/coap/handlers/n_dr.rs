//! `/n/dr` — DUA.req: Domain Unicast Address registration from an
//! interior router acting on behalf of an end device.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::registry::DuaRegisterOutcome;
use bbr_core::status::RegStatus;
use bbr_core::tlv::{self, TlvType};

use crate::coap::{CoapCode, CoapMessage, CoapResponse, ResourceHandler};
use crate::events::BackboneEvent;
use crate::state::{BbrState, DadRequest};

pub struct DuaRegistrationHandler {
    state: Arc<BbrState>,
}

impl DuaRegistrationHandler {
    pub fn new(state: Arc<BbrState>) -> Self {
        Self { state }
    }

    /// Conformance-harness escape hatch: if `dua_next_status` is set
    /// (and `dua_next_status_eid`, when present, matches this request's
    /// Target EID), consume both keys and return the forced status
    /// instead of running the real registration logic. Lets a test
    /// harness drive every `/n/dr` response code without the registry
    /// actually needing to reach that state.
    async fn consume_test_mode_override(&self, dua: Ipv6Addr) -> Option<RegStatus> {
        let forced = self.state.config.get_int("dua_next_status").await?;
        if let Some(eid) = self.state.config.get_str("dua_next_status_eid").await {
            let matches = eid.parse::<Ipv6Addr>().map(|addr| addr == dua).unwrap_or(false);
            if !matches {
                return None;
            }
        }
        self.state.config.delete("dua_next_status").await;
        self.state.config.delete("dua_next_status_eid").await;
        RegStatus::from_u8(u8::try_from(forced).ok()?)
    }
}

#[async_trait]
impl ResourceHandler for DuaRegistrationHandler {
    async fn handle(&self, request: &CoapMessage, _from: SocketAddr) -> anyhow::Result<CoapResponse> {
        let tlvs = tlv::parse(&request.payload)?;

        let dua = tlv::find(&tlvs, TlvType::TargetEid)
            .and_then(|t| t.as_ipv6())
            .ok_or_else(|| anyhow::anyhow!("DUA.req missing Target EID"))?;
        let ml_eid = tlv::find(&tlvs, TlvType::MlEid)
            .and_then(|t| t.as_eui64())
            .ok_or_else(|| anyhow::anyhow!("DUA.req missing ML-EID"))?;
        let rloc16 = tlv::find(&tlvs, TlvType::Rloc16)
            .and_then(|t| t.as_u16())
            .ok_or_else(|| anyhow::anyhow!("DUA.req missing RLOC16"))?;

        if let Some(forced) = self.consume_test_mode_override(dua).await {
            return Ok(status_response(forced));
        }

        if !self.state.current_role().await.is_primary() {
            return Ok(status_response(RegStatus::NotPrimary));
        }

        if !dua_is_in_domain(&dua, &*self.state.domain_prefix.read().await) {
            return Ok(status_response(RegStatus::InvalidAddress));
        }

        let now = self.state.clock.now();
        let outcome = {
            let mut registry = self.state.dua_registry.lock().await;
            registry.register(dua, ml_eid, rloc16, now)
        };

        match outcome {
            DuaRegisterOutcome::Refreshed => {
                // `register()` can report a refresh while DAD is still
                // outstanding on the entry; only a post-DAD refresh is
                // worth a re-announcement, so check the flag directly
                // instead of inferring it from the outcome.
                let post_dad = self
                    .state
                    .dua_registry
                    .lock()
                    .await
                    .get(&dua)
                    .map(|entry| !entry.dad_in_progress)
                    .unwrap_or(false);
                if post_dad {
                    self.state.events.publish(BackboneEvent::DuaCleared(dua));
                }
                Ok(status_response(RegStatus::Success))
            }
            DuaRegisterOutcome::Conflict => Ok(status_response(RegStatus::Duplicate)),
            DuaRegisterOutcome::New => {
                self.state
                    .packet_filter
                    .allow_dua(dua)
                    .await
                    .map_err(|e| anyhow::anyhow!("filter update for new DUA {dua}: {e}"))?;
                if self.state.dad_tx.send(DadRequest { dua, rloc16 }).await.is_err() {
                    tracing::warn!(%dua, "DAD scheduler channel closed, registering without DAD");
                }
                Ok(status_response(RegStatus::Success))
            }
        }
    }
}

fn dua_is_in_domain(dua: &std::net::Ipv6Addr, domain_prefix: &std::net::Ipv6Addr) -> bool {
    dua.octets()[..8] == domain_prefix.octets()[..8]
}

fn status_response(status: RegStatus) -> CoapResponse {
    let payload = tlv::build(TlvType::Status, &[status.as_u8()]);
    CoapResponse::new(CoapCode::CHANGED, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbr_core::config::{ConfigSchema, ConfigStore, ConfigValue};
    use bbr_core::ports::fakes::RecordingPacketFilter;
    use bbr_core::role::BbrRole;
    use bbr_core::time::TestClock;
    use tokio::sync::{mpsc, Mutex, RwLock};

    use crate::coap::CoapClient;
    use crate::ncp::commander::NullNcpCommander;

    async fn test_state(role: BbrRole) -> (Arc<BbrState>, mpsc::Receiver<DadRequest>) {
        let (dad_tx, dad_rx) = mpsc::channel(8);
        let client = CoapClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let state = Arc::new(BbrState {
            config: Arc::new(ConfigStore::new(ConfigSchema::new(), None)),
            clock: Arc::new(TestClock::new(1000)),
            packet_filter: Arc::new(RecordingPacketFilter::default()),
            ncp: Arc::new(NullNcpCommander),
            coap_client: Arc::new(client),
            dua_registry: Mutex::new(Default::default()),
            mlr_registry: Mutex::new(Default::default()),
            remote_dua_cache: Mutex::new(Default::default()),
            role: RwLock::new(role),
            mesh_local_prefix: "fd00:1111::".parse().unwrap(),
            domain_prefix: RwLock::new("fd00:dddd::".parse().unwrap()),
            own_rloc16: RwLock::new(0),
            dad_tx,
            events: Arc::new(crate::events::EventBus::new(8)),
            dua_neighbors: Arc::new(crate::nd_proxy::NullDuaNeighborPort),
        });
        (state, dad_rx)
    }

    fn request(dua: Ipv6Addr, ml_eid: [u8; 8], rloc16: u16) -> CoapMessage {
        let payload = tlv::concat(&[
            tlv::build(TlvType::TargetEid, &dua.octets()),
            tlv::build(TlvType::MlEid, &ml_eid),
            tlv::build(TlvType::Rloc16, &rloc16.to_be_bytes()),
        ]);
        CoapMessage::new_request(crate::coap::CoapType::Confirmable, crate::coap::CoapCode::POST, 1, "/n/dr")
            .with_payload(payload)
    }

    #[tokio::test]
    async fn new_registration_starts_dad_and_allows_filter() {
        let (state, mut dad_rx) = test_state(BbrRole::Primary).await;
        let handler = DuaRegistrationHandler::new(state.clone());
        let dua: Ipv6Addr = "fd00:dddd::42".parse().unwrap();
        let response = handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();

        let tlvs = tlv::parse(&response.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::Success.as_u8());

        let dad_req = dad_rx.recv().await.unwrap();
        assert_eq!(dad_req.dua, dua);
    }

    #[tokio::test]
    async fn secondary_rejects_with_not_primary() {
        let (state, _rx) = test_state(BbrRole::Secondary).await;
        let handler = DuaRegistrationHandler::new(state);
        let dua: Ipv6Addr = "fd00:dddd::42".parse().unwrap();
        let response = handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        let tlvs = tlv::parse(&response.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::NotPrimary.as_u8());
    }

    #[tokio::test]
    async fn out_of_domain_dua_is_invalid() {
        let (state, _rx) = test_state(BbrRole::Primary).await;
        let handler = DuaRegistrationHandler::new(state);
        let dua: Ipv6Addr = "fd00:aaaa::42".parse().unwrap();
        let response = handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        let tlvs = tlv::parse(&response.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::InvalidAddress.as_u8());
    }

    #[tokio::test]
    async fn same_ml_eid_refresh_skips_dad() {
        let (state, mut dad_rx) = test_state(BbrRole::Primary).await;
        let handler = DuaRegistrationHandler::new(state.clone());
        let dua: Ipv6Addr = "fd00:dddd::42".parse().unwrap();
        handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        dad_rx.recv().await.unwrap();

        {
            let mut registry = state.dua_registry.lock().await;
            registry.resolve_dad(&dua, false);
        }

        let response =
            handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        let tlvs = tlv::parse(&response.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::Success.as_u8());
        assert!(dad_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn post_dad_refresh_republishes_dua_cleared() {
        let (state, mut dad_rx) = test_state(BbrRole::Primary).await;
        let handler = DuaRegistrationHandler::new(state.clone());
        let dua: Ipv6Addr = "fd00:dddd::42".parse().unwrap();
        handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        dad_rx.recv().await.unwrap();
        state.dua_registry.lock().await.resolve_dad(&dua, false);

        let mut events = state.events.subscribe();
        handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, crate::events::BackboneEvent::DuaCleared(cleared) if cleared == dua));
    }

    #[tokio::test]
    async fn test_mode_override_forces_status_and_is_one_shot() {
        let (state, mut dad_rx) = test_state(BbrRole::Primary).await;
        let handler = DuaRegistrationHandler::new(state.clone());
        let dua: Ipv6Addr = "fd00:dddd::55".parse().unwrap();

        state.config.set_internal("dua_next_status", ConfigValue::Int(RegStatus::Duplicate.as_u8() as i64)).await.unwrap();
        state.config.set_internal("dua_next_status_eid", ConfigValue::Str(dua.to_string())).await.unwrap();

        let forced = handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        let tlvs = tlv::parse(&forced.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::Duplicate.as_u8());
        assert!(dad_rx.try_recv().is_err());
        assert!(state.dua_registry.lock().await.get(&dua).is_none());

        assert!(state.config.get_int("dua_next_status").await.is_none());

        let real = handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        let tlvs = tlv::parse(&real.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::Success.as_u8());
    }

    #[tokio::test]
    async fn test_mode_override_ignored_for_non_matching_eid() {
        let (state, _dad_rx) = test_state(BbrRole::Primary).await;
        let handler = DuaRegistrationHandler::new(state.clone());
        let dua: Ipv6Addr = "fd00:dddd::66".parse().unwrap();
        let other: Ipv6Addr = "fd00:dddd::77".parse().unwrap();

        state.config.set_internal("dua_next_status", ConfigValue::Int(RegStatus::Duplicate.as_u8() as i64)).await.unwrap();
        state.config.set_internal("dua_next_status_eid", ConfigValue::Str(other.to_string())).await.unwrap();

        let response = handler.handle(&request(dua, [9; 8], 0x3000), "127.0.0.1:1".parse().unwrap()).await.unwrap();
        let tlvs = tlv::parse(&response.payload).unwrap();
        let status = tlv::find(&tlvs, TlvType::Status).unwrap().as_u8().unwrap();
        assert_eq!(status, RegStatus::Success.as_u8());
        assert!(state.config.get_int("dua_next_status").await.is_some());
    }
}
