//! Duplicate Address Detection for newly registered DUAs.
//!
//! Registration is acknowledged to the interior router immediately
//! (see `/n/dr`); DAD runs afterward on the backbone using the Thread
//! Backbone Query mechanism: a non-confirmable `/b/bq` carrying the
//! candidate DUA is sent to All Domain BBRs, repeated `DUA_DAD_REPEAT`
//! times spaced by a query timeout. A Backbone Answer whose ML-EID
//! differs from ours (observed in `b_ba.rs`, which flags the registry
//! entry `pending_delete`) means someone else already holds the DUA;
//! silence for the whole window means it is free to use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bbr_core::role::all_domain_bbrs;
use bbr_core::tlv::{self, TlvType};
use tokio::sync::mpsc;

use crate::events::BackboneEvent;
use crate::state::{BbrState, DadRequest};

/// Number of `/b/bq` queries sent before DAD concludes clean with no
/// answer naming a conflicting ML-EID.
const DUA_DAD_REPEAT: u32 = 3;

pub struct DadScheduler {
    state: Arc<BbrState>,
    query_timeout: Duration,
}

impl DadScheduler {
    pub fn new(state: Arc<BbrState>, query_timeout: Duration) -> Self {
        Self { state, query_timeout }
    }

    pub async fn run(&self, mut requests: mpsc::Receiver<DadRequest>) {
        while let Some(request) = requests.recv().await {
            if let Err(e) = self.run_one(request).await {
                tracing::warn!(dua = %request.dua, error = %e, "DAD probe failed");
            }
        }
    }

    async fn run_one(&self, request: DadRequest) -> anyhow::Result<()> {
        for _ in 0..DUA_DAD_REPEAT {
            self.send_backbone_query(request.dua).await;
            tokio::time::sleep(self.query_timeout).await;
            if self.is_pending_delete(request.dua).await {
                break;
            }
        }

        let collision = self.is_pending_delete(request.dua).await;
        let status = self.state.dua_registry.lock().await.resolve_dad(&request.dua, collision);
        if collision {
            self.state.packet_filter.deny_dua(request.dua).await?;
            self.notify_registrant(request, status).await;
            tracing::info!(dua = %request.dua, "DAD collision, DUA retracted");
        } else {
            tracing::debug!(dua = %request.dua, "DAD cleared");
            self.state.dua_neighbors.commit(request.dua, self.state.clock.now()).await;
            self.state.events.publish(BackboneEvent::DuaCleared(request.dua));
        }
        Ok(())
    }

    async fn is_pending_delete(&self, dua: std::net::Ipv6Addr) -> bool {
        self.state.dua_registry.lock().await.get(&dua).map(|e| e.pending_delete).unwrap_or(false)
    }

    /// Send a non-confirmable Backbone Query for `dua` to All Domain BBRs.
    async fn send_backbone_query(&self, dua: std::net::Ipv6Addr) {
        let payload = tlv::build(TlvType::TargetEid, &dua.octets());
        let domain_prefix = *self.state.domain_prefix.read().await;
        let dest = SocketAddr::new(all_domain_bbrs(&domain_prefix).into(), crate::nd_proxy::COAP_PORT);
        if let Err(e) = self.state.coap_client.send_non(dest, "/b/bq", payload).await {
            tracing::debug!(%dua, error = %e, "failed to send Backbone Query");
        }
    }

    /// Tell the router that registered this DUA that it has been
    /// retracted, by the same resource it would use to report an
    /// address error against its own mesh. Carries the colliding
    /// ML-EID observed during the query window when one was cached.
    async fn notify_registrant(&self, request: DadRequest, status: bbr_core::status::RegStatus) {
        let mut parts = vec![
            tlv::build(TlvType::TargetEid, &request.dua.octets()),
            tlv::build(TlvType::Status, &[status.as_u8()]),
        ];
        if let Some(info) = self.state.remote_dua_cache.lock().await.get(&request.dua) {
            parts.push(tlv::build(TlvType::MlEid, &info.ml_eid));
        }
        let payload = tlv::concat(&parts);
        let dest = crate::nd_proxy::rloc16_to_backbone_addr(&self.state.mesh_local_prefix, request.rloc16);
        if let Err(e) = self.state.coap_client.send_non(dest, "/a/ae", payload).await {
            tracing::warn!(error = %e, rloc16 = request.rloc16, "failed to notify registrant of DAD collision");
        }
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
    use std::net::Ipv6Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Mutex, RwLock};

    use crate::coap::CoapClient;
    use crate::ncp::commander::NullNcpCommander;

    async fn test_state() -> Arc<BbrState> {
        let (dad_tx, _rx) = mpsc::channel(8);
        let client = CoapClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        Arc::new(BbrState {
            config: Arc::new(ConfigStore::new(ConfigSchema::new(), None)),
            clock: Arc::new(TestClock::new(1000)),
            packet_filter: Arc::new(RecordingPacketFilter::default()),
            ncp: Arc::new(NullNcpCommander),
            coap_client: Arc::new(client),
            dua_registry: Mutex::new(Default::default()),
            mlr_registry: Mutex::new(Default::default()),
            remote_dua_cache: Mutex::new(HashMap::new()),
            role: RwLock::new(BbrRole::Primary),
            mesh_local_prefix: "fd00:1111::".parse().unwrap(),
            domain_prefix: RwLock::new("fd00:dddd::".parse().unwrap()),
            own_rloc16: RwLock::new(0),
            dad_tx,
            events: Arc::new(crate::events::EventBus::new(8)),
            dua_neighbors: Arc::new(crate::nd_proxy::NullDuaNeighborPort),
        })
    }

    #[tokio::test]
    async fn silent_window_clears_dad_flag() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::3".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 1000);

        let scheduler = DadScheduler::new(state.clone(), Duration::from_millis(1));
        scheduler.run_one(DadRequest { dua, rloc16: 0x1000 }).await.unwrap();

        let entry = state.dua_registry.lock().await.get(&dua).cloned().unwrap();
        assert!(!entry.dad_in_progress);
    }

    #[tokio::test]
    async fn silent_window_publishes_dua_cleared_event() {
        let state = test_state().await;
        let mut events = state.events.subscribe();
        let dua: Ipv6Addr = "fd00:dddd::3".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 1000);

        let scheduler = DadScheduler::new(state.clone(), Duration::from_millis(1));
        scheduler.run_one(DadRequest { dua, rloc16: 0x1000 }).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, BackboneEvent::DuaCleared(cleared) if cleared == dua));
    }

    #[tokio::test]
    async fn pending_delete_retracts_dua() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::3".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 1000);
        state.packet_filter.allow_dua(dua).await.unwrap();
        state.dua_registry.lock().await.mark_pending_delete(&dua);

        let scheduler = DadScheduler::new(state.clone(), Duration::from_millis(1));
        scheduler.run_one(DadRequest { dua, rloc16: 0x1000 }).await.unwrap();

        assert!(state.dua_registry.lock().await.get(&dua).is_none());
    }

    #[tokio::test]
    async fn collision_with_cached_remote_ml_eid_still_retracts() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::3".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [1; 8], 0x1000, 1000);
        state.packet_filter.allow_dua(dua).await.unwrap();
        state.dua_registry.lock().await.mark_pending_delete(&dua);
        state
            .remote_dua_cache
            .lock()
            .await
            .insert(dua, crate::state::RemoteDuaInfo { ml_eid: [9; 8], learned_at: 1000 });

        let scheduler = DadScheduler::new(state.clone(), Duration::from_millis(1));
        scheduler.run_one(DadRequest { dua, rloc16: 0x1000 }).await.unwrap();

        assert!(state.dua_registry.lock().await.get(&dua).is_none());
    }

    #[tokio::test]
    async fn run_processes_requests_until_channel_closes() {
        let state = test_state().await;
        let dua: Ipv6Addr = "fd00:dddd::9".parse().unwrap();
        state.dua_registry.lock().await.register(dua, [2; 8], 0x2000, 1000);

        let (tx, rx) = mpsc::channel(1);
        let scheduler = DadScheduler::new(state.clone(), Duration::from_millis(1));
        let processed = Arc::new(AtomicBool::new(false));
        let processed2 = processed.clone();
        let run_handle = tokio::spawn(async move {
            scheduler.run(rx).await;
            processed2.store(true, Ordering::SeqCst);
        });

        tx.send(DadRequest { dua, rloc16: 0x2000 }).await.unwrap();
        drop(tx);
        run_handle.await.unwrap();
        assert!(processed.load(Ordering::SeqCst));
    }
}
