//! Shared handles every CoAP resource, the DAD scheduler, and the
//! NCP/syslog tasks reach into. One `Arc<BbrState>` is cloned into
//! each task at startup; nothing here owns a socket directly.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;

use bbr_core::config::ConfigStore;
use bbr_core::ports::{NcpCommander, PacketFilter};
use bbr_core::registry::{DuaRegistry, MlrRegistry};
use bbr_core::role::BbrRole;
use bbr_core::time::Clock;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::coap::CoapClient;
use crate::events::EventBus;
use crate::nd_proxy::DuaNeighborPort;

/// Request to run DAD for a freshly-registered DUA.
#[derive(Debug, Clone, Copy)]
pub struct DadRequest {
    pub dua: Ipv6Addr,
    pub rloc16: u16,
}

/// What a peer BBR last told us it knows about a DUA, via a Backbone
/// Answer or a Proactive Backbone Notification. Consulted by the DAD
/// scheduler before it commits to a slow neighbor-discovery probe.
#[derive(Debug, Clone, Copy)]
pub struct RemoteDuaInfo {
    pub ml_eid: [u8; 8],
    pub learned_at: i64,
}

pub struct BbrState {
    pub config: Arc<ConfigStore>,
    pub clock: Arc<dyn Clock>,
    pub packet_filter: Arc<dyn PacketFilter>,
    pub ncp: Arc<dyn NcpCommander>,
    pub coap_client: Arc<CoapClient>,

    pub dua_registry: Mutex<DuaRegistry>,
    pub mlr_registry: Mutex<MlrRegistry>,
    pub remote_dua_cache: Mutex<HashMap<Ipv6Addr, RemoteDuaInfo>>,
    pub role: RwLock<BbrRole>,

    pub mesh_local_prefix: Ipv6Addr,
    pub domain_prefix: RwLock<Ipv6Addr>,
    /// Our own RLOC16, so a relayed `/a/aq` answer naming it can be told
    /// apart from one naming some other router. `0` until the NCP
    /// reports an address to derive it from.
    pub own_rloc16: RwLock<u16>,

    pub dad_tx: mpsc::Sender<DadRequest>,
    pub events: Arc<EventBus>,
    pub dua_neighbors: Arc<dyn DuaNeighborPort>,
}

impl BbrState {
    pub async fn current_role(&self) -> BbrRole {
        *self.role.read().await
    }

    pub async fn require_primary(&self) -> bbr_core::error::Result<()> {
        if self.current_role().await.is_primary() {
            Ok(())
        } else {
            Err(bbr_core::error::BbrError::NotPrimary)
        }
    }
}
