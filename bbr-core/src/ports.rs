//! Port traits the engine depends on and the binary crate implements
//! against real sockets, `iptables`, and the NCP line protocol. Keeping
//! these here lets registry/role logic be exercised with fakes without
//! pulling raw sockets into this crate.

use std::net::Ipv6Addr;

use async_trait::async_trait;

use crate::error::Result;

/// Admits or denies specific backbone traffic classes. Implementations
/// are expected to be idempotent: calling `allow_dua` twice for the
/// same address must not error or duplicate a rule.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    async fn allow_dua(&self, dua: Ipv6Addr) -> Result<()>;
    async fn deny_dua(&self, dua: Ipv6Addr) -> Result<()>;
    async fn allow_multicast_group(&self, group: Ipv6Addr) -> Result<()>;
    async fn deny_multicast_group(&self, group: Ipv6Addr) -> Result<()>;
}

/// Issues line-protocol commands to the Network Co-Processor (role,
/// channel, dataset changes, border-router-enable, and so on).
#[async_trait]
pub trait NcpCommander: Send + Sync {
    async fn set_mesh_local_prefix(&self, prefix: Ipv6Addr) -> Result<()>;
    async fn set_domain_prefix(&self, prefix: Ipv6Addr) -> Result<()>;
    async fn add_service(&self, enterprise_number: u32, service_data: &[u8], server_data: &[u8]) -> Result<()>;
    async fn remove_service(&self, enterprise_number: u32, service_data: &[u8]) -> Result<()>;
    async fn border_router_enable(&self) -> Result<()>;
    async fn interface_up(&self, up: bool) -> Result<()>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPacketFilter {
        pub allowed_duas: Mutex<Vec<Ipv6Addr>>,
        pub allowed_groups: Mutex<Vec<Ipv6Addr>>,
    }

    #[async_trait]
    impl PacketFilter for RecordingPacketFilter {
        async fn allow_dua(&self, dua: Ipv6Addr) -> Result<()> {
            self.allowed_duas.lock().unwrap().push(dua);
            Ok(())
        }

        async fn deny_dua(&self, dua: Ipv6Addr) -> Result<()> {
            self.allowed_duas.lock().unwrap().retain(|d| *d != dua);
            Ok(())
        }

        async fn allow_multicast_group(&self, group: Ipv6Addr) -> Result<()> {
            self.allowed_groups.lock().unwrap().push(group);
            Ok(())
        }

        async fn deny_multicast_group(&self, group: Ipv6Addr) -> Result<()> {
            self.allowed_groups.lock().unwrap().retain(|g| *g != group);
            Ok(())
        }
    }

    #[tokio::test]
    async fn recording_filter_tracks_allow_deny() {
        let filter = RecordingPacketFilter::default();
        let dua: Ipv6Addr = "fd00::1".parse().unwrap();
        filter.allow_dua(dua).await.unwrap();
        assert_eq!(filter.allowed_duas.lock().unwrap().as_slice(), &[dua]);
        filter.deny_dua(dua).await.unwrap();
        assert!(filter.allowed_duas.lock().unwrap().is_empty());
    }
}
