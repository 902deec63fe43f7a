//! `ip6tables`-backed packet filter. Every invocation runs as its own
//! process and is logged at debug before it runs — the one adapter in
//! this engine allowed to shell out, since there is no `ip6tables`
//! crate and the tool itself is the stable interface, not its C API.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use bbr_core::error::{BbrError, Result};
use bbr_core::ports::PacketFilter;
use tokio::process::Command;

pub struct IpTablesFilter {
    chain: String,
    backbone_interface: String,
}

impl IpTablesFilter {
    pub fn new(chain: impl Into<String>, backbone_interface: impl Into<String>) -> Self {
        Self { chain: chain.into(), backbone_interface: backbone_interface.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        tracing::debug!(args = ?args, "ip6tables");
        let status = Command::new("ip6tables")
            .args(args)
            .status()
            .await
            .map_err(|e| BbrError::Transport(format!("spawning ip6tables: {e}")))?;
        if !status.success() {
            return Err(BbrError::Transport(format!("ip6tables {args:?} exited with {status}")));
        }
        Ok(())
    }

    async fn add_rule(&self, dest: &str) -> Result<()> {
        self.run(&["-A", &self.chain, "-i", &self.backbone_interface, "-d", dest, "-j", "ACCEPT"]).await
    }

    async fn remove_rule(&self, dest: &str) -> Result<()> {
        // -D is safe to call on a rule that no longer exists in
        // practice (ip6tables exits non-zero, which we propagate) —
        // callers only remove entries they know they added.
        self.run(&["-D", &self.chain, "-i", &self.backbone_interface, "-d", dest, "-j", "ACCEPT"]).await
    }
}

#[async_trait]
impl PacketFilter for IpTablesFilter {
    async fn allow_dua(&self, dua: Ipv6Addr) -> Result<()> {
        self.add_rule(&format!("{dua}/128")).await
    }

    async fn deny_dua(&self, dua: Ipv6Addr) -> Result<()> {
        self.remove_rule(&format!("{dua}/128")).await
    }

    async fn allow_multicast_group(&self, group: Ipv6Addr) -> Result<()> {
        self.add_rule(&format!("{group}/128")).await
    }

    async fn deny_multicast_group(&self, group: Ipv6Addr) -> Result<()> {
        self.remove_rule(&format!("{group}/128")).await
    }
}
