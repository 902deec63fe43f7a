//! Line-protocol command issuer for the Network Co-Processor: role,
//! channel, dataset and service management over a serial/CLI
//! transport. One command in flight at a time, each confirmed by the
//! `Done` terminator before the next is sent.

use std::net::Ipv6Addr;
use std::sync::Arc;

use async_trait::async_trait;
use bbr_core::error::{BbrError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use bbr_core::ports::NcpCommander;

/// Abstraction over the byte transport carrying NCP line commands —
/// a serial port in production, an in-memory pipe in tests.
#[async_trait]
pub trait NcpTransport: Send + Sync {
    async fn write_line(&self, line: &str) -> std::io::Result<()>;
    async fn read_line(&self) -> std::io::Result<String>;
}

pub struct SerialNcpCommander<T: NcpTransport> {
    transport: Mutex<T>,
}

impl<T: NcpTransport> SerialNcpCommander<T> {
    pub fn new(transport: T) -> Self {
        Self { transport: Mutex::new(transport) }
    }

    async fn issue(&self, command: &str) -> Result<String> {
        let transport = self.transport.lock().await;
        transport
            .write_line(command)
            .await
            .map_err(|e| BbrError::Transport(format!("writing NCP command {command:?}: {e}")))?;
        let mut output = String::new();
        loop {
            let line = transport
                .read_line()
                .await
                .map_err(|e| BbrError::Transport(format!("reading NCP reply to {command:?}: {e}")))?;
            if line == "Done" {
                return Ok(output);
            }
            if line.starts_with("Error") {
                return Err(BbrError::Transport(format!("NCP rejected {command:?}: {line}")));
            }
            output.push_str(&line);
            output.push('\n');
        }
    }
}

#[async_trait]
impl<T: NcpTransport> NcpCommander for SerialNcpCommander<T> {
    async fn set_mesh_local_prefix(&self, prefix: Ipv6Addr) -> Result<()> {
        self.issue(&format!("dataset meshlocalprefix {prefix}")).await?;
        Ok(())
    }

    async fn set_domain_prefix(&self, prefix: Ipv6Addr) -> Result<()> {
        self.issue(&format!("domainprefix set {prefix}/64")).await?;
        Ok(())
    }

    async fn add_service(&self, enterprise_number: u32, service_data: &[u8], server_data: &[u8]) -> Result<()> {
        self.issue(&format!(
            "service add {} {} {}",
            enterprise_number,
            hex(service_data),
            hex(server_data)
        ))
        .await?;
        self.issue("netdata register").await?;
        Ok(())
    }

    async fn remove_service(&self, enterprise_number: u32, service_data: &[u8]) -> Result<()> {
        self.issue(&format!("service remove {} {}", enterprise_number, hex(service_data))).await?;
        self.issue("netdata register").await?;
        Ok(())
    }

    async fn border_router_enable(&self) -> Result<()> {
        self.issue("bbr enable").await?;
        Ok(())
    }

    async fn interface_up(&self, up: bool) -> Result<()> {
        self.issue(if up { "ifconfig up" } else { "ifconfig down" }).await?;
        Ok(())
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// An `NcpCommander` that accepts and silently drops every command,
/// used by tests and by the CLI's `--clear` mode where no NCP is
/// actually attached.
pub struct NullNcpCommander;

#[async_trait]
impl NcpCommander for NullNcpCommander {
    async fn set_mesh_local_prefix(&self, _prefix: Ipv6Addr) -> Result<()> {
        Ok(())
    }

    async fn set_domain_prefix(&self, _prefix: Ipv6Addr) -> Result<()> {
        Ok(())
    }

    async fn add_service(&self, _enterprise_number: u32, _service_data: &[u8], _server_data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn remove_service(&self, _enterprise_number: u32, _service_data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn border_router_enable(&self) -> Result<()> {
        Ok(())
    }

    async fn interface_up(&self, _up: bool) -> Result<()> {
        Ok(())
    }
}

/// `NcpTransport` over a pair of pipes/stdio handles, used when the
/// NCP is reached through a spawned shell process rather than a raw
/// serial device.
pub struct PipeTransport<R, W> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
}

impl<R: tokio::io::AsyncRead + Unpin + Send, W: tokio::io::AsyncWrite + Unpin + Send> PipeTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader: Mutex::new(BufReader::new(reader)), writer: Mutex::new(writer) }
    }
}

#[async_trait]
impl<R, W> NcpTransport for PipeTransport<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    async fn read_line(&self) -> std::io::Result<String> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(line.trim_end().to_string())
    }
}

pub fn arc_null() -> Arc<dyn NcpCommander> {
    Arc::new(NullNcpCommander)
}
