//! CoAP resource server: one UDP socket, a handful of registered
//! resources dispatched by Uri-Path. Supports being rebound to a new
//! local address when the backbone interface bounces, without the
//! caller having to re-register resources.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};

use super::message::{CoapCode, CoapMessage, CoapType};

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Handle one request, returning the response payload/code to send
    /// back (ignored for NON requests the handler chooses not to ack).
    async fn handle(&self, request: &CoapMessage, from: SocketAddr) -> anyhow::Result<CoapResponse>;
}

pub struct CoapResponse {
    pub code: CoapCode,
    pub payload: Vec<u8>,
}

impl CoapResponse {
    pub fn new(code: CoapCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn empty(code: CoapCode) -> Self {
        Self { code, payload: Vec::new() }
    }
}

pub struct CoapServer {
    socket: RwLock<Arc<UdpSocket>>,
    handlers: HashMap<String, Arc<dyn ResourceHandler>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CoapServer {
    pub async fn bind(local: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local).await.with_context(|| format!("binding CoAP server on {local}"))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self { socket: RwLock::new(Arc::new(socket)), handlers: HashMap::new(), shutdown_tx })
    }

    pub fn register(&mut self, path: &str, handler: Arc<dyn ResourceHandler>) {
        self.handlers.insert(path.to_string(), handler);
    }

    /// Rebind the listening socket in place, e.g. after the backbone
    /// interface has been re-created. Already-registered resources are
    /// untouched.
    pub async fn rebind(&self, local: SocketAddr) -> anyhow::Result<()> {
        let socket =
            UdpSocket::bind(local).await.with_context(|| format!("rebinding CoAP server on {local}"))?;
        *self.socket.write().await = Arc::new(socket);
        tracing::info!(%local, "CoAP server rebound");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub async fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.read().await.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = [0u8; 1280];
        loop {
            let socket = self.socket.read().await.clone();
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    let (n, from) = result.context("receiving CoAP datagram")?;
                    if let Err(e) = self.dispatch(&socket, &buf[..n], from).await {
                        tracing::warn!(error = %e, %from, "CoAP request handling failed");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, socket: &UdpSocket, data: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        let request = match CoapMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, %from, "dropping malformed CoAP datagram");
                return Ok(());
            }
        };
        let path = request.uri_path();
        let Some(handler) = self.handlers.get(path.as_str()) else {
            if matches!(request.msg_type, CoapType::Confirmable) {
                let response = not_found_response(&request);
                socket.send_to(&response.encode(), from).await?;
            }
            return Ok(());
        };

        let outcome = handler.handle(&request, from).await;
        if !matches!(request.msg_type, CoapType::Confirmable) {
            if let Err(e) = outcome {
                tracing::debug!(error = %e, %path, "NON request handler returned an error");
            }
            return Ok(());
        }

        let response_msg = match outcome {
            Ok(response) => CoapMessage {
                msg_type: CoapType::Acknowledgement,
                code: response.code,
                message_id: request.message_id,
                token: request.token.clone(),
                options: Vec::new(),
                payload: response.payload,
            },
            Err(e) => {
                tracing::warn!(error = %e, %path, "resource handler failed");
                CoapMessage {
                    msg_type: CoapType::Acknowledgement,
                    code: CoapCode::INTERNAL_SERVER_ERROR,
                    message_id: request.message_id,
                    token: request.token.clone(),
                    options: Vec::new(),
                    payload: Vec::new(),
                }
            }
        };
        socket.send_to(&response_msg.encode(), from).await?;
        Ok(())
    }
}

fn not_found_response(request: &CoapMessage) -> CoapMessage {
    CoapMessage {
        msg_type: CoapType::Acknowledgement,
        code: CoapCode::NOT_FOUND,
        message_id: request.message_id,
        token: request.token.clone(),
        options: Vec::new(),
        payload: Vec::new(),
    }
}
