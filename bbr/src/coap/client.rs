//! Outbound CoAP requests: NON for best-effort signaling (Proactive
//! Backbone Notifications, Backbone Query), CON with a bounded retry
//! for anything that needs a reply (Backbone Answer round trip,
//! interior registration acks).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::message::{CoapCode, CoapMessage, CoapType};

const ACK_TIMEOUT: Duration = Duration::from_millis(2000);
const MAX_RETRANSMIT: u32 = 4;

pub struct CoapClient {
    socket: UdpSocket,
    next_message_id: AtomicU16,
}

impl CoapClient {
    pub async fn bind(local: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(local).await.with_context(|| format!("binding CoAP client socket on {local}"))?;
        Ok(Self { socket, next_message_id: AtomicU16::new(rand::random()) })
    }

    fn next_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire a NON request and forget it; used for PRO_BB.ntf and other
    /// signaling where no response is expected or acted on.
    pub async fn send_non(&self, dest: SocketAddr, path: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let msg = CoapMessage::new_request(CoapType::NonConfirmable, CoapCode::POST, self.next_id(), path)
            .with_token(random_token())
            .with_payload(payload);
        self.socket.send_to(&msg.encode(), dest).await.context("sending NON CoAP request")?;
        Ok(())
    }

    /// Send a CON request and wait for the matching ACK/response,
    /// retrying with a fixed back-off up to [`MAX_RETRANSMIT`] times.
    /// Matching is by message ID since this client only ever has one
    /// request in flight per call.
    pub async fn send_con(&self, dest: SocketAddr, path: &str, payload: Vec<u8>) -> anyhow::Result<CoapMessage> {
        let message_id = self.next_id();
        let msg = CoapMessage::new_request(CoapType::Confirmable, CoapCode::POST, message_id, path)
            .with_token(random_token())
            .with_payload(payload);
        let encoded = msg.encode();

        let mut attempt = 0u32;
        let mut backoff = ACK_TIMEOUT;
        loop {
            self.socket.send_to(&encoded, dest).await.context("sending CON CoAP request")?;
            let mut buf = [0u8; 1280];
            match timeout(backoff, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) if from == dest => {
                    let reply = CoapMessage::decode(&buf[..n])?;
                    if reply.message_id == message_id {
                        return Ok(reply);
                    }
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e).context("reading CoAP response"),
                Err(_) => {
                    attempt += 1;
                    if attempt >= MAX_RETRANSMIT {
                        anyhow::bail!("no CoAP response from {dest} for {path} after {attempt} attempts");
                    }
                    backoff *= 2;
                }
            }
        }
    }

    pub async fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

fn random_token() -> Vec<u8> {
    rand::random::<[u8; 4]>().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_non_does_not_block_on_a_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = CoapClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        client.send_non(server_addr, "/b/bq", vec![1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let msg = CoapMessage::decode(&buf[..n]).unwrap();
        assert_eq!(msg.uri_path(), "/b/bq");
        assert_eq!(msg.payload, vec![1, 2, 3]);
    }
}
