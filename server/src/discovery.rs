//! UDP discovery responder.
//!
//! Any datagram whose text is `!list` is answered, to its source address, with
//! the newline-terminated names of the users currently online. Everything
//! else is dropped without a reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use shared::protocol::{LIST_QUERY, UDP_BUFFER_SIZE};
use shared::{CloseHandle, WorkerPool};
use tokio::net::UdpSocket;

use crate::client_manager::ClientManager;

pub struct DiscoveryResponder {
    socket: Arc<UdpSocket>,
    clients: Arc<ClientManager>,
    pool: WorkerPool,
}

impl DiscoveryResponder {
    pub fn new(socket: UdpSocket, clients: Arc<ClientManager>, pool: WorkerPool) -> Self {
        Self {
            socket: Arc::new(socket),
            clients,
            pool,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until `shutdown` closes. Each datagram is answered
    /// on its own pooled task.
    pub async fn run(self, shutdown: CloseHandle) {
        let mut buffer = [0u8; UDP_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buffer) => received,
                _ = shutdown.closed() => break,
            };

            match received {
                Ok((len, addr)) => {
                    let payload = String::from_utf8_lossy(&buffer[..len]).into_owned();
                    let socket = Arc::clone(&self.socket);
                    let clients = Arc::clone(&self.clients);

                    self.pool.spawn(async move {
                        if let Err(e) = respond(&socket, &clients, &payload, addr).await {
                            warn!("Failed to answer discovery query from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    if shutdown.is_closed() {
                        break;
                    }
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        info!("Discovery responder stopped");
    }
}

pub fn is_list_query(payload: &str) -> bool {
    payload.trim_matches(|c: char| c.is_whitespace() || c == '\0') == LIST_QUERY
}

/// Answers one datagram. Returns whether a reply was sent.
pub async fn respond(
    socket: &UdpSocket,
    clients: &ClientManager,
    payload: &str,
    addr: SocketAddr,
) -> std::io::Result<bool> {
    if !is_list_query(payload) {
        debug!("Ignoring datagram from {}: {:?}", addr, payload);
        return Ok(false);
    }

    let listing = clients.online_listing();
    socket.send_to(listing.as_bytes(), addr).await?;
    debug!("Sent online listing to {}", addr);
    Ok(true)
}
