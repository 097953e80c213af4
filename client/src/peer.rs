//! Direct client-to-client transport.
//!
//! A peer exchange is one request line (`<sender>: <message>`) answered by one
//! [`ACK`] line, after which the connection is closed.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, info, warn};
use shared::protocol::ACK;
use shared::{CloseHandle, LineSink, WorkerPool};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::relay::Inbox;

/// Accept loop for inbound direct messages. Dropping it stops accepting.
#[derive(Debug)]
pub struct PeerListener {
    local_addr: SocketAddr,
    close: CloseHandle,
}

impl PeerListener {
    pub async fn bind(
        host: &str,
        port: u16,
        inbox: Inbox,
        console: LineSink,
        pool: WorkerPool,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let close = CloseHandle::new();
        info!("Listening for private messages on {}", local_addr);

        tokio::spawn(accept_loop(listener, inbox, console, pool, close.clone()));
        Ok(Self { local_addr, close })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        if self.close.close() {
            debug!("Peer listener on {} closed", self.local_addr);
        }
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: Inbox,
    console: LineSink,
    pool: WorkerPool,
    close: CloseHandle,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = close.closed() => break,
        };

        match accepted {
            Ok((stream, addr)) => {
                let inbox = inbox.clone();
                let console = console.clone();
                let spawned = pool.spawn(async move {
                    if let Err(e) = exchange(stream, &inbox, &console).await {
                        warn!("Private message from {} failed: {}", addr, e);
                        let _ = console.write_line("Could not read the private message").await;
                    }
                });
                if !spawned {
                    break;
                }
            }
            Err(e) => {
                error!("Error accepting private connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Serves one inbound exchange: reads the message, records and displays it,
/// then acknowledges. Returns the message, or `None` if the peer sent nothing.
pub async fn exchange<S>(
    stream: S,
    inbox: &Inbox,
    console: &LineSink,
) -> io::Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    let Some(message) = lines.next_line().await? else {
        return Ok(None);
    };

    inbox.record(&message);
    if let Err(e) = console.write_line(&message).await {
        warn!("Failed to display private message: {}", e);
    }

    writer.write_all(format!("{ACK}\n").as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(Some(message))
}

/// Sends one line to `address` and returns the peer's trimmed reply.
pub async fn send_direct(address: &str, line: &str) -> io::Result<String> {
    let stream = TcpStream::connect(address).await?;
    let (reader, mut writer) = stream.into_split();

    writer.write_all(format!("{line}\n").as_bytes()).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(reply) => Ok(reply.trim().to_string()),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection without replying",
        )),
    }
}
