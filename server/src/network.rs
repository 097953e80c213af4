//! Server network layer: TCP accept loop, discovery socket and the operator
//! console commands.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use shared::engine::{no_reply, reply, CommandHandler, CommandTable};
use shared::{
    CloseHandle, CommandError, Config, ConfigError, Engine, LineSink, ServeExit, WorkerPool,
};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::client_manager::ClientManager;
use crate::discovery::DiscoveryResponder;
use crate::session::Connection;

pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            tcp_port: 0,
            udp_port: 0,
        }
    }
}

impl ServerSettings {
    /// Reads `tcp.port`, `udp.port` and the optional `host`.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            host: config.get("host").unwrap_or(DEFAULT_HOST).to_string(),
            tcp_port: config.get_int("tcp.port")?,
            udp_port: config.get_int("udp.port")?,
        })
    }
}

/// Addresses actually bound by [`Server::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub tcp: SocketAddr,
    pub udp: SocketAddr,
}

pub struct Server {
    settings: ServerSettings,
    clients: Arc<ClientManager>,
    pool: WorkerPool,
    shutdown: CloseHandle,
    bound: Mutex<Option<BoundAddrs>>,
}

impl Server {
    pub fn new(settings: ServerSettings, users: Config) -> Self {
        Self {
            settings,
            clients: Arc::new(ClientManager::new(users)),
            pool: WorkerPool::new(),
            shutdown: CloseHandle::new(),
            bound: Mutex::new(None),
        }
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn bound_addrs(&self) -> Option<BoundAddrs> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_closed()
    }

    /// Binds both sockets and spawns the accept and discovery loops.
    pub async fn start(&self) -> std::io::Result<BoundAddrs> {
        let host = self.settings.host.as_str();
        let listener = TcpListener::bind((host, self.settings.tcp_port)).await?;
        let socket = UdpSocket::bind((host, self.settings.udp_port)).await?;

        let responder =
            DiscoveryResponder::new(socket, Arc::clone(&self.clients), self.pool.clone());
        let addrs = BoundAddrs {
            tcp: listener.local_addr()?,
            udp: responder.local_addr()?,
        };
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(addrs);
        info!("Chat server listening on tcp {} and udp {}", addrs.tcp, addrs.udp);

        tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.clients),
            self.pool.clone(),
            self.shutdown.clone(),
        ));
        tokio::spawn(responder.run(self.shutdown.clone()));

        Ok(addrs)
    }

    async fn accept_loop(
        listener: TcpListener,
        clients: Arc<ClientManager>,
        pool: WorkerPool,
        shutdown: CloseHandle,
    ) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.closed() => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if shutdown.is_closed() {
                        break;
                    }
                    let spawned = Self::spawn_connection(stream, addr, &clients, &pool, &shutdown);
                    if let Err(e) = spawned {
                        error!("Failed to set up connection from {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        info!("TCP listener closed");
    }

    /// Builds the session for one socket and serves it on the pool.
    ///
    /// A connection accepted while shutdown is draining the registry may be
    /// registered after the drain; it is closed here instead of lingering.
    fn spawn_connection(
        stream: TcpStream,
        addr: SocketAddr,
        clients: &Arc<ClientManager>,
        pool: &WorkerPool,
        shutdown: &CloseHandle,
    ) -> Result<(), CommandError> {
        let (reader, writer) = stream.into_split();
        let output = LineSink::new(writer);
        let close = CloseHandle::new();
        let connection = Arc::new(Connection::new(
            clients.next_client_id(),
            addr,
            output.clone(),
            close.clone(),
            Arc::clone(clients),
        ));

        let mut engine = Engine::new(output).with_close_handle(close);
        engine.register(Arc::clone(&connection))?;

        let id = connection.id();
        let serving = Arc::clone(&connection);
        let spawned = pool.spawn(async move {
            match engine.serve(BufReader::new(reader)).await {
                Ok(ServeExit::EndOfStream) => info!("Client {} disconnected", id),
                Ok(ServeExit::Closed) => debug!("Client {} closed by server", id),
                Err(e) => warn!("Connection {} failed: {}", id, e),
            }
            serving.close().await;
        });

        if !spawned {
            return Ok(());
        }

        clients.add_client(connection);
        // Shutdown closes its handle before draining, so a late add is seen here
        if shutdown.is_closed() {
            for straggler in clients.drain() {
                debug!("Closing connection {} accepted during shutdown", straggler.id());
                tokio::spawn(async move { straggler.close().await });
            }
            return Ok(());
        }

        info!("Client {} connected from {}", id, addr);
        Ok(())
    }

    /// Closes every connection, stops both listeners and cancels pooled work.
    /// Only the first call does anything.
    pub async fn shutdown(&self) -> bool {
        if !self.shutdown.close() {
            return false;
        }

        info!("Shutting down chat server");
        let connections = self.clients.drain();
        for connection in &connections {
            connection.close().await;
        }
        let cancelled = self.pool.shutdown_now();
        info!(
            "Closed {} connections, cancelled {} tasks",
            connections.len(),
            cancelled
        );
        true
    }

    /// Resolves once shutdown has begun.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.closed().await
    }

    /// Operator shell over `output`, stopped by shutdown.
    pub fn console(
        self: &Arc<Self>,
        name: &str,
        output: LineSink,
    ) -> Result<Engine, CommandError> {
        let mut engine = Engine::new(output)
            .named(name)
            .with_close_handle(self.shutdown.clone());
        engine.register(Arc::clone(self))?;
        Ok(engine)
    }
}

impl CommandHandler for Server {
    fn register(self: Arc<Self>, table: &mut CommandTable) -> Result<(), CommandError> {
        let this = Arc::clone(&self);
        table.add("users", &[], move |_| {
            let this = Arc::clone(&this);
            async move { reply(this.clients.list_users()) }
        })?;

        let this = Arc::clone(&self);
        table.add("exit", &[], move |_| {
            let this = Arc::clone(&this);
            async move {
                this.shutdown().await;
                no_reply()
            }
        })?;

        Ok(())
    }
}
