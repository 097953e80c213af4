//! User command surface of the client.
//!
//! The console engine dispatches user input here. Commands the chat server
//! handles are forwarded as wire lines on the server socket; their replies come
//! back through the relay. `list`, `msg` and `lastMsg` are answered locally.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, info};
use shared::engine::{no_reply, reply, Args, CommandHandler, CommandResult, CommandTable};
use shared::protocol::{wire_line, LIST_QUERY, NO_MESSAGE_YET, UDP_BUFFER_SIZE};
use shared::{CloseHandle, CommandError, LineSink, WorkerPool};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;

use crate::messenger::{Courier, Messenger};
use crate::network::{resolve, ClientSettings};
use crate::peer::PeerListener;
use crate::relay::Inbox;

/// Splits `address` into host and port, falling back to `default_port` when
/// only a host is given.
pub fn split_address(address: &str, default_port: u16) -> (String, u16) {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return (ip.to_string(), default_port);
    }
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        None => (address.to_string(), default_port),
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_address(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

pub struct UserCommands {
    settings: ClientSettings,
    server: LineSink,
    console: LineSink,
    inbox: Inbox,
    courier: Arc<Courier>,
    pool: WorkerPool,
    listener: AsyncMutex<Option<PeerListener>>,
    relay: CloseHandle,
    shutdown: CloseHandle,
}

impl UserCommands {
    /// `server` may still be detached; it is attached once the chat server
    /// connection is up.
    pub fn new(settings: ClientSettings, server: LineSink, console: LineSink) -> Self {
        let pool = WorkerPool::new();
        let courier = Arc::new(Courier::new(
            Arc::new(Messenger::new(server.clone())),
            console.clone(),
            pool.clone(),
        ));
        Self {
            settings,
            server,
            console,
            inbox: Inbox::new(),
            courier,
            pool,
            listener: AsyncMutex::new(None),
            relay: CloseHandle::new(),
            shutdown: CloseHandle::new(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn server(&self) -> &LineSink {
        &self.server
    }

    pub fn console(&self) -> &LineSink {
        &self.console
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        self.courier.messenger()
    }

    pub fn courier(&self) -> &Arc<Courier> {
        &self.courier
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn relay_handle(&self) -> CloseHandle {
        self.relay.clone()
    }

    pub fn shutdown_handle(&self) -> CloseHandle {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_closed()
    }

    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(PeerListener::local_addr)
    }

    async fn forward(&self, command: &str, args: &[&str]) -> CommandResult {
        self.server
            .write_line(&wire_line(command, args))
            .await
            .map_err(|e| {
                CommandError::Failed(format!("Not connected to the chat server: {e}"))
            })?;
        no_reply()
    }

    async fn login(&self, args: &Args) -> CommandResult {
        let username = args.text(0)?;
        self.courier.messenger().set_display_name(username);
        self.forward("login", &[username, args.text(1)?]).await
    }

    /// Binds the peer listener, replacing any previous one, then tells the
    /// server where it can be reached.
    async fn register_peer(&self, args: &Args) -> CommandResult {
        let (host, port) = split_address(args.text(0)?, self.settings.tcp_port);

        let mut slot = self.listener.lock().await;
        if let Some(previous) = slot.take() {
            previous.close();
        }

        let listener = PeerListener::bind(
            &host,
            port,
            self.inbox.clone(),
            self.console.clone(),
            self.pool.clone(),
        )
        .await
        .map_err(|e| {
            let address = join_address(&host, port);
            CommandError::Failed(format!("Could not listen on {address}: {e}"))
        })?;

        let advertised = join_address(&host, listener.local_addr().port());
        *slot = Some(listener);
        drop(slot);

        info!("Registering private address {}", advertised);
        self.forward("register", &[&advertised]).await
    }

    /// One discovery round trip. Waits for the reply without a timeout.
    async fn list(&self) -> CommandResult {
        let server = resolve(&self.settings.server_host, self.settings.server_udp_port).await?;
        let unspecified: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let local = SocketAddr::new(unspecified, self.settings.udp_port);

        let socket = UdpSocket::bind(local).await?;
        socket.send_to(LIST_QUERY.as_bytes(), server).await?;

        let mut buffer = [0u8; UDP_BUFFER_SIZE];
        let (len, from) = socket.recv_from(&mut buffer).await?;
        debug!("Received {} byte listing from {}", len, from);
        reply(String::from_utf8_lossy(&buffer[..len]).into_owned())
    }

    /// Hands the message to the courier; its status reaches the console once
    /// the delivery (or queueing) is done.
    fn msg(&self, args: &Args) -> CommandResult {
        let username = args.text(0)?;
        if !self.courier.msg(username, args.text(1)?) {
            return Err(CommandError::Failed(format!(
                "Could not send message to {username}, the client is shutting down"
            )));
        }
        no_reply()
    }

    fn last_msg(&self) -> CommandResult {
        reply(self.inbox.last().unwrap_or_else(|| NO_MESSAGE_YET.to_string()))
    }

    /// Closes the server connection, the relay and the peer listener, and
    /// cancels pooled work. Only the first call does anything.
    pub async fn exit(&self) -> bool {
        if !self.shutdown.close() {
            return false;
        }

        self.relay.close();
        if let Err(e) = self.server.close().await {
            debug!("Could not close server connection: {}", e);
        }
        if let Some(listener) = self.listener.lock().await.take() {
            listener.close();
        }
        let cancelled = self.pool.shutdown_now();
        info!("Client shut down, cancelled {} tasks", cancelled);
        true
    }
}

impl CommandHandler for UserCommands {
    fn register(self: Arc<Self>, table: &mut CommandTable) -> Result<(), CommandError> {
        let this = Arc::clone(&self);
        table.add("login", &["username", "password"], move |args| {
            let this = Arc::clone(&this);
            async move { this.login(&args).await }
        })?;

        let this = Arc::clone(&self);
        table.add("logout", &[], move |_| {
            let this = Arc::clone(&this);
            async move { this.forward("logout", &[]).await }
        })?;

        let this = Arc::clone(&self);
        table.add("send", &["message"], move |args| {
            let this = Arc::clone(&this);
            async move {
                match args.text(0) {
                    Ok(message) => this.forward("send", &[message]).await,
                    Err(e) => Err(e),
                }
            }
        })?;

        let this = Arc::clone(&self);
        table.add("lookup", &["username"], move |args| {
            let this = Arc::clone(&this);
            async move {
                match args.text(0) {
                    Ok(username) => this.forward("lookup", &[username]).await,
                    Err(e) => Err(e),
                }
            }
        })?;

        let this = Arc::clone(&self);
        table.add("register", &["address"], move |args| {
            let this = Arc::clone(&this);
            async move { this.register_peer(&args).await }
        })?;

        let this = Arc::clone(&self);
        table.add("list", &[], move |_| {
            let this = Arc::clone(&this);
            async move { this.list().await }
        })?;

        let this = Arc::clone(&self);
        table.add("msg", &["username", "message"], move |args| {
            let this = Arc::clone(&this);
            async move { this.msg(&args) }
        })?;

        let this = Arc::clone(&self);
        table.add("lastMsg", &[], move |_| {
            let this = Arc::clone(&this);
            async move { this.last_msg() }
        })?;

        let this = Arc::clone(&self);
        table.add("exit", &[], move |_| {
            let this = Arc::clone(&this);
            async move {
                this.exit().await;
                no_reply()
            }
        })?;

        Ok(())
    }
}
