//! Connection bootstrap of the client.
//!
//! [`ClientSettings`] says where the chat server lives. [`Client`] owns the
//! user command surface, opens the server connection and runs two engines
//! over it: the relay reading server lines on a pooled task, and the named
//! console shell reading user input until `exit`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use shared::{CommandError, Config, ConfigError, Engine, LineSink, ServeExit};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::net::TcpStream;

use crate::input::UserCommands;
use crate::relay::ServerRelay;

/// Where the chat server lives and which local ports this client uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_host: String,
    pub server_tcp_port: u16,
    pub server_udp_port: u16,
    /// Default port of the peer listener when `register` names only a host.
    pub tcp_port: u16,
    /// Local port for discovery queries, `0` for ephemeral.
    pub udp_port: u16,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            server_host: config.get_string("chatserver.host")?.to_string(),
            server_tcp_port: config.get_int("chatserver.tcp.port")?,
            server_udp_port: config.get_int("chatserver.udp.port")?,
            tcp_port: optional_port(config, "tcp.port")?,
            udp_port: optional_port(config, "udp.port")?,
        })
    }
}

fn optional_port(config: &Config, key: &str) -> Result<u16, ConfigError> {
    if config.contains_key(key) {
        config.get_int(key)
    } else {
        Ok(0)
    }
}

/// First address `host` resolves to.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host} did not resolve to any address"),
            )
        })
}

/// A chat client: the user shell plus the relay reading the server socket.
pub struct Client {
    name: String,
    commands: Arc<UserCommands>,
}

impl Client {
    /// The server socket stays detached until [`Client::connect`].
    pub fn new(name: &str, settings: ClientSettings, console: LineSink) -> Self {
        Self {
            name: name.to_string(),
            commands: Arc::new(UserCommands::new(
                settings,
                LineSink::disconnected(),
                console,
            )),
        }
    }

    pub fn commands(&self) -> &Arc<UserCommands> {
        &self.commands
    }

    /// Connects to the chat server and starts relaying its lines to the
    /// console.
    pub async fn connect(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        let settings = self.commands.settings();
        let addr = resolve(&settings.server_host, settings.server_tcp_port).await?;
        info!("Connecting to chat server at {}", addr);

        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        self.commands.server().attach(writer).await;

        let relay = Arc::new(ServerRelay::new(
            self.commands.inbox().clone(),
            Arc::clone(self.commands.courier()),
        ));
        let engine = relay.engine(
            self.commands.console().clone(),
            self.commands.relay_handle(),
        )?;

        let console = self.commands.console().clone();
        self.commands.pool().spawn(async move {
            match engine.serve(BufReader::new(reader)).await {
                Ok(ServeExit::EndOfStream) => {
                    warn!("Chat server closed the connection");
                    let _ = console.write_line("Connection to chat server lost").await;
                }
                Ok(ServeExit::Closed) => debug!("Relay closed"),
                Err(e) => warn!("Reading from chat server failed: {}", e),
            }
        });

        Ok(addr)
    }

    /// User shell echoing under the client's name, stopped by `exit`.
    pub fn console_engine(&self) -> Result<Engine, CommandError> {
        let mut engine = Engine::new(self.commands.console().clone())
            .named(self.name.as_str())
            .with_close_handle(self.commands.shutdown_handle());
        engine.register(Arc::clone(&self.commands))?;
        Ok(engine)
    }

    /// Serves user input until end of stream or `exit`, then shuts down.
    pub async fn run<R>(&self, input: R) -> Result<ServeExit, Box<dyn std::error::Error>>
    where
        R: AsyncBufRead + Unpin,
    {
        let engine = self.console_engine()?;
        let exit = engine.serve(input).await?;
        self.shutdown().await;
        Ok(exit)
    }

    pub async fn shutdown(&self) -> bool {
        self.commands.exit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Transcript;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings(port: u16) -> ClientSettings {
        ClientSettings {
            server_host: "127.0.0.1".to_string(),
            server_tcp_port: port,
            server_udp_port: port,
            tcp_port: 0,
            udp_port: 0,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::from_pairs([
            ("chatserver.host", "localhost"),
            ("chatserver.tcp.port", "13460"),
            ("chatserver.udp.port", "13461"),
            ("tcp.port", "13470"),
        ]);
        let settings = ClientSettings::from_config(&config).unwrap();

        assert_eq!(settings.server_host, "localhost");
        assert_eq!(settings.server_tcp_port, 13460);
        assert_eq!(settings.server_udp_port, 13461);
        assert_eq!(settings.tcp_port, 13470);
        assert_eq!(settings.udp_port, 0);

        let missing = Config::from_pairs([("chatserver.host", "localhost")]);
        assert!(ClientSettings::from_config(&missing).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = Client::new("client", settings(port), Transcript::new().sink());
        assert!(client.connect().await.is_err());
        assert!(!client.commands().server().is_connected().await);
    }

    #[tokio::test]
    async fn test_relay_and_forwarding_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let console = Transcript::new();
        let client = Client::new("client", settings(port), console.sink());

        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        let (stream, _) = accepted.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut from_client = BufReader::new(reader).lines();

        let engine = client.console_engine().unwrap();
        engine.dispatch("login alice 12345").await;
        assert_eq!(
            from_client.next_line().await.unwrap().as_deref(),
            Some("!login alice 12345")
        );

        writer.write_all(b"Successfully logged in.\n").await.unwrap();
        writer.write_all(b"!send bob hello\n").await.unwrap();

        for _ in 0..100 {
            if console.lines().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(console.lines(), vec!["Successfully logged in.", "bob: hello"]);
        assert_eq!(
            client.commands().inbox().last().as_deref(),
            Some("bob: hello")
        );

        assert!(client.shutdown().await);
        assert_eq!(from_client.next_line().await.unwrap(), None);
    }
}
