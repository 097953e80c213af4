//! Per-connection authentication state machine.
//!
//! Every accepted TCP connection owns one [`Connection`], registered as the
//! command handler of that connection's engine. Commands arrive strictly in
//! order on the connection's own task, so the session is only ever mutated by
//! its owner; other connections read it when broadcasting or resolving
//! lookups.
//!
//! ```text
//!   Anonymous --login ok--> Authenticated --logout--> Anonymous
//!        \                        |
//!         +------- close ---------+--> closed
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use shared::engine::{no_reply, reply, Args, CommandHandler, CommandResult, CommandTable};
use shared::protocol::{
    not_registered, register_notification, send_notification, user_not_found,
    ALREADY_LOGGED_IN, LOGIN_FAILED, LOGIN_REQUIRED, LOGIN_SUCCESS, LOGOUT_SUCCESS,
    REGISTER_SUCCESS,
};
use shared::{CloseHandle, CommandError, LineSink};

use crate::client_manager::ClientManager;

/// Authentication state of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticated {
        username: String,
        private_address: Option<String>,
    },
}

impl SessionState {
    pub fn username(&self) -> Option<&str> {
        match self {
            SessionState::Authenticated { username, .. } => Some(username),
            SessionState::Anonymous => None,
        }
    }

    pub fn private_address(&self) -> Option<&str> {
        match self {
            SessionState::Authenticated {
                private_address, ..
            } => private_address.as_deref(),
            SessionState::Anonymous => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}

/// Server side of one client connection.
#[derive(Debug)]
pub struct Connection {
    id: u32,
    peer: SocketAddr,
    state: Mutex<SessionState>,
    output: LineSink,
    close: CloseHandle,
    closed: AtomicBool,
    clients: Arc<ClientManager>,
}

impl Connection {
    /// `output` is the connection's socket writer; `close` stops the
    /// connection's serve loop.
    pub fn new(
        id: u32,
        peer: SocketAddr,
        output: LineSink,
        close: CloseHandle,
        clients: Arc<ClientManager>,
    ) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(SessionState::Anonymous),
            output,
            close,
            closed: AtomicBool::new(false),
            clients,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.session().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.session().username().map(str::to_string)
    }

    pub fn private_address(&self) -> Option<String> {
        self.session().private_address().map(str::to_string)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes an unsolicited line (notification) to this connection.
    pub async fn notify(&self, line: &str) -> std::io::Result<()> {
        self.output.write_line(line).await
    }

    /// Authenticates this connection as `username`.
    ///
    /// The password must match the user's `<username>.password` entry
    /// exactly. A connection that is already logged in stays logged in as
    /// before, whatever credentials are given.
    pub fn login(&self, username: &str, password: &str) -> String {
        let mut session = self.session();
        if session.is_authenticated() {
            return ALREADY_LOGGED_IN.to_string();
        }

        // Unknown user and wrong password are deliberately indistinguishable
        if !self.clients.check_credentials(username, password) {
            info!("Client {} failed to log in as {}", self.id, username);
            return LOGIN_FAILED.to_string();
        }

        *session = SessionState::Authenticated {
            username: username.to_string(),
            private_address: None,
        };
        info!("Client {} logged in as {}", self.id, username);
        LOGIN_SUCCESS.to_string()
    }

    /// Returns the connection to the anonymous state, forgetting the
    /// registered private address along with the username.
    pub fn logout(&self) -> String {
        let mut session = self.session();
        match session.username() {
            Some(username) => {
                info!("Client {} ({}) logged out", self.id, username);
                *session = SessionState::Anonymous;
                LOGOUT_SUCCESS.to_string()
            }
            None => LOGIN_REQUIRED.to_string(),
        }
    }

    /// Relays `message` to every other authenticated connection. Returns a
    /// reply only when the sender is not logged in.
    pub async fn send(&self, message: &str) -> Option<String> {
        let Some(username) = self.username() else {
            return Some(LOGIN_REQUIRED.to_string());
        };

        let line = send_notification(&username, message);
        let mut delivered = 0;
        for other in self.clients.snapshot() {
            if other.id == self.id || other.username().is_none() {
                continue;
            }
            match other.notify(&line).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to relay message to client {}: {}", other.id, e),
            }
        }

        debug!("{} broadcast a message to {} sessions", username, delivered);
        None
    }

    /// Resolves `username` to the private address its session registered.
    ///
    /// On success the reply is a `!register <username> <address>`
    /// notification, which the asking client treats as an address
    /// resolution. Otherwise it says whether the user is not online or has
    /// not registered yet.
    pub fn lookup(&self, username: &str) -> String {
        if !self.session().is_authenticated() {
            return LOGIN_REQUIRED.to_string();
        }

        match self.clients.find_by_username(username) {
            None => user_not_found(username),
            Some(target) => match target.private_address() {
                Some(address) => register_notification(username, &address),
                None => not_registered(username),
            },
        }
    }

    /// Stores the address other clients should use for direct messages. The
    /// text is kept verbatim; a later call replaces it.
    pub fn register_address(&self, private_address: &str) -> String {
        let mut session = self.session();
        match &mut *session {
            SessionState::Authenticated {
                username,
                private_address: slot,
            } => {
                info!("{} registered private address {}", username, private_address);
                *slot = Some(private_address.to_string());
                REGISTER_SUCCESS.to_string()
            }
            SessionState::Anonymous => LOGIN_REQUIRED.to_string(),
        }
    }

    /// Logs out (best effort), stops the serve loop and closes the socket.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.logout();
        self.close.close();
        if let Err(e) = self.output.close().await {
            debug!("Could not close socket of client {}: {}", self.id, e);
        }
        debug!("Connection {} from {} closed", self.id, self.peer);
    }
}

impl Connection {
    fn login_command(&self, args: &Args) -> CommandResult {
        reply(self.login(args.text(0)?, args.text(1)?))
    }

    async fn send_command(&self, args: &Args) -> CommandResult {
        match self.send(args.text(0)?).await {
            Some(text) => reply(text),
            None => no_reply(),
        }
    }

    fn lookup_command(&self, args: &Args) -> CommandResult {
        reply(self.lookup(args.text(0)?))
    }

    fn register_command(&self, args: &Args) -> CommandResult {
        reply(self.register_address(args.text(0)?))
    }
}

impl CommandHandler for Connection {
    fn register(self: Arc<Self>, table: &mut CommandTable) -> Result<(), CommandError> {
        let this = Arc::clone(&self);
        table.add("login", &["username", "password"], move |args| {
            let this = Arc::clone(&this);
            async move { this.login_command(&args) }
        })?;

        let this = Arc::clone(&self);
        table.add("logout", &[], move |_| {
            let this = Arc::clone(&this);
            async move { reply(this.logout()) }
        })?;

        let this = Arc::clone(&self);
        table.add("send", &["message"], move |args| {
            let this = Arc::clone(&this);
            async move { this.send_command(&args).await }
        })?;

        let this = Arc::clone(&self);
        table.add("lookup", &["username"], move |args| {
            let this = Arc::clone(&this);
            async move { this.lookup_command(&args) }
        })?;

        let this = Arc::clone(&self);
        table.add("register", &["address"], move |args| {
            let this = Arc::clone(&this);
            async move { this.register_command(&args) }
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Config, Engine, ServeExit, Transcript};
    use tokio::io::BufReader;

    fn users() -> Config {
        Config::from_pairs([
            ("alice.password", "12345"),
            ("bob.password", "23456"),
            ("carol.password", "34567"),
        ])
    }

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Adds a connection writing into a fresh transcript.
    fn connect(clients: &Arc<ClientManager>) -> (Arc<Connection>, Transcript) {
        let transcript = Transcript::new();
        let id = clients.next_client_id();
        let connection = Arc::new(Connection::new(
            id,
            test_addr(40000 + id as u16),
            transcript.sink(),
            CloseHandle::new(),
            Arc::clone(clients),
        ));
        clients.add_client(Arc::clone(&connection));
        (connection, transcript)
    }

    #[test]
    fn test_login_success_and_repeat() {
        let clients = Arc::new(ClientManager::new(users()));
        let (alice, _) = connect(&clients);

        assert_eq!(alice.login("alice", "12345"), LOGIN_SUCCESS);
        assert_eq!(alice.login("bob", "23456"), ALREADY_LOGGED_IN);
        assert_eq!(alice.login("alice", "wrong"), ALREADY_LOGGED_IN);
        assert_eq!(alice.username().as_deref(), Some("alice"));
    }

    #[test]
    fn test_login_failures_are_indistinguishable() {
        let clients = Arc::new(ClientManager::new(users()));
        let (conn, _) = connect(&clients);

        let unknown_user = conn.login("mallory", "12345");
        let wrong_password = conn.login("alice", "00000");

        assert_eq!(unknown_user, LOGIN_FAILED);
        assert_eq!(unknown_user, wrong_password);
        assert_eq!(conn.state(), SessionState::Anonymous);
    }

    #[test]
    fn test_logout_transitions_and_is_idempotent() {
        let clients = Arc::new(ClientManager::new(users()));
        let (conn, _) = connect(&clients);

        assert_eq!(conn.logout(), LOGIN_REQUIRED);

        conn.login("alice", "12345");
        conn.register_address("127.0.0.1:9000");
        assert_eq!(conn.logout(), LOGOUT_SUCCESS);
        assert_eq!(conn.state(), SessionState::Anonymous);
        assert_eq!(conn.private_address(), None);

        assert_eq!(conn.logout(), LOGIN_REQUIRED);
        assert_eq!(conn.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_commands_require_login() {
        let clients = Arc::new(ClientManager::new(users()));
        let (conn, transcript) = connect(&clients);
        let (other, other_transcript) = connect(&clients);
        other.login("bob", "23456");

        assert_eq!(conn.send("hello").await.as_deref(), Some(LOGIN_REQUIRED));
        assert_eq!(conn.lookup("bob"), LOGIN_REQUIRED);
        assert_eq!(conn.register_address("127.0.0.1:9000"), LOGIN_REQUIRED);

        assert_eq!(conn.state(), SessionState::Anonymous);
        assert!(transcript.contents().is_empty());
        assert!(other_transcript.contents().is_empty());
    }

    #[tokio::test]
    async fn test_send_reaches_every_other_authenticated_session() {
        let clients = Arc::new(ClientManager::new(users()));
        let (alice, alice_out) = connect(&clients);
        let (bob, bob_out) = connect(&clients);
        let (carol, carol_out) = connect(&clients);
        let (_anonymous, anonymous_out) = connect(&clients);

        alice.login("alice", "12345");
        bob.login("bob", "23456");
        carol.login("carol", "34567");

        assert_eq!(alice.send("hello   world !").await, None);

        assert!(alice_out.contents().is_empty());
        assert!(anonymous_out.contents().is_empty());
        assert_eq!(bob_out.lines(), vec!["!send alice hello   world !"]);
        assert_eq!(carol_out.lines(), vec!["!send alice hello   world !"]);
    }

    #[tokio::test]
    async fn test_send_skips_closed_recipients() {
        let clients = Arc::new(ClientManager::new(users()));
        let (alice, _) = connect(&clients);
        let (bob, bob_out) = connect(&clients);
        let (carol, carol_out) = connect(&clients);

        alice.login("alice", "12345");
        bob.login("bob", "23456");
        carol.login("carol", "34567");
        bob.close().await;

        assert_eq!(alice.send("still here").await, None);
        assert!(bob_out.contents().is_empty());
        assert_eq!(carol_out.lines(), vec!["!send alice still here"]);
    }

    #[test]
    fn test_lookup_outcomes() {
        let clients = Arc::new(ClientManager::new(users()));
        let (alice, _) = connect(&clients);
        let (bob, _) = connect(&clients);
        alice.login("alice", "12345");

        assert_eq!(alice.lookup("bob"), "No user with name bob found.");

        bob.login("bob", "23456");
        assert_eq!(alice.lookup("bob"), "bob didn't register yet!");

        bob.register_address("10.0.0.2:5000");
        bob.register_address("10.0.0.2:6000");
        assert_eq!(alice.lookup("bob"), "!register bob 10.0.0.2:6000");
    }

    #[test]
    fn test_register_accepts_any_literal() {
        let clients = Arc::new(ClientManager::new(users()));
        let (alice, _) = connect(&clients);
        alice.login("alice", "12345");

        assert_eq!(alice.register_address("not even an address"), REGISTER_SUCCESS);
        assert_eq!(
            alice.private_address().as_deref(),
            Some("not even an address")
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_logs_out() {
        let clients = Arc::new(ClientManager::new(users()));
        let (alice, _) = connect(&clients);
        alice.login("alice", "12345");

        alice.close().await;
        alice.close().await;

        assert!(alice.is_closed());
        assert_eq!(alice.state(), SessionState::Anonymous);
        assert!(clients.online_users().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_through_engine() {
        let clients = Arc::new(ClientManager::new(users()));
        let transcript = Transcript::new();
        let connection = Arc::new(Connection::new(
            clients.next_client_id(),
            test_addr(40100),
            transcript.sink(),
            CloseHandle::new(),
            Arc::clone(&clients),
        ));
        clients.add_client(Arc::clone(&connection));

        let mut engine = Engine::new(transcript.sink());
        engine.register(Arc::clone(&connection)).unwrap();

        assert_eq!(
            engine.dispatch("!send too early").await.as_deref(),
            Some(LOGIN_REQUIRED)
        );
        assert_eq!(
            engine.dispatch("!login alice 12345").await.as_deref(),
            Some(LOGIN_SUCCESS)
        );
        assert_eq!(
            engine.dispatch("register 127.0.0.1:7000").await.as_deref(),
            Some(REGISTER_SUCCESS)
        );
        assert_eq!(
            engine.dispatch("!lookup alice").await.as_deref(),
            Some("!register alice 127.0.0.1:7000")
        );
        assert_eq!(engine.dispatch("!send nobody else here").await, None);

        let arity = engine.dispatch("!login alice").await.unwrap();
        assert!(arity.starts_with("Wrong number of arguments for login"));
        assert_eq!(connection.username().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_serve_scripted_session() {
        let clients = Arc::new(ClientManager::new(users()));
        let (connection, _) = connect(&clients);
        let transcript = Transcript::new();
        let mut engine = Engine::new(transcript.sink());
        engine.register(Arc::clone(&connection)).unwrap();

        let input = tokio_test::io::Builder::new()
            .read(b"!login alice 12345\n")
            .read(b"!register 10.0.0.1:4000\n\n")
            .read(b"!logout\n")
            .build();
        let exit = engine.serve(BufReader::new(input)).await.unwrap();

        assert_eq!(exit, ServeExit::EndOfStream);
        assert_eq!(
            transcript.lines(),
            vec![LOGIN_SUCCESS, REGISTER_SUCCESS, LOGOUT_SUCCESS]
        );
    }
}
