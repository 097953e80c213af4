//! Server-to-client relay.
//!
//! Lines arriving from the chat server are fed through an unnamed,
//! pass-through engine: plain replies (`Successfully logged in.`) go to the
//! console unchanged, while the marked notifications `!send` and `!register`
//! are dispatched to [`ServerRelay`]. Resolutions are handed to the
//! [`Courier`], so draining a slow peer never holds up the next server line.

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use shared::engine::{reply, Args, CommandHandler, CommandResult, CommandTable};
use shared::protocol::peer_line;
use shared::{CloseHandle, CommandError, Engine, LineSink};

use crate::messenger::Courier;

/// Last message received, publicly or directly.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    last: Arc<Mutex<Option<String>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: &str) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    pub fn last(&self) -> Option<String> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ServerRelay {
    inbox: Inbox,
    courier: Arc<Courier>,
}

impl ServerRelay {
    pub fn new(inbox: Inbox, courier: Arc<Courier>) -> Self {
        Self { inbox, courier }
    }

    /// Public message from another user.
    pub fn public_message(&self, username: &str, message: &str) -> String {
        let line = peer_line(username, message);
        self.inbox.record(&line);
        line
    }

    /// Address resolution for `username`. Whatever was queued for it is
    /// flushed in the background and reported on the console.
    pub fn address_resolved(&self, username: &str, address: &str) -> String {
        if !self.courier.resolved(username, address) {
            debug!("Ignoring address of {}, client is shutting down", username);
        }
        format!("{username} registered under {address}")
    }

    /// Pass-through engine writing to `console`, stopped by `close`.
    pub fn engine(
        self: Arc<Self>,
        console: LineSink,
        close: CloseHandle,
    ) -> Result<Engine, CommandError> {
        let mut engine = Engine::new(console)
            .with_passthrough()
            .with_close_handle(close);
        engine.register(self)?;
        Ok(engine)
    }

    fn send_command(&self, args: &Args) -> CommandResult {
        reply(self.public_message(args.text(0)?, args.text(1)?))
    }

    fn register_command(&self, args: &Args) -> CommandResult {
        reply(self.address_resolved(args.text(0)?, args.text(1)?))
    }
}

impl CommandHandler for ServerRelay {
    fn register(self: Arc<Self>, table: &mut CommandTable) -> Result<(), CommandError> {
        let this = Arc::clone(&self);
        table.add("send", &["username", "message"], move |args| {
            let this = Arc::clone(&this);
            async move { this.send_command(&args) }
        })?;

        let this = Arc::clone(&self);
        table.add("register", &["username", "address"], move |args| {
            let this = Arc::clone(&this);
            async move { this.register_command(&args) }
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::Messenger;
    use shared::{ServeExit, Transcript, WorkerPool};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn courier(server: &Transcript, console: &Transcript) -> Arc<Courier> {
        Arc::new(Courier::new(
            Arc::new(Messenger::new(server.sink())),
            console.sink(),
            WorkerPool::new(),
        ))
    }

    fn relay() -> (Arc<ServerRelay>, Inbox, Transcript) {
        let inbox = Inbox::new();
        let server = Transcript::new();
        let courier = courier(&server, &Transcript::new());
        (
            Arc::new(ServerRelay::new(inbox.clone(), courier)),
            inbox,
            server,
        )
    }

    #[test]
    fn test_inbox_keeps_latest() {
        let inbox = Inbox::new();
        assert_eq!(inbox.last(), None);
        inbox.record("alice: one");
        inbox.record("bob: two");
        assert_eq!(inbox.last().as_deref(), Some("bob: two"));
    }

    #[tokio::test]
    async fn test_relay_displays_replies_and_notifications() {
        let (relay, inbox, _) = relay();
        let console = Transcript::new();
        let engine = relay.engine(console.sink(), CloseHandle::new()).unwrap();

        let input = tokio_test::io::Builder::new()
            .read(b"Successfully logged in.\n")
            .read(b"!send bob hi   all\n")
            .read(b"bob didn't register yet!\n")
            .build();
        let exit = engine.serve(BufReader::new(input)).await.unwrap();

        assert_eq!(exit, ServeExit::EndOfStream);
        assert_eq!(
            console.lines(),
            vec![
                "Successfully logged in.",
                "bob: hi   all",
                "bob didn't register yet!",
            ]
        );
        assert_eq!(inbox.last().as_deref(), Some("bob: hi   all"));
    }

    #[tokio::test]
    async fn test_register_notification_without_pending_messages() {
        let (relay, _, server) = relay();
        let engine = relay.engine(Transcript::new().sink(), CloseHandle::new()).unwrap();

        assert_eq!(
            engine.dispatch("!register bob 10.0.0.2:5000").await.as_deref(),
            Some("bob registered under 10.0.0.2:5000")
        );
        assert!(server.contents().is_empty());
    }

    #[tokio::test]
    async fn test_register_notification_does_not_wait_for_drain() {
        // Never answers, so the drain stays stuck on the first message
        let hung = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let console = Transcript::new();
        let courier = courier(&Transcript::new(), &console);
        courier.messenger().msg("bob", "queued").await;
        let relay = Arc::new(ServerRelay::new(Inbox::new(), courier));
        let engine = relay.engine(Transcript::new().sink(), CloseHandle::new()).unwrap();

        let line = format!("!register bob {}", hung.local_addr().unwrap());
        let resolved = tokio::time::timeout(Duration::from_secs(1), engine.dispatch(&line))
            .await
            .unwrap();
        assert!(resolved.unwrap().starts_with("bob registered under 127.0.0.1:"));

        // The relay keeps serving while the drain is in flight
        assert_eq!(
            engine.dispatch("!send carol hi").await.as_deref(),
            Some("carol: hi")
        );

        // The queued message went out in the background
        let (stream, _) = tokio::time::timeout(Duration::from_secs(3), hung.accept())
            .await
            .unwrap()
            .unwrap();
        let mut lines = BufReader::new(stream).lines();
        let delivered = lines.next_line().await.unwrap().unwrap();
        assert!(delivered.starts_with("anonymous: ["));
        assert!(delivered.ends_with("] queued"));
        assert!(console.contents().is_empty());
    }
}
