//! Registry of every connection the server has accepted.
//!
//! The registry owns the credential store and the ordered list of
//! connections. Connections are appended on accept and stay in the list until
//! shutdown drains it; a connection whose socket went away simply reports
//! itself as logged out. Broadcasts and lookups iterate over a snapshot, so a
//! connection being accepted concurrently never invalidates an iteration.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;
use shared::Config;

use crate::session::Connection;

const PASSWORD_SUFFIX: &str = ".password";

#[derive(Debug)]
pub struct ClientManager {
    users: Config,
    connections: RwLock<Vec<Arc<Connection>>>,
    next_client_id: AtomicU32,
}

impl ClientManager {
    /// `users` holds one `<username>.password` entry per account.
    pub fn new(users: Config) -> Self {
        Self {
            users,
            connections: RwLock::new(Vec::new()),
            next_client_id: AtomicU32::new(1),
        }
    }

    pub fn users(&self) -> &Config {
        &self.users
    }

    pub fn next_client_id(&self) -> u32 {
        self.next_client_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Exact match against the stored password.
    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        self.users.get(&format!("{username}{PASSWORD_SUFFIX}")) == Some(password)
    }

    /// Every account in the credential store, sorted.
    pub fn known_users(&self) -> Vec<&str> {
        self.users
            .keys()
            .filter_map(|key| key.strip_suffix(PASSWORD_SUFFIX))
            .collect()
    }

    pub fn add_client(&self, connection: Arc<Connection>) {
        debug!(
            "Registering connection {} from {}",
            connection.id(),
            connection.peer()
        );
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection);
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Usernames of authenticated connections in accept order. A user logged
    /// in on several connections appears once.
    pub fn online_users(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.snapshot()
            .iter()
            .filter_map(|connection| connection.username())
            .filter(|username| seen.insert(username.clone()))
            .collect()
    }

    /// One `<username> online|offline` line per account.
    pub fn list_users(&self) -> String {
        let online: HashSet<String> = self.online_users().into_iter().collect();
        self.known_users()
            .into_iter()
            .map(|username| {
                let status = if online.contains(username) {
                    "online"
                } else {
                    "offline"
                };
                format!("{username} {status}\n")
            })
            .collect()
    }

    /// Newline-terminated online usernames, as sent to discovery queries.
    pub fn online_listing(&self) -> String {
        self.online_users()
            .into_iter()
            .map(|username| format!("{username}\n"))
            .collect()
    }

    /// First connection currently authenticated as `username`.
    pub fn find_by_username(&self, username: &str) -> Option<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .find(|connection| connection.username().as_deref() == Some(username))
    }

    /// Removes and returns every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(
            &mut *self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{CloseHandle, Transcript};
    use std::net::SocketAddr;

    fn manager() -> Arc<ClientManager> {
        Arc::new(ClientManager::new(Config::from_pairs([
            ("bob.password", "23456"),
            ("alice.password", "12345"),
            ("carol.password", "34567"),
            ("motd", "not an account"),
        ])))
    }

    fn connect(clients: &Arc<ClientManager>) -> Arc<Connection> {
        let id = clients.next_client_id();
        let connection = Arc::new(Connection::new(
            id,
            SocketAddr::from(([127, 0, 0, 1], 41000 + id as u16)),
            Transcript::new().sink(),
            CloseHandle::new(),
            Arc::clone(clients),
        ));
        clients.add_client(Arc::clone(&connection));
        connection
    }

    #[test]
    fn test_client_ids_are_unique() {
        let clients = manager();
        let first = connect(&clients);
        let second = connect(&clients);

        assert_ne!(first.id(), second.id());
        assert_eq!(clients.len(), 2);
    }

    #[test]
    fn test_known_users_come_from_password_keys() {
        let clients = manager();
        assert_eq!(clients.known_users(), vec!["alice", "bob", "carol"]);
        assert!(clients.check_credentials("bob", "23456"));
        assert!(!clients.check_credentials("bob", "2345"));
        assert!(!clients.check_credentials("motd", "not an account"));
    }

    #[test]
    fn test_list_users_marks_online_accounts() {
        let clients = manager();
        let first = connect(&clients);
        let _anonymous = connect(&clients);
        first.login("bob", "23456");

        assert_eq!(
            clients.list_users(),
            "alice offline\nbob online\ncarol offline\n"
        );
    }

    #[test]
    fn test_online_users_deduplicate_in_accept_order() {
        let clients = manager();
        let carol = connect(&clients);
        let alice = connect(&clients);
        let carol_again = connect(&clients);
        carol.login("carol", "34567");
        alice.login("alice", "12345");
        carol_again.login("carol", "34567");

        assert_eq!(clients.online_users(), vec!["carol", "alice"]);
        assert_eq!(clients.online_listing(), "carol\nalice\n");
    }

    #[test]
    fn test_online_listing_empty_without_logins() {
        let clients = manager();
        connect(&clients);
        assert_eq!(clients.online_listing(), "");
    }

    #[test]
    fn test_logged_out_connection_stays_registered() {
        let clients = manager();
        let alice = connect(&clients);
        alice.login("alice", "12345");
        alice.logout();

        assert_eq!(clients.len(), 1);
        assert!(clients.find_by_username("alice").is_none());
        assert_eq!(
            clients.list_users(),
            "alice offline\nbob offline\ncarol offline\n"
        );
    }

    #[test]
    fn test_find_by_username_returns_first_match() {
        let clients = manager();
        let first = connect(&clients);
        let second = connect(&clients);
        first.login("alice", "12345");
        second.login("alice", "12345");

        let found = clients.find_by_username("alice").unwrap();
        assert_eq!(found.id(), first.id());
    }

    #[test]
    fn test_drain_empties_registry() {
        let clients = manager();
        connect(&clients);
        connect(&clients);

        assert_eq!(clients.drain().len(), 2);
        assert!(clients.is_empty());
        assert!(clients.drain().is_empty());
    }
}
