//! Performance benchmarks for the line protocol hot paths

use server::client_manager::ClientManager;
use server::session::Connection;
use shared::engine::{tokenize, ParsedLine};
use shared::{reply, Args, CloseHandle, CommandError, CommandHandler, CommandResult};
use shared::{CommandTable, Config, Engine, Transcript};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Minimal handler so dispatch cost is measured without I/O
struct Echo;

impl CommandHandler for Echo {
    fn register(self: Arc<Self>, table: &mut CommandTable) -> Result<(), CommandError> {
        table.add("echo", &["who", "message"], |args| async move { echo(&args) })
    }
}

fn echo(args: &Args) -> CommandResult {
    reply(format!("{} {}", args.text(0)?, args.text(1)?))
}

/// Benchmarks line parsing and greedy tokenization
#[test]
fn benchmark_parse_and_tokenize() {
    let line = "!send alice hello there, this is a longer message with   spacing";
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let parsed = ParsedLine::parse(line).unwrap();
        let values = tokenize(parsed.rest, 2).unwrap();
        assert_eq!(values.len(), 2);
    }

    let duration = start.elapsed();
    println!(
        "Parse + tokenize: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds even unoptimized
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks full dispatch through the command table
#[tokio::test]
async fn benchmark_dispatch() {
    let mut engine = Engine::new(Transcript::new().sink());
    engine.register(Arc::new(Echo)).unwrap();

    let iterations = 20_000;
    let start = Instant::now();

    for i in 0..iterations {
        let result = engine.dispatch(&format!("!echo bob message {i}")).await;
        assert!(result.is_some());
    }

    let duration = start.elapsed();
    println!(
        "Dispatch: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks the user listing with many accounts and sessions
#[test]
fn benchmark_list_users() {
    let users = Config::from_pairs(
        (0..1000).map(|i| (format!("user{i:04}.password"), "secret".to_string())),
    );
    let clients = Arc::new(ClientManager::new(users));

    for i in 0..500 {
        let connection = Arc::new(Connection::new(
            clients.next_client_id(),
            SocketAddr::from(([127, 0, 0, 1], 20000 + i as u16)),
            Transcript::new().sink(),
            CloseHandle::new(),
            Arc::clone(&clients),
        ));
        connection.login(&format!("user{:04}", i * 2), "secret");
        clients.add_client(connection);
    }

    let iterations = 100;
    let start = Instant::now();

    for _ in 0..iterations {
        let listing = clients.list_users();
        assert_eq!(listing.lines().count(), 1000);
    }

    let duration = start.elapsed();
    println!(
        "List users: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );
    assert_eq!(clients.online_users().len(), 500);

    assert!(duration.as_millis() < 5000);
}
