//! Address book and pending message queue for direct peer messaging.
//!
//! Each username gets its own slot holding the resolved address (if any) and
//! the messages waiting for it. A slot's lock is held for the whole of a send
//! or a drain, so a message queued while a resolution is being processed is
//! never lost.
//!
//! The console and the server relay never wait on a peer themselves: they
//! hand work to a [`Courier`], which runs one worker per username on the
//! client's pool. Deliveries to one user therefore keep their issue order,
//! and a peer that never answers only stalls its own queue until `exit`
//! aborts the pool.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use shared::protocol::{peer_line, timestamp, wire_line, ACK};
use shared::{LineSink, WorkerPool};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::peer::send_direct;

const ANONYMOUS_SENDER: &str = "anonymous";

#[derive(Debug, Default)]
struct PeerSlot {
    address: Option<String>,
    pending: VecDeque<String>,
}

type Slots = HashMap<String, Arc<AsyncMutex<PeerSlot>>>;

#[derive(Debug)]
pub struct Messenger {
    display_name: Mutex<Option<String>>,
    slots: Mutex<Slots>,
    server: LineSink,
}

impl Messenger {
    /// Creates an empty address book.
    ///
    /// `server` is the chat server connection; `msg` writes a `!lookup` to it
    /// whenever a message has to wait for an address.
    pub fn new(server: LineSink) -> Self {
        Self {
            display_name: Mutex::new(None),
            slots: Mutex::new(HashMap::new()),
            server,
        }
    }

    /// Sender name put in front of every direct message.
    pub fn set_display_name(&self, name: &str) {
        *self
            .display_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| ANONYMOUS_SENDER.to_string())
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot of `username`, created on first use.
    fn slot(&self, username: &str) -> Arc<AsyncMutex<PeerSlot>> {
        Arc::clone(self.slots().entry(username.to_string()).or_default())
    }

    fn existing_slot(&self, username: &str) -> Option<Arc<AsyncMutex<PeerSlot>>> {
        self.slots().get(username).cloned()
    }

    /// Address `username` was last resolved to, unless it was evicted.
    ///
    /// Waits while a send or drain for that user is in progress.
    pub async fn address_of(&self, username: &str) -> Option<String> {
        let slot = self.existing_slot(username)?;
        let slot = slot.lock().await;
        slot.address.clone()
    }

    /// Messages still waiting for an address, oldest first, each carrying
    /// the `[HH:MM:SS.mmm]` stamp of when it was queued.
    pub async fn pending(&self, username: &str) -> Vec<String> {
        let Some(slot) = self.existing_slot(username) else {
            return Vec::new();
        };
        let slot = slot.lock().await;
        slot.pending.iter().cloned().collect()
    }

    /// Sends `message` to `username` directly if its address is known,
    /// otherwise queues it and asks the server for the address. Returns the
    /// status to show the user.
    ///
    /// Only an [`ACK`] reply counts as delivered. Any other reply, or a
    /// connection failure, evicts the address so the next message triggers a
    /// fresh lookup.
    pub async fn msg(&self, username: &str, message: &str) -> String {
        let slot = self.slot(username);
        let mut slot = slot.lock().await;

        let Some(address) = slot.address.clone() else {
            slot.pending.push_back(format!("[{}] {}", timestamp(), message));
            drop(slot);

            if let Err(e) = self.server.write_line(&wire_line("lookup", &[username])).await {
                warn!("Could not request address of {}: {}", username, e);
            }
            return format!(
                "Could not send message, will deliver as soon as address to {username} is known."
            );
        };

        match self.deliver(&address, message).await {
            Ok(()) => format!("{username} replied with {ACK}"),
            Err(e) => {
                warn!("Direct message to {} at {} failed: {}", username, address, e);
                slot.address = None;
                format!("Could not communicate to {username}")
            }
        }
    }

    /// Stores `address` for `username` and sends everything queued for it in
    /// FIFO order. On the first failure the address is dropped again and the
    /// undelivered rest stays queued, in order, for the next resolution.
    pub async fn resolve(&self, username: &str, address: &str) -> Vec<String> {
        let slot = self.slot(username);
        let mut slot = slot.lock().await;
        slot.address = Some(address.to_string());

        let queued = slot.pending.len();
        if queued == 0 {
            return Vec::new();
        }

        let mut report = vec![format!("Pending messages for {username} are being sent.")];
        let mut delivered = 0;
        while let Some(message) = slot.pending.pop_front() {
            match self.deliver(address, &message).await {
                Ok(()) => {
                    delivered += 1;
                    report.push(format!("{username} replied with {ACK}"));
                }
                Err(e) => {
                    warn!("Draining messages for {} failed: {}", username, e);
                    slot.pending.push_front(message);
                    slot.address = None;
                    report.push(format!("Could not communicate to {username}"));
                    break;
                }
            }
        }

        info!(
            "Delivered {} of {} pending messages to {}",
            delivered, queued, username
        );
        report
    }

    async fn deliver(&self, address: &str, message: &str) -> io::Result<()> {
        let line = peer_line(&self.display_name(), message);
        let reply = send_direct(address, &line).await?;
        if reply != ACK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {ACK}, peer answered {reply:?}"),
            ));
        }
        debug!("{} acknowledged", address);
        Ok(())
    }
}

#[derive(Debug)]
enum Delivery {
    Message(String),
    Resolved(String),
}

/// Runs [`Messenger`] work off the caller's task and writes the resulting
/// status lines to the console.
pub struct Courier {
    messenger: Arc<Messenger>,
    console: LineSink,
    pool: WorkerPool,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
}

impl Courier {
    pub fn new(messenger: Arc<Messenger>, console: LineSink, pool: WorkerPool) -> Self {
        Self {
            messenger,
            console,
            pool,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Queues a direct message to `username`. Returns false once the pool has
    /// been shut down.
    pub fn msg(&self, username: &str, message: &str) -> bool {
        self.submit(username, Delivery::Message(message.to_string()))
    }

    /// Queues the address resolution of `username`, which drains whatever
    /// was waiting for it.
    pub fn resolved(&self, username: &str, address: &str) -> bool {
        self.submit(username, Delivery::Resolved(address.to_string()))
    }

    fn submit(&self, username: &str, delivery: Delivery) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        // A closed queue means its worker was aborted; start a new one
        let delivery = match queues.get(username) {
            Some(queue) => match queue.send(delivery) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };

        let (queue, inbound) = mpsc::unbounded_channel();
        let worker = deliveries(
            Arc::clone(&self.messenger),
            self.console.clone(),
            username.to_string(),
            inbound,
        );
        if !self.pool.spawn(worker) {
            queues.remove(username);
            debug!("Dropping delivery to {}, client is shutting down", username);
            return false;
        }

        let sent = queue.send(delivery).is_ok();
        queues.insert(username.to_string(), queue);
        sent
    }
}

/// Worker of one username: runs its deliveries one after another.
async fn deliveries(
    messenger: Arc<Messenger>,
    console: LineSink,
    username: String,
    mut inbound: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = inbound.recv().await {
        let report = match delivery {
            Delivery::Message(message) => vec![messenger.msg(&username, &message).await],
            Delivery::Resolved(address) => messenger.resolve(&username, &address).await,
        };
        for line in report {
            if let Err(e) = console.write_line(&line).await {
                warn!("Failed to display delivery status: {}", e);
            }
        }
    }
}
