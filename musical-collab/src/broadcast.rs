//! Fan-out of accepted instructions to every active client.
//!
//! Each client has two bounded outbound queues, one per pipe, drained by
//! that client's writer tasks. The host loop only ever `try_send`s, so a
//! slow client can never stall it: a full or closed queue evicts the client.
//!
//! ```text
//!                 ┌────────────► [queue] ──► writer ──► client #1
//!  host loop ─────┼────────────► [queue] ──► writer ──► client #2
//!  (FanOut)       └────────────► [queue] ──► writer ──► client #3
//! ```
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{ErrorReporter, SpaceError};
use crate::protocol::AuthorId;

/// An encoded packet shared by every queue it is pushed to.
pub type Packet = Arc<Vec<u8>>;

/// Which of a client's pipes a packet travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Instructions,
    Uploads,
}

/// Snapshot of fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutStats {
    pub packets_sent: u64,
    pub clients_evicted: u64,
    pub active_clients: usize,
}

/// Lock-free counters, readable from outside the host loop.
#[derive(Debug, Default)]
struct AtomicFanOutStats {
    packets_sent: AtomicU64,
    clients_evicted: AtomicU64,
    active_clients: AtomicUsize,
}

/// Read handle on a [`FanOut`]'s counters.
#[derive(Debug, Clone)]
pub struct FanOutStatsHandle(Arc<AtomicFanOutStats>);

impl FanOutStatsHandle {
    pub fn snapshot(&self) -> FanOutStats {
        FanOutStats {
            packets_sent: self.0.packets_sent.load(Ordering::Relaxed),
            clients_evicted: self.0.clients_evicted.load(Ordering::Relaxed),
            active_clients: self.0.active_clients.load(Ordering::Relaxed),
        }
    }
}

/// The host's send side of one accepted client.
///
/// Dropping the link aborts the client's ingress tasks and closes its
/// queues; the writer tasks then drain what is queued and close the pipes.
pub struct ClientLink {
    author: AuthorId,
    instructions: mpsc::Sender<Packet>,
    uploads: mpsc::Sender<Packet>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientLink {
    pub fn new(
        author: AuthorId,
        instructions: mpsc::Sender<Packet>,
        uploads: mpsc::Sender<Packet>,
    ) -> Self {
        Self {
            author,
            instructions,
            uploads,
            tasks: Vec::new(),
        }
    }

    /// Tie a task's lifetime to the link.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn author(&self) -> AuthorId {
        self.author
    }

    fn queue(&self, channel: Channel) -> &mpsc::Sender<Packet> {
        match channel {
            Channel::Instructions => &self.instructions,
            Channel::Uploads => &self.uploads,
        }
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The active-client set.
pub struct FanOut {
    clients: HashMap<AuthorId, ClientLink>,
    stats: Arc<AtomicFanOutStats>,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl FanOut {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            stats: Arc::new(AtomicFanOutStats::default()),
        }
    }

    pub fn stats_handle(&self) -> FanOutStatsHandle {
        FanOutStatsHandle(self.stats.clone())
    }

    pub fn stats(&self) -> FanOutStats {
        self.stats_handle().snapshot()
    }

    pub fn insert(&mut self, link: ClientLink) {
        self.clients.insert(link.author, link);
        self.sync_active();
    }

    /// Drop a client. Returns whether it was active.
    pub fn remove(&mut self, author: AuthorId) -> bool {
        let removed = self.clients.remove(&author).is_some();
        self.sync_active();
        removed
    }

    /// Drop every client.
    pub fn clear(&mut self) -> usize {
        let count = self.clients.len();
        self.clients.clear();
        self.sync_active();
        count
    }

    pub fn contains(&self, author: AuthorId) -> bool {
        self.clients.contains_key(&author)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn authors(&self) -> Vec<AuthorId> {
        self.clients.keys().copied().collect()
    }

    /// Queue `packet` for every active client.
    ///
    /// Never blocks. A client whose queue is full or closed is evicted and
    /// reported as [`SpaceError::PipeBroken`]. Returns the number of clients
    /// the packet was queued for.
    pub fn broadcast(
        &mut self,
        channel: Channel,
        packet: Packet,
        reporter: &dyn ErrorReporter,
    ) -> usize {
        let mut evicted = Vec::new();
        let mut delivered = 0;

        for (author, link) in &self.clients {
            match link.queue(channel).try_send(packet.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    evicted.push((*author, format!("{channel:?} queue of {author} is full")));
                }
                Err(TrySendError::Closed(_)) => {
                    evicted.push((*author, format!("{channel:?} pipe of {author} closed")));
                }
            }
        }

        self.stats
            .packets_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);

        for (author, reason) in evicted {
            self.clients.remove(&author);
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
            log::warn!("Evicting client {author}: {reason}");
            reporter.report(SpaceError::PipeBroken(reason));
        }
        self.sync_active();
        delivered
    }

    fn sync_active(&self) {
        self.stats
            .active_clients
            .store(self.clients.len(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    fn link(author: u16, capacity: usize) -> (ClientLink, mpsc::Receiver<Packet>, mpsc::Receiver<Packet>) {
        let (itx, irx) = mpsc::channel(capacity);
        let (utx, urx) = mpsc::channel(capacity);
        (ClientLink::new(AuthorId(author), itx, utx), irx, urx)
    }

    fn collecting() -> (Arc<Mutex<Vec<ErrorKind>>>, impl ErrorReporter) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: SpaceError| sink.lock().unwrap().push(e.kind()))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let mut fanout = FanOut::new();
        let (a, mut a_rx, _a_up) = link(1, 8);
        let (b, mut b_rx, mut b_up) = link(2, 8);
        fanout.insert(a);
        fanout.insert(b);
        let (errors, reporter) = collecting();

        let packet = Arc::new(vec![4, 1, 0]);
        assert_eq!(fanout.broadcast(Channel::Instructions, packet.clone(), &reporter), 2);
        assert_eq!(a_rx.recv().await.unwrap(), packet);
        assert_eq!(b_rx.recv().await.unwrap(), packet);

        fanout.broadcast(Channel::Uploads, Arc::new(vec![3]), &reporter);
        assert_eq!(*b_up.recv().await.unwrap(), vec![3]);
        assert!(b_rx.try_recv().is_err());

        let stats = fanout.stats();
        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.active_clients, 2);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_evicts() {
        let mut fanout = FanOut::new();
        let (slow, _slow_rx, _up) = link(1, 1);
        let (fast, mut fast_rx, _up2) = link(2, 8);
        fanout.insert(slow);
        fanout.insert(fast);
        let (errors, reporter) = collecting();

        fanout.broadcast(Channel::Instructions, Arc::new(vec![1]), &reporter);
        fanout.broadcast(Channel::Instructions, Arc::new(vec![2]), &reporter);

        assert!(!fanout.contains(AuthorId(1)));
        assert!(fanout.contains(AuthorId(2)));
        assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::PipeBroken]);
        assert_eq!(*fast_rx.recv().await.unwrap(), vec![1]);
        assert_eq!(*fast_rx.recv().await.unwrap(), vec![2]);

        let stats = fanout.stats();
        assert_eq!(stats.clients_evicted, 1);
        assert_eq!(stats.active_clients, 1);
    }

    #[tokio::test]
    async fn test_closed_queue_evicts() {
        let mut fanout = FanOut::new();
        let (gone, rx, _up) = link(3, 4);
        fanout.insert(gone);
        drop(rx);
        let (errors, reporter) = collecting();

        assert_eq!(fanout.broadcast(Channel::Instructions, Arc::new(vec![1]), &reporter), 0);
        assert!(fanout.is_empty());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_aborts_tasks_and_closes_queues() {
        let mut fanout = FanOut::new();
        let (mut client, mut rx, _up) = link(5, 4);
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        client.attach(tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        }));
        fanout.insert(client);

        assert!(fanout.remove(AuthorId(5)));
        assert!(!fanout.remove(AuthorId(5)));
        assert!(alive_rx.await.is_err());
        assert!(rx.recv().await.is_none());
        assert_eq!(fanout.stats().active_clients, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let mut fanout = FanOut::new();
        for author in 1..=3 {
            fanout.insert(link(author, 1).0);
        }
        let mut authors = fanout.authors();
        authors.sort();
        assert_eq!(authors, vec![AuthorId(1), AuthorId(2), AuthorId(3)]);
        assert_eq!(fanout.clear(), 3);
        assert!(fanout.is_empty());
    }
}
