//! The host: a single event loop that owns the log and the client set.
//!
//! ```text
//!   accept ──► clients ─┐
//!   switch ──► changes ─┤
//!   ingress ─► request ─┼──► HostLoop ──► LogStore (observe, persist)
//!   timer ──► viewpoint ┤        │
//!   shutdown ───────────┘        └──────► FanOut ──► per-client writers
//! ```
//!
//! Per accepted client:
//! - an instructions writer: the assignment, then the log prefix that
//!   existed at accept time, then live packets from the client's queue
//! - an uploads writer draining the media queue
//! - one ingress task per pipe: decode, validate, forward to `request`
//!
//! Everything the loop owns (log, author counter, client set) is touched
//! only from the loop; other tasks talk to it through channels.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};

use crate::broadcast::{Channel, ClientLink, FanOut, FanOutStatsHandle, Packet};
use crate::clock::wall_nanos;
use crate::config::HostConfig;
use crate::error::{ErrorKind, ErrorReporter, Result, SpaceError};
use crate::observer::Observer;
use crate::pipe::{Connection, PacketSink, PacketStream};
use crate::protocol::{AuthorId, BirdsEyeView, Instruction, Orchestrator, SpaceId};
use crate::session::{drain_queue, validate};
use crate::storage::{LogReader, LogStore, Written};

/// Host statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub connections_accepted: u64,
    pub active_clients: usize,
    /// Records in the current space's log
    pub records: u64,
    /// Committed instructions dropped by author limits
    pub instructions_dropped: u64,
    pub forgeries_rejected: u64,
    pub clients_evicted: u64,
    pub packets_sent: u64,
}

#[derive(Debug, Default)]
struct HostCounters {
    connections_accepted: AtomicU64,
    records: AtomicU64,
    instructions_dropped: AtomicU64,
    forgeries_rejected: AtomicU64,
    clients_switched_out: AtomicU64,
}

enum Request {
    Instruction { from: AuthorId, instruction: Instruction },
    Disconnect(AuthorId),
}

struct Intake {
    connection: Connection,
    reply: oneshot::Sender<Result<AuthorId>>,
}

struct SpaceChange {
    space: SpaceId,
    path: PathBuf,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable handle on a running host.
#[derive(Clone)]
pub struct HostHandle {
    clients: mpsc::Sender<Intake>,
    changes: mpsc::Sender<SpaceChange>,
    requests: mpsc::Sender<Request>,
    shutdown: mpsc::Sender<oneshot::Sender<Result<()>>>,
    counters: Arc<HostCounters>,
    fanout: FanOutStatsHandle,
}

fn host_gone() -> SpaceError {
    SpaceError::pipe("host loop has stopped")
}

impl HostHandle {
    /// Hand a connection to the host. Resolves to the assigned author once
    /// the client is in the active set.
    pub async fn accept(&self, connection: Connection) -> Result<AuthorId> {
        let (reply, response) = oneshot::channel();
        self.clients
            .send(Intake { connection, reply })
            .await
            .map_err(|_| host_gone())?;
        response.await.map_err(|_| host_gone())?
    }

    /// Submit a host-authored instruction, checked against the validation
    /// table as author 0.
    pub async fn submit(&self, instruction: Instruction) -> Result<()> {
        validate(&instruction, AuthorId::HOST)?;
        self.requests
            .send(Request::Instruction { from: AuthorId::HOST, instruction })
            .await
            .map_err(|_| host_gone())
    }

    /// Move the host to another space. On failure the host stays where it
    /// was.
    pub async fn switch_space(&self, space: SpaceId, path: impl Into<PathBuf>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.changes
            .send(SpaceChange { space, path: path.into(), reply })
            .await
            .map_err(|_| host_gone())?;
        response.await.map_err(|_| host_gone())?
    }

    pub fn stats(&self) -> HostStats {
        let fanout = self.fanout.snapshot();
        HostStats {
            connections_accepted: self.counters.connections_accepted.load(Ordering::Relaxed),
            active_clients: fanout.active_clients,
            records: self.counters.records.load(Ordering::Relaxed),
            instructions_dropped: self.counters.instructions_dropped.load(Ordering::Relaxed),
            forgeries_rejected: self.counters.forgeries_rejected.load(Ordering::Relaxed),
            clients_evicted: fanout.clients_evicted
                + self.counters.clients_switched_out.load(Ordering::Relaxed),
            packets_sent: fanout.packets_sent,
        }
    }

    /// Evict every client, close the log and stop the loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.shutdown.send(reply).await.map_err(|_| host_gone())?;
        response.await.map_err(|_| host_gone())?
    }
}

/// Entry point for running a host.
pub struct Host;

impl Host {
    /// Open the configured log and start the host loop.
    ///
    /// Fails without starting anything if the log cannot be opened.
    pub fn spawn(
        config: HostConfig,
        observer: Arc<dyn Observer>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<HostHandle> {
        let store = LogStore::open(&config.log_path, config.replay_limit, observer.clone())?;

        let (clients_tx, clients_rx) = mpsc::channel(16);
        let (changes_tx, changes_rx) = mpsc::channel(4);
        let (requests_tx, requests_rx) = mpsc::channel(config.request_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let counters = Arc::new(HostCounters::default());
        counters.records.store(store.records(), Ordering::Relaxed);
        let fanout = FanOut::new();

        let handle = HostHandle {
            clients: clients_tx,
            changes: changes_tx,
            requests: requests_tx.clone(),
            shutdown: shutdown_tx,
            counters: counters.clone(),
            fanout: fanout.stats_handle(),
        };

        log::info!(
            "Host serving space {} from {} ({} records)",
            config.space,
            config.log_path.display(),
            store.records()
        );

        let host = HostLoop {
            space: config.space,
            config,
            log: store,
            observer,
            reporter,
            fanout,
            next_author: 1,
            viewpoint: BirdsEyeView::default(),
            requests: requests_tx,
            counters,
        };
        tokio::spawn(host.run(clients_rx, changes_rx, requests_rx, shutdown_rx));
        Ok(handle)
    }
}

struct HostLoop {
    config: HostConfig,
    space: SpaceId,
    log: LogStore,
    observer: Arc<dyn Observer>,
    reporter: Arc<dyn ErrorReporter>,
    fanout: FanOut,
    /// Next author to hand out; one past `u16::MAX` means exhausted
    next_author: u32,
    /// Host viewpoint republished with a fresh timing on every tick
    viewpoint: BirdsEyeView,
    requests: mpsc::Sender<Request>,
    counters: Arc<HostCounters>,
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl HostLoop {
    async fn run(
        mut self,
        mut clients: mpsc::Receiver<Intake>,
        mut changes: mpsc::Receiver<SpaceChange>,
        mut requests: mpsc::Receiver<Request>,
        mut shutdown: mpsc::Receiver<oneshot::Sender<Result<()>>>,
    ) {
        let mut viewpoints = self.config.viewpoint_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let reply = loop {
            tokio::select! {
                Some(intake) = clients.recv() => {
                    let result = self.accept(intake.connection);
                    if let Err(e) = &result {
                        log::warn!("Refused connection: {e}");
                    }
                    let _ = intake.reply.send(result);
                }

                Some(change) = changes.recv() => {
                    let result = self.switch_space(change.space, change.path);
                    if let Err(e) = &result {
                        log::error!("Staying on space {}: {e}", self.space);
                    }
                    let _ = change.reply.send(result);
                }

                Some(request) = requests.recv() => match request {
                    Request::Instruction { from, instruction } => self.handle(from, instruction),
                    Request::Disconnect(author) => {
                        if self.fanout.remove(author) {
                            log::info!("Client {author} disconnected");
                        }
                    }
                },

                _ = next_tick(&mut viewpoints) => self.publish_viewpoint(),

                // Also fires with None once every handle is gone.
                reply = shutdown.recv() => break reply,
            }
        };

        let evicted = self.fanout.clear();
        let result = self.log.close();
        log::info!("Host stopped; closed {evicted} client sessions");
        if let Some(reply) = reply {
            let _ = reply.send(result);
        } else if let Err(e) = result {
            self.reporter.report(e);
        }
    }

    fn accept(&mut self, connection: Connection) -> Result<AuthorId> {
        if self.next_author > u32::from(u16::MAX) {
            return Err(SpaceError::AuthorsExhausted);
        }
        let author = AuthorId(self.next_author as u16);
        let history = self.log.records();
        let assign = Instruction::from(Orchestrator {
            record: self.space,
            number: history,
            author,
            assign: true,
        })
        .encode_packet()?;
        self.next_author += 1;

        let (instructions_tx, instructions_rx) = mpsc::channel(self.config.client_queue_capacity);
        let (uploads_tx, uploads_rx) = mpsc::channel(self.config.client_queue_capacity);
        let (instructions_sink, instructions_stream) = connection.instructions.split();
        let (uploads_sink, uploads_stream) = connection.uploads.split();

        let catch_up = CatchUp {
            path: self.log.path().to_path_buf(),
            records: history,
            buffer: self.config.catchup_buffer.max(1),
        };
        tokio::spawn(write_instructions(
            author,
            assign,
            catch_up,
            instructions_rx,
            instructions_sink,
            self.reporter.clone(),
            self.requests.clone(),
        ));
        tokio::spawn(write_uploads(
            author,
            uploads_rx,
            uploads_sink,
            self.reporter.clone(),
            self.requests.clone(),
        ));

        let mut link = ClientLink::new(author, instructions_tx, uploads_tx);
        for (channel, stream) in [
            (Channel::Instructions, instructions_stream),
            (Channel::Uploads, uploads_stream),
        ] {
            link.attach(tokio::spawn(ingress(
                author,
                channel,
                stream,
                self.requests.clone(),
                self.reporter.clone(),
                self.counters.clone(),
            )));
        }
        self.fanout.insert(link);
        self.counters
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        log::info!(
            "Client {author} joined space {} ({history} records to catch up)",
            self.space
        );
        Ok(author)
    }

    fn handle(&mut self, from: AuthorId, instruction: Instruction) {
        if let (true, Instruction::BirdsEyeView(view)) = (from.is_host(), &instruction) {
            self.viewpoint = view.clone();
        }

        match self.log.write(&instruction) {
            Ok(Written::Dropped) => {
                self.counters
                    .instructions_dropped
                    .fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped {:?} from {from}: out of author bounds", instruction.tag());
                return;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::MalformedRecord => {
                // Cannot be encoded, so there is nothing to fan out either.
                self.reporter.report(e);
                return;
            }
            Err(e) => self.reporter.report(e),
        }
        self.counters
            .records
            .store(self.log.records(), Ordering::Relaxed);

        let packet: Packet = match instruction.encode_packet() {
            Ok(packet) => Arc::new(packet),
            Err(e) => {
                self.reporter.report(e);
                return;
            }
        };
        let channel = if instruction.is_media() {
            Channel::Uploads
        } else {
            Channel::Instructions
        };
        let delivered = self.fanout.broadcast(channel, packet, &*self.reporter);
        log::trace!(
            "Fanned out {:?} from {from} to {delivered} clients",
            instruction.tag()
        );
    }

    fn publish_viewpoint(&mut self) {
        let view = BirdsEyeView {
            author: AuthorId::HOST,
            timing: wall_nanos(),
            ..self.viewpoint.clone()
        };
        self.handle(AuthorId::HOST, view.into());
    }

    fn switch_space(&mut self, space: SpaceId, path: PathBuf) -> Result<()> {
        let store = LogStore::open(&path, self.config.replay_limit, self.observer.clone())?;
        let previous = std::mem::replace(&mut self.log, store);
        if let Err(e) = previous.close() {
            self.reporter.report(e);
        }

        let evicted = self.fanout.clear();
        self.counters
            .clients_switched_out
            .fetch_add(evicted as u64, Ordering::Relaxed);
        self.counters
            .records
            .store(self.log.records(), Ordering::Relaxed);
        self.space = space;
        self.config.space = space;
        self.config.log_path = path;

        log::info!(
            "Switched to space {space} ({} records), evicted {evicted} clients",
            self.log.records()
        );
        Ok(())
    }
}

/// The log prefix a new client must see before live traffic.
struct CatchUp {
    path: PathBuf,
    records: u64,
    buffer: usize,
}

impl CatchUp {
    /// Stream the prefix into `sink`. The file is read on the blocking pool
    /// with at most `buffer` records in flight.
    async fn send(self, sink: &mut PacketSink) -> Result<()> {
        if self.records == 0 {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::channel::<Result<Vec<u8>>>(self.buffer);
        let CatchUp { path, records, .. } = self;
        tokio::task::spawn_blocking(move || {
            let reader = match LogReader::open(&path) {
                Ok(reader) => reader.with_limit(records),
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            for record in reader {
                let failed = record.is_err();
                if tx.blocking_send(record.map(|r| r.bytes)).is_err() || failed {
                    return;
                }
            }
        });

        let mut sent = 0;
        while let Some(record) = rx.recv().await {
            sink.send(record?).await?;
            sent += 1;
        }
        if sent < records {
            log::warn!("Catch-up sent {sent} of {records} records");
        }
        Ok(())
    }
}

async fn write_instructions(
    author: AuthorId,
    assign: Vec<u8>,
    catch_up: CatchUp,
    mut live: mpsc::Receiver<Packet>,
    mut sink: PacketSink,
    reporter: Arc<dyn ErrorReporter>,
    requests: mpsc::Sender<Request>,
) {
    let result: Result<()> = async {
        sink.send(assign).await?;
        catch_up.send(&mut sink).await?;
        log::debug!("Client {author} caught up");
        drain_queue(&mut live, &mut sink).await
    }
    .await;

    if let Err(e) = result {
        reporter.report(e);
        let _ = requests.send(Request::Disconnect(author)).await;
    }
}

async fn write_uploads(
    author: AuthorId,
    mut queue: mpsc::Receiver<Packet>,
    mut sink: PacketSink,
    reporter: Arc<dyn ErrorReporter>,
    requests: mpsc::Sender<Request>,
) {
    if let Err(e) = drain_queue(&mut queue, &mut sink).await {
        reporter.report(e);
        let _ = requests.send(Request::Disconnect(author)).await;
    }
}

async fn ingress(
    author: AuthorId,
    channel: Channel,
    mut stream: PacketStream,
    requests: mpsc::Sender<Request>,
    reporter: Arc<dyn ErrorReporter>,
    counters: Arc<HostCounters>,
) {
    while let Some(packet) = stream.next().await {
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                reporter.report(e);
                break;
            }
        };
        let decoded = match channel {
            Channel::Instructions => Instruction::decode(&packet),
            Channel::Uploads => Instruction::decode_packet(&packet),
        };
        let instruction = match decoded {
            Ok(instruction) => instruction,
            Err(e) => {
                reporter.report(e);
                continue;
            }
        };
        if let Err(e) = validate(&instruction, author) {
            counters.forgeries_rejected.fetch_add(1, Ordering::Relaxed);
            reporter.report(e);
            continue;
        }
        log::trace!("{:?} from {author} on {channel:?}", instruction.tag());
        if requests
            .send(Request::Instruction { from: author, instruction })
            .await
            .is_err()
        {
            return;
        }
    }
    log::info!("Client {author} closed its {channel:?} pipe");
    let _ = requests.send(Request::Disconnect(author)).await;
}
