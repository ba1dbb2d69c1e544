//! The client side of a session.
//!
//! A client learns who it is from the host: the first packet on its
//! instructions pipe is an `Orchestrator { assign: true }` carrying its
//! author, the space and how many historical records follow. After that
//! the client only decodes and observes; it applies its own mutations when
//! the host echoes them back, so every replica sees the host's order.
//!
//! Reference: Kleppmann, Chapter 5, Replication (single leader)

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broadcast::{Channel, Packet};
use crate::clock::{wall_nanos, SharedClock};
use crate::config::ClientConfig;
use crate::error::{ErrorReporter, Result, SpaceError};
use crate::observer::Observer;
use crate::pipe::{Connection, PacketSink, PacketStream};
use crate::protocol::{AuthorId, Instruction, SpaceId};
use crate::session::drain_queue;

/// A joined participant.
pub struct Client {
    author: AuthorId,
    space: SpaceId,
    catch_up_len: u64,
    clock: SharedClock,
    caught_up: watch::Receiver<bool>,
    instructions: mpsc::Sender<Packet>,
    uploads: mpsc::Sender<Packet>,
    reporter: Arc<dyn ErrorReporter>,
    writers: Vec<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl Client {
    /// Wait for the host's assignment, then start the session tasks.
    pub async fn join(
        connection: Connection,
        config: ClientConfig,
        observer: Arc<dyn Observer>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Client> {
        let (instructions_sink, mut instructions_stream) = connection.instructions.split();
        let (uploads_sink, uploads_stream) = connection.uploads.split();

        let first = instructions_stream
            .next()
            .await
            .ok_or_else(|| SpaceError::pipe("host closed the pipe before assigning an author"))??;
        let assign = match Instruction::decode(&first)? {
            Instruction::Orchestrator(o) if o.assign => o,
            other => {
                return Err(SpaceError::malformed(format!(
                    "expected an author assignment, got {:?}",
                    other.tag()
                )));
            }
        };
        if let Err(e) = observer.observe(&Instruction::from(assign.clone())) {
            reporter.report(e);
        }
        log::info!(
            "Joined space {} as {} ({} records to catch up)",
            assign.record,
            assign.author,
            assign.number
        );

        let clock = SharedClock::new();
        let (caught_up_tx, caught_up) = watch::channel(assign.number == 0);
        let (instructions, instructions_rx) = mpsc::channel(config.outbound_capacity);
        let (uploads, uploads_rx) = mpsc::channel(config.outbound_capacity);

        let writers = vec![
            tokio::spawn(write_queue(
                Channel::Instructions,
                instructions_rx,
                instructions_sink,
                reporter.clone(),
            )),
            tokio::spawn(write_queue(
                Channel::Uploads,
                uploads_rx,
                uploads_sink,
                reporter.clone(),
            )),
        ];
        let readers = vec![
            tokio::spawn(
                ReceiveLoop {
                    channel: Channel::Instructions,
                    observer: observer.clone(),
                    reporter: reporter.clone(),
                    clock: clock.clone(),
                    history: assign.number,
                    caught_up: Some(caught_up_tx),
                }
                .run(instructions_stream),
            ),
            tokio::spawn(
                ReceiveLoop {
                    channel: Channel::Uploads,
                    observer,
                    reporter: reporter.clone(),
                    clock: clock.clone(),
                    history: 0,
                    caught_up: None,
                }
                .run(uploads_stream),
            ),
        ];

        Ok(Client {
            author: assign.author,
            space: assign.record,
            catch_up_len: assign.number,
            clock,
            caught_up,
            instructions,
            uploads,
            reporter,
            writers,
            readers,
        })
    }

    pub fn author(&self) -> AuthorId {
        self.author
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Historical records the host announced at join time.
    pub fn catch_up_len(&self) -> u64 {
        self.catch_up_len
    }

    /// Resolves once every announced historical record has been observed.
    pub async fn wait_caught_up(&self) -> Result<()> {
        let mut caught_up = self.caught_up.clone();
        let done = caught_up.wait_for(|done| *done).await.map(|_| ());
        done.map_err(|_| SpaceError::pipe("instructions pipe closed during catch-up"))
    }

    /// Leader clock fed by the host's viewpoints.
    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Queue an instruction for the host. Failures are reported, not
    /// returned.
    pub async fn send(&self, instruction: Instruction) {
        let packet = match instruction.encode_packet() {
            Ok(packet) => Arc::new(packet),
            Err(e) => {
                self.reporter.report(e);
                return;
            }
        };
        let (queue, channel) = if instruction.is_media() {
            (&self.uploads, Channel::Uploads)
        } else {
            (&self.instructions, Channel::Instructions)
        };
        log::trace!("Sending {:?} on {channel:?}", instruction.tag());
        if queue.send(packet).await.is_err() {
            self.reporter
                .report(SpaceError::pipe(format!("{channel:?} writer has stopped")));
        }
    }

    /// Flush queued sends, close both pipes and stop receiving.
    pub async fn close(self) {
        let Client {
            author,
            instructions,
            uploads,
            writers,
            readers,
            ..
        } = self;
        drop(instructions);
        drop(uploads);
        for writer in writers {
            let _ = writer.await;
        }
        for reader in readers {
            reader.abort();
        }
        log::info!("Client {author} closed");
    }
}

async fn write_queue(
    channel: Channel,
    mut queue: mpsc::Receiver<Packet>,
    mut sink: PacketSink,
    reporter: Arc<dyn ErrorReporter>,
) {
    if let Err(e) = drain_queue(&mut queue, &mut sink).await {
        log::warn!("{channel:?} writer stopped: {e}");
        reporter.report(e);
    }
}

/// One receive loop.
struct ReceiveLoop {
    channel: Channel,
    observer: Arc<dyn Observer>,
    reporter: Arc<dyn ErrorReporter>,
    clock: SharedClock,
    /// Historical packets still expected
    history: u64,
    caught_up: Option<watch::Sender<bool>>,
}

impl ReceiveLoop {
    async fn run(mut self, mut stream: PacketStream) {
        while let Some(packet) = stream.next().await {
            match packet {
                Ok(packet) => self.receive(&packet),
                Err(e) => {
                    self.reporter.report(e);
                    break;
                }
            }
        }
        log::info!("Host closed the {:?} pipe", self.channel);
    }

    fn receive(&mut self, packet: &[u8]) {
        let decoded = match self.channel {
            Channel::Instructions => Instruction::decode(packet),
            Channel::Uploads => Instruction::decode_packet(packet),
        };
        match decoded {
            Ok(instruction) => {
                if let Instruction::BirdsEyeView(view) = &instruction {
                    if view.author.is_host() {
                        self.clock.sample(view.timing, wall_nanos());
                    }
                }
                if let Err(e) = self.observer.observe(&instruction) {
                    self.reporter.report(e);
                }
            }
            Err(e) => self.reporter.report(e),
        }

        if self.history > 0 {
            self.history -= 1;
            if self.history == 0 {
                if let Some(caught_up) = &self.caught_up {
                    caught_up.send_replace(true);
                }
                log::debug!("Catch-up complete");
            }
        }
    }
}
