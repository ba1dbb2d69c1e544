//! Packet pipes between a session and its peer.
//!
//! A session never sees sockets: it gets a [`Connection`], two
//! pre-established duplex pipes that each carry whole packets.
//!
//! ```text
//!            Connection
//!   ┌──────────────────────────┐
//!   │ instructions: sink/stream│  ordered, one record per packet
//!   │ uploads:      sink/stream│  record + blob, best effort
//!   └──────────────────────────┘
//! ```
//!
//! [`Pipe::pair`] builds an in-memory pipe for tests and in-process peers;
//! `crate::transport` builds one over WebSocket.

use std::pin::Pin;

use futures_util::{sink, stream, Sink, Stream};
use tokio::sync::mpsc;

use crate::error::{Result, SpaceError};

pub type PacketSink = Pin<Box<dyn Sink<Vec<u8>, Error = SpaceError> + Send>>;
pub type PacketStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// One duplex packet pipe.
pub struct Pipe {
    pub sink: PacketSink,
    pub stream: PacketStream,
}

impl Pipe {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Vec<u8>, Error = SpaceError> + Send + 'static,
        St: Stream<Item = Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Two connected in-memory ends. Dropping one end's sink ends the other
    /// end's stream.
    pub fn pair(capacity: usize) -> (Pipe, Pipe) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Pipe::new(channel_sink(a_tx), channel_stream(b_rx)),
            Pipe::new(channel_sink(b_tx), channel_stream(a_rx)),
        )
    }

    pub fn split(self) -> (PacketSink, PacketStream) {
        (self.sink, self.stream)
    }
}

fn channel_sink(tx: mpsc::Sender<Vec<u8>>) -> impl Sink<Vec<u8>, Error = SpaceError> + Send {
    sink::unfold(tx, |tx, packet: Vec<u8>| async move {
        tx.send(packet)
            .await
            .map_err(|_| SpaceError::pipe("peer closed the pipe"))?;
        Ok::<_, SpaceError>(tx)
    })
}

fn channel_stream(rx: mpsc::Receiver<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>>> + Send {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|packet| (Ok(packet), rx))
    })
}

/// The pipe pair a session runs over.
pub struct Connection {
    pub instructions: Pipe,
    pub uploads: Pipe,
}

impl Connection {
    pub fn new(instructions: Pipe, uploads: Pipe) -> Self {
        Self { instructions, uploads }
    }

    /// Two connected in-memory connections: hand one to the host, the other
    /// to a client.
    pub fn pair(capacity: usize) -> (Connection, Connection) {
        let (instructions_a, instructions_b) = Pipe::pair(capacity);
        let (uploads_a, uploads_b) = Pipe::pair(capacity);
        (
            Connection::new(instructions_a, uploads_a),
            Connection::new(instructions_b, uploads_b),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_pipe_pair_is_duplex() {
        let (mut left, mut right) = Pipe::pair(4);
        left.sink.send(vec![1, 2, 3]).await.unwrap();
        right.sink.send(vec![9]).await.unwrap();

        assert_eq!(right.stream.next().await.unwrap().unwrap(), vec![1, 2, 3]);
        assert_eq!(left.stream.next().await.unwrap().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_dropping_sink_ends_peer_stream() {
        let (left, mut right) = Pipe::pair(4);
        let (mut sink, _stream) = left.split();
        sink.send(vec![7]).await.unwrap();
        drop(sink);

        assert_eq!(right.stream.next().await.unwrap().unwrap(), vec![7]);
        assert!(right.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (mut left, right) = Pipe::pair(4);
        drop(right);
        let err = left.sink.send(vec![1]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PipeBroken);
    }

    #[tokio::test]
    async fn test_connection_pair_keeps_pipes_apart() {
        let (mut host, mut client) = Connection::pair(4);
        client.uploads.sink.send(vec![3]).await.unwrap();
        client.instructions.sink.send(vec![4]).await.unwrap();

        assert_eq!(host.instructions.stream.next().await.unwrap().unwrap(), vec![4]);
        assert_eq!(host.uploads.stream.next().await.unwrap().unwrap(), vec![3]);
    }
}
