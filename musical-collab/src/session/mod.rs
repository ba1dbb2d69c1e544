//! Sessions: the host event loop and the client that joins it.
//!
//! ```text
//!  Client A ──┐  instructions / uploads         ┌── LogStore ── file
//!             ├─────────► ingress tasks ──► request ──► HostLoop
//!  Client B ──┘                                 └── FanOut ──► every client
//! ```
//!
//! Both roles share the validation table and the queue-draining writer
//! task defined here.

pub mod client;
pub mod host;

pub use client::Client;
pub use host::{Host, HostHandle, HostStats};

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::mpsc;

use crate::broadcast::Packet;
use crate::error::{Result, SpaceError};
use crate::pipe::PacketSink;
use crate::protocol::{AuthorId, Instruction};

/// Whether a session with author `session` may send `instruction`.
///
/// | Instruction    | accepted iff                 |
/// |----------------|------------------------------|
/// | Orchestrator   | `!assign && author == A`     |
/// | DesignImport   | always                       |
/// | DesignUpload   | always                       |
/// | others         | `author == A`                |
pub fn validate(instruction: &Instruction, session: AuthorId) -> Result<()> {
    let claimed = match instruction {
        Instruction::DesignImport(_) | Instruction::DesignUpload(_) => return Ok(()),
        Instruction::Orchestrator(o) if o.assign => {
            return Err(SpaceError::AuthorForgery { session, claimed: o.author });
        }
        other => other.author().unwrap_or(AuthorId::HOST),
    };
    if claimed == session {
        Ok(())
    } else {
        Err(SpaceError::AuthorForgery { session, claimed })
    }
}

fn unshare(packet: Packet) -> Vec<u8> {
    Arc::try_unwrap(packet).unwrap_or_else(|shared| shared.as_ref().clone())
}

/// Forward queued packets into `sink` until the queue closes, then close
/// the sink.
pub(crate) async fn drain_queue(
    queue: &mut mpsc::Receiver<Packet>,
    sink: &mut PacketSink,
) -> Result<()> {
    while let Some(packet) = queue.recv().await {
        sink.send(unshare(packet)).await?;
    }
    sink.close().await
}
