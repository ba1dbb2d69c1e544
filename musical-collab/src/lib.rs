//! # musical-collab: shared creative space protocol
//!
//! Participants edit one 3D scene through a single host. The host assigns
//! authors, records every committed instruction in an append-only log and
//! fans each accepted instruction out to every participant, the sender
//! included.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   instructions pipe   ┌─────────────┐
//! │ Client      │ ◄───────────────────► │ Host        │
//! │ (per user)  │   uploads pipe        │ (leader)    │
//! └──────┬──────┘ ◄───────────────────► └──────┬──────┘
//!        │                                     │
//!        ▼                                     ├──► LogStore (space file)
//! ┌─────────────┐                              │
//! │ Observer    │ ◄── every instruction ───────┤
//! │ Clock       │ ◄── host viewpoints          └──► FanOut ──► every client
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Instruction variants and identifiers
//! - [`codec`]: Bitmap-prefixed little-endian record codec
//! - [`storage`]: Append-only space log with author limits
//! - [`session`]: Host event loop and joining client
//! - [`broadcast`]: Per-client bounded fan-out with eviction
//! - [`clock`]: Leader-clock estimation from host viewpoints
//! - [`pipe`]: Packet pipes sessions run over
//! - [`transport`]: WebSocket pipes
//! - [`observer`]: Instruction sinks for the application
//! - [`config`]: Host and client settings
//! - [`error`]: Error type, kinds and reporters

pub mod broadcast;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod observer;
pub mod pipe;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{Channel, FanOut, FanOutStats, Packet};
pub use clock::{Clock, SharedClock};
pub use codec::Decoder;
pub use config::{ClientConfig, HostConfig};
pub use error::{ErrorKind, ErrorReporter, LogReporter, Result, SpaceError};
pub use observer::{InstructionCounter, InstructionCounts, NullObserver, Observer, Observers};
pub use pipe::{Connection, Pipe};
pub use protocol::{
    AreaToSculpt, AuthorId, BirdsEyeView, Contribution, DesignId, DesignImport, DesignUpload,
    EntityId, Instruction, InstructionTag, Orchestrator, Relationship, Rgba, SpaceId, Upload,
    Vec3,
};
pub use session::{Client, Host, HostHandle, HostStats};
pub use storage::{AuthorLimits, LogReader, LogRecord, LogStore, Written, MAGIC};
