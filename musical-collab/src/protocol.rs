//! Instruction set shared by the host, its clients and the space log.
//!
//! ```text
//! tag │ variant        │ persisted            │ pipe
//! ────┼────────────────┼──────────────────────┼──────────────
//!  1  │ Orchestrator   │ iff !assign          │ Instructions
//!  2  │ DesignImport   │ always               │ Instructions
//!  3  │ DesignUpload   │ always (record only) │ MediaUploads
//!  4  │ Contribution   │ iff commit           │ Instructions
//!  5  │ Relationship   │ iff commit           │ Instructions
//!  6  │ AreaToSculpt   │ iff commit           │ Instructions
//!  7  │ BirdsEyeView   │ never                │ Instructions
//! ```
//!
//! Field order inside each struct is the wire order (see [`crate::codec`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 16-byte identifier of a shared space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpaceId(pub Uuid);

impl SpaceId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SpaceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Participant identity within a space. Author 0 is the host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AuthorId(pub u16);

impl AuthorId {
    pub const HOST: AuthorId = AuthorId(0);

    pub fn is_host(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An object within a space, numbered per author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntityId {
    pub author: AuthorId,
    pub number: u16,
}

impl EntityId {
    pub fn new(author: u16, number: u16) -> Self {
        Self { author: AuthorId(author), number }
    }

    /// `(0, 0)` means "no entity".
    pub fn is_none(&self) -> bool {
        self.author.0 == 0 && self.number == 0
    }
}

/// A reusable asset reference, numbered per author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DesignId {
    pub author: AuthorId,
    pub number: u16,
}

impl DesignId {
    pub fn new(author: u16, number: u16) -> Self {
        Self { author: AuthorId(author), number }
    }

    /// `(0, 0)` means "no design".
    pub fn is_none(&self) -> bool {
        self.author.0 == 0 && self.number == 0
    }
}

/// 3-component vector in scene space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// RGBA colour, components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// A file blob attached to a `DesignUpload`.
///
/// Only `name` is part of the record; `data` rides behind the record on the
/// MediaUploads pipe and is never written to the log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Upload {
    pub name: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { name: name.into(), data }
    }
}

/// Assigns or confirms authorship.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Orchestrator {
    pub record: SpaceId,
    /// Instructions in the log so far
    pub number: u64,
    pub author: AuthorId,
    pub assign: bool,
}

/// Binds a URI to a design.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesignImport {
    pub design: DesignId,
    pub uri: String,
}

/// Binds an uploaded file to a design.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesignUpload {
    pub design: DesignId,
    pub upload: Upload,
}

/// Adds, updates or removes an object in the scene.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Contribution {
    pub author: AuthorId,
    pub entity: EntityId,
    pub design: DesignId,
    pub offset: Vec3,
    pub bounds: Vec3,
    pub angles: Vec3,
    pub colour: Rgba,
    pub timing: i64,
    pub remove: bool,
    pub tweens: bool,
    pub commit: bool,
}

/// Attaches or detaches a child entity to a parent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub author: AuthorId,
    pub entity: EntityId,
    pub parent: EntityId,
    pub attach: bool,
    pub follow: bool,
    pub commit: bool,
}

/// Deforms terrain or applies a texture brush.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AreaToSculpt {
    pub author: AuthorId,
    pub design: DesignId,
    pub target: Vec3,
    pub radius: f32,
    pub amount: f32,
    pub commit: bool,
}

/// Per-author viewpoint. Never persisted.
///
/// When sent by the host, `timing` is the leader clock.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BirdsEyeView {
    pub author: AuthorId,
    pub design: DesignId,
    pub offset: Vec3,
    pub angles: Vec3,
    pub bounds: Vec3,
    pub colour: Rgba,
    /// Nanoseconds since the Unix epoch
    pub timing: i64,
}

/// Wire tag of each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InstructionTag {
    Orchestrator = 1,
    DesignImport = 2,
    DesignUpload = 3,
    Contribution = 4,
    Relationship = 5,
    AreaToSculpt = 6,
    BirdsEyeView = 7,
}

impl InstructionTag {
    pub const ALL: [InstructionTag; 7] = [
        InstructionTag::Orchestrator,
        InstructionTag::DesignImport,
        InstructionTag::DesignUpload,
        InstructionTag::Contribution,
        InstructionTag::Relationship,
        InstructionTag::AreaToSculpt,
        InstructionTag::BirdsEyeView,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(InstructionTag::Orchestrator),
            2 => Some(InstructionTag::DesignImport),
            3 => Some(InstructionTag::DesignUpload),
            4 => Some(InstructionTag::Contribution),
            5 => Some(InstructionTag::Relationship),
            6 => Some(InstructionTag::AreaToSculpt),
            7 => Some(InstructionTag::BirdsEyeView),
            _ => None,
        }
    }

    /// Zero-based position, handy for per-variant tables.
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

/// One atomic wire-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Instruction {
    Orchestrator(Orchestrator),
    DesignImport(DesignImport),
    DesignUpload(DesignUpload),
    Contribution(Contribution),
    Relationship(Relationship),
    AreaToSculpt(AreaToSculpt),
    BirdsEyeView(BirdsEyeView),
}

impl Instruction {
    pub fn tag(&self) -> InstructionTag {
        match self {
            Instruction::Orchestrator(_) => InstructionTag::Orchestrator,
            Instruction::DesignImport(_) => InstructionTag::DesignImport,
            Instruction::DesignUpload(_) => InstructionTag::DesignUpload,
            Instruction::Contribution(_) => InstructionTag::Contribution,
            Instruction::Relationship(_) => InstructionTag::Relationship,
            Instruction::AreaToSculpt(_) => InstructionTag::AreaToSculpt,
            Instruction::BirdsEyeView(_) => InstructionTag::BirdsEyeView,
        }
    }

    /// The author the instruction claims, for variants that carry one.
    pub fn author(&self) -> Option<AuthorId> {
        match self {
            Instruction::Orchestrator(o) => Some(o.author),
            Instruction::DesignImport(_) | Instruction::DesignUpload(_) => None,
            Instruction::Contribution(c) => Some(c.author),
            Instruction::Relationship(r) => Some(r.author),
            Instruction::AreaToSculpt(a) => Some(a.author),
            Instruction::BirdsEyeView(v) => Some(v.author),
        }
    }

    /// Whether the instruction belongs in the log.
    pub fn is_committed(&self) -> bool {
        match self {
            Instruction::Orchestrator(o) => !o.assign,
            Instruction::DesignImport(_) | Instruction::DesignUpload(_) => true,
            Instruction::Contribution(c) => c.commit,
            Instruction::Relationship(r) => r.commit,
            Instruction::AreaToSculpt(a) => a.commit,
            Instruction::BirdsEyeView(_) => false,
        }
    }

    /// Media instructions travel on the MediaUploads pipe.
    pub fn is_media(&self) -> bool {
        matches!(self, Instruction::DesignUpload(_))
    }

    pub fn is_assignment(&self) -> bool {
        matches!(self, Instruction::Orchestrator(o) if o.assign)
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Instruction {
                fn from(value: $variant) -> Self {
                    Instruction::$variant(value)
                }
            }
        )*
    };
}

impl_from_variant!(
    Orchestrator,
    DesignImport,
    DesignUpload,
    Contribution,
    Relationship,
    AreaToSculpt,
    BirdsEyeView,
);
