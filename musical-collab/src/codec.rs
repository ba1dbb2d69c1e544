//! Bit-exact wire codec for [`Instruction`]s.
//!
//! Wire format (all integers little-endian):
//! ```text
//! ┌──────────┬──────────────┬─────────────────────────────────────┐
//! │ tag      │ presence     │ present fields, declaration order   │
//! │ 1 byte   │ u16 bitmap   │ variable                            │
//! └──────────┴──────────────┴─────────────────────────────────────┘
//! ```
//!
//! Bit *i* of the bitmap is set iff field *i* is non-default. Booleans are
//! carried by their bit alone, strings are `u16` length + bytes, ids are
//! `author: u16, number: u16`, vectors are packed `f32`s.
//!
//! A MediaUploads packet is the `DesignUpload` record followed by the raw
//! upload bytes; the transport frames packets so the tail needs no length.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Result, SpaceError};
use crate::protocol::{
    AreaToSculpt, AuthorId, BirdsEyeView, Contribution, DesignId, DesignImport, DesignUpload,
    EntityId, Instruction, InstructionTag, Orchestrator, Relationship, Rgba, SpaceId, Upload,
    Vec3,
};

/// Tag byte plus presence bitmap.
pub const RECORD_HEADER_LEN: usize = 3;

/// Longest string a record can carry.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

// ───────────────────────────────────────────────────────────────────
// Field encoding
// ───────────────────────────────────────────────────────────────────

/// Byte source that remembers how far it has read, for error offsets.
pub(crate) struct FieldReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> FieldReader<R> {
    fn new(inner: R, offset: u64) -> Self {
        Self { inner, offset }
    }

    /// Fill `buf` completely. Returns the number of bytes read, which is
    /// only short of `buf.len()` when the source hit EOF.
    fn fill_partial(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.fill_partial(buf)?;
        if got < buf.len() {
            return Err(SpaceError::Truncated {
                offset: self.offset,
                needed: buf.len() - got,
            });
        }
        Ok(())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(&self.array::<2>()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(&self.array::<4>()?))
    }
}

/// A value that can appear as a record field.
pub(crate) trait WireField: Sized + Default {
    fn is_default(&self) -> bool;
    fn put(&self, buf: &mut Vec<u8>) -> Result<()>;
    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self>;
}

impl WireField for bool {
    fn is_default(&self) -> bool {
        !*self
    }

    fn put(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn take<R: Read>(_src: &mut FieldReader<R>) -> Result<Self> {
        Ok(true)
    }
}

impl WireField for u64 {
    fn is_default(&self) -> bool {
        *self == 0
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<LittleEndian>(*self)?;
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(LittleEndian::read_u64(&src.array::<8>()?))
    }
}

impl WireField for i64 {
    fn is_default(&self) -> bool {
        *self == 0
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_i64::<LittleEndian>(*self)?;
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(LittleEndian::read_i64(&src.array::<8>()?))
    }
}

impl WireField for f32 {
    fn is_default(&self) -> bool {
        *self == 0.0
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_f32::<LittleEndian>(*self)?;
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        src.f32()
    }
}

impl WireField for AuthorId {
    fn is_default(&self) -> bool {
        self.0 == 0
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u16::<LittleEndian>(self.0)?;
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        src.u16().map(AuthorId)
    }
}

impl WireField for SpaceId {
    fn is_default(&self) -> bool {
        self.is_nil()
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        src.array::<16>().map(SpaceId::from_bytes)
    }
}

impl WireField for EntityId {
    fn is_default(&self) -> bool {
        self.is_none()
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u16::<LittleEndian>(self.author.0)?;
        buf.write_u16::<LittleEndian>(self.number)?;
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(EntityId::new(src.u16()?, src.u16()?))
    }
}

impl WireField for DesignId {
    fn is_default(&self) -> bool {
        self.is_none()
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u16::<LittleEndian>(self.author.0)?;
        buf.write_u16::<LittleEndian>(self.number)?;
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(DesignId::new(src.u16()?, src.u16()?))
    }
}

impl WireField for Vec3 {
    fn is_default(&self) -> bool {
        self.to_array().iter().all(|c| *c == 0.0)
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        for c in self.to_array() {
            buf.write_f32::<LittleEndian>(c)?;
        }
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(Vec3::new(src.f32()?, src.f32()?, src.f32()?))
    }
}

impl WireField for Rgba {
    fn is_default(&self) -> bool {
        self.to_array().iter().all(|c| *c == 0.0)
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        for c in self.to_array() {
            buf.write_f32::<LittleEndian>(c)?;
        }
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(Rgba::new(src.f32()?, src.f32()?, src.f32()?, src.f32()?))
    }
}

impl WireField for String {
    fn is_default(&self) -> bool {
        self.is_empty()
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.len() > MAX_STRING_LEN {
            return Err(SpaceError::malformed(format!(
                "string of {} bytes exceeds {MAX_STRING_LEN}",
                self.len()
            )));
        }
        buf.write_u16::<LittleEndian>(self.len() as u16)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        let len = src.u16()? as usize;
        let mut bytes = vec![0u8; len];
        src.fill(&mut bytes)?;
        String::from_utf8(bytes).map_err(|e| SpaceError::malformed(format!("string field: {e}")))
    }
}

impl WireField for Upload {
    fn is_default(&self) -> bool {
        self.name.is_empty() && self.data.is_empty()
    }

    fn put(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.name.put(buf)
    }

    fn take<R: Read>(src: &mut FieldReader<R>) -> Result<Self> {
        Ok(Upload {
            name: String::take(src)?,
            data: Vec::new(),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// Accumulates present fields and their bitmap.
pub(crate) struct RecordWriter {
    buf: Vec<u8>,
    bitmap: u16,
    bit: u16,
}

impl RecordWriter {
    fn new(tag: InstructionTag) -> Self {
        let mut buf = Vec::with_capacity(48);
        buf.extend_from_slice(&[tag as u8, 0, 0]);
        Self { buf, bitmap: 0, bit: 0 }
    }

    fn field<F: WireField>(&mut self, value: &F) -> Result<()> {
        if !value.is_default() {
            self.bitmap |= 1 << self.bit;
            value.put(&mut self.buf)?;
        }
        self.bit += 1;
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        LittleEndian::write_u16(&mut self.buf[1..RECORD_HEADER_LEN], self.bitmap);
        self.buf
    }
}

/// Materializes fields in declaration order according to a bitmap.
pub(crate) struct RecordReader<'a, R> {
    src: &'a mut FieldReader<R>,
    bitmap: u16,
    bit: u16,
}

impl<R: Read> RecordReader<'_, R> {
    fn field<F: WireField>(&mut self) -> Result<F> {
        let present = self.bitmap & (1 << self.bit) != 0;
        self.bit += 1;
        if present {
            F::take(&mut *self.src)
        } else {
            Ok(F::default())
        }
    }
}

/// A variant's statically known field list.
pub(crate) trait Record: Sized {
    const TAG: InstructionTag;
    const FIELDS: u16;

    fn write_fields(&self, w: &mut RecordWriter) -> Result<()>;
    fn read_fields<R: Read>(r: &mut RecordReader<'_, R>) -> Result<Self>;

    fn encode_record(&self) -> Result<Vec<u8>> {
        let mut w = RecordWriter::new(Self::TAG);
        self.write_fields(&mut w)?;
        Ok(w.finish())
    }
}

macro_rules! wire_record {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl Record for $ty {
            const TAG: InstructionTag = InstructionTag::$ty;
            const FIELDS: u16 = [$(stringify!($field)),+].len() as u16;

            fn write_fields(&self, w: &mut RecordWriter) -> Result<()> {
                $( w.field(&self.$field)?; )+
                Ok(())
            }

            fn read_fields<R: Read>(r: &mut RecordReader<'_, R>) -> Result<Self> {
                Ok(Self { $( $field: r.field()?, )+ })
            }
        }
    };
}

wire_record!(Orchestrator { record, number, author, assign });
wire_record!(DesignImport { design, uri });
wire_record!(DesignUpload { design, upload });
wire_record!(Contribution {
    author, entity, design, offset, bounds, angles, colour, timing, remove, tweens, commit,
});
wire_record!(Relationship { author, entity, parent, attach, follow, commit });
wire_record!(AreaToSculpt { author, design, target, radius, amount, commit });
wire_record!(BirdsEyeView { author, design, offset, angles, bounds, colour, timing });

fn read_record<T: Record, R: Read>(src: &mut FieldReader<R>, bitmap: u16) -> Result<T> {
    if bitmap >> T::FIELDS != 0 {
        return Err(SpaceError::malformed(format!(
            "{:?} bitmap {bitmap:#06x} names more than {} fields",
            T::TAG,
            T::FIELDS
        )));
    }
    T::read_fields(&mut RecordReader { src, bitmap, bit: 0 })
}

/// Streaming decoder over back-to-back records.
///
/// EOF exactly at a record boundary ends the stream; EOF anywhere else is
/// [`SpaceError::Truncated`].
pub struct Decoder<R> {
    src: FieldReader<R>,
}

impl<R: Read> Decoder<R> {
    /// `offset` is the absolute position of `reader` (used in errors).
    pub fn new(reader: R, offset: u64) -> Self {
        Self {
            src: FieldReader::new(reader, offset),
        }
    }

    /// Absolute offset just past the last byte consumed.
    pub fn offset(&self) -> u64 {
        self.src.offset
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.src.inner
    }

    pub fn next_instruction(&mut self) -> Result<Option<Instruction>> {
        let mut tag = [0u8; 1];
        if self.src.fill_partial(&mut tag)? == 0 {
            return Ok(None);
        }
        let tag = InstructionTag::from_u8(tag[0]).ok_or_else(|| {
            SpaceError::malformed(format!("unknown instruction tag {}", tag[0]))
        })?;
        let bitmap = self.src.u16()?;
        let src = &mut self.src;
        let instruction = match tag {
            InstructionTag::Orchestrator => Instruction::Orchestrator(read_record(src, bitmap)?),
            InstructionTag::DesignImport => Instruction::DesignImport(read_record(src, bitmap)?),
            InstructionTag::DesignUpload => Instruction::DesignUpload(read_record(src, bitmap)?),
            InstructionTag::Contribution => Instruction::Contribution(read_record(src, bitmap)?),
            InstructionTag::Relationship => Instruction::Relationship(read_record(src, bitmap)?),
            InstructionTag::AreaToSculpt => Instruction::AreaToSculpt(read_record(src, bitmap)?),
            InstructionTag::BirdsEyeView => Instruction::BirdsEyeView(read_record(src, bitmap)?),
        };
        Ok(Some(instruction))
    }
}

impl<R: Read> Iterator for Decoder<R> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_instruction().transpose()
    }
}

impl Instruction {
    /// Encode the record form (what the log stores).
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Instruction::Orchestrator(i) => i.encode_record(),
            Instruction::DesignImport(i) => i.encode_record(),
            Instruction::DesignUpload(i) => i.encode_record(),
            Instruction::Contribution(i) => i.encode_record(),
            Instruction::Relationship(i) => i.encode_record(),
            Instruction::AreaToSculpt(i) => i.encode_record(),
            Instruction::BirdsEyeView(i) => i.encode_record(),
        }
    }

    /// Encode the packet form: the record, plus the upload bytes for media.
    pub fn encode_packet(&self) -> Result<Vec<u8>> {
        let mut packet = self.encode()?;
        if let Instruction::DesignUpload(u) = self {
            packet.extend_from_slice(&u.upload.data);
        }
        Ok(packet)
    }

    /// Decode exactly one record. Trailing bytes are malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (instruction, rest) = decode_prefix(bytes)?;
        if !rest.is_empty() {
            return Err(SpaceError::malformed(format!(
                "{} trailing bytes after {:?} record",
                rest.len(),
                instruction.tag()
            )));
        }
        Ok(instruction)
    }

    /// Decode a packet produced by [`Instruction::encode_packet`].
    pub fn decode_packet(bytes: &[u8]) -> Result<Self> {
        let (mut instruction, rest) = decode_prefix(bytes)?;
        match &mut instruction {
            Instruction::DesignUpload(u) => u.upload.data = rest.to_vec(),
            other if !rest.is_empty() => {
                return Err(SpaceError::malformed(format!(
                    "{} trailing bytes after {:?} packet",
                    rest.len(),
                    other.tag()
                )));
            }
            _ => {}
        }
        Ok(instruction)
    }
}

fn decode_prefix(bytes: &[u8]) -> Result<(Instruction, &[u8])> {
    let mut decoder = Decoder::new(bytes, 0);
    let instruction = decoder
        .next_instruction()?
        .ok_or(SpaceError::Truncated { offset: 0, needed: RECORD_HEADER_LEN })?;
    let consumed = decoder.offset() as usize;
    Ok((instruction, &bytes[consumed..]))
}
