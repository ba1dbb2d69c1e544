//! Append-only space log.
//!
//! The file is the 48-byte [`MAGIC`] header followed by encoded records,
//! back-to-back, with no framing, checksums or index. Only committed
//! instructions are appended, one `write` per record, flushed before
//! `write` returns.
//!
//! Opening a log replays it through the same path as a live write, minus
//! the append: limits are rebuilt and the observer sees every record in file
//! order. Any decode failure aborts the open; the file is never rewound.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::Decoder;
use crate::error::{Result, SpaceError};
use crate::observer::Observer;
use crate::protocol::{AuthorId, DesignId, EntityId, Instruction};

/// Header every log starts with: 47 ASCII bytes and a newline.
pub const MAGIC: &[u8; 48] = b"the.quetzal.community/musical.Users3DScene@v0.1\n";

const MAGIC_LEN: u64 = MAGIC.len() as u64;

/// Outcome of [`LogStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    /// Out of author bounds; not observed, not persisted
    Dropped,
    /// Observed only (not committed)
    Observed,
    /// Observed and appended
    Persisted,
}

/// Highest entity/design numbers persisted per author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorLimits {
    entity: HashMap<AuthorId, u16>,
    design: HashMap<AuthorId, u16>,
}

impl AuthorLimits {
    pub fn entity_limit(&self, author: AuthorId) -> u16 {
        self.entity.get(&author).copied().unwrap_or(0)
    }

    pub fn design_limit(&self, author: AuthorId) -> u16 {
        self.design.get(&author).copied().unwrap_or(0)
    }

    /// An author may allocate its own next number; others' ids must exist.
    fn in_bounds(limit: u16, owner: AuthorId, number: u16, by: AuthorId) -> bool {
        if owner == by {
            u32::from(number) <= u32::from(limit) + 1
        } else {
            number <= limit
        }
    }

    pub fn admits_entity(&self, id: EntityId, by: AuthorId) -> bool {
        id.is_none() || Self::in_bounds(self.entity_limit(id.author), id.author, id.number, by)
    }

    pub fn admits_design(&self, id: DesignId, by: AuthorId) -> bool {
        id.is_none() || Self::in_bounds(self.design_limit(id.author), id.author, id.number, by)
    }

    /// Bounds check for the variants that carry author bounds.
    pub fn admits(&self, instruction: &Instruction) -> bool {
        match instruction {
            Instruction::Contribution(c) => {
                self.admits_entity(c.entity, c.author) && self.admits_design(c.design, c.author)
            }
            Instruction::AreaToSculpt(a) => self.admits_design(a.design, a.author),
            _ => true,
        }
    }

    fn raise_entity(&mut self, id: EntityId) {
        if !id.is_none() {
            let limit = self.entity.entry(id.author).or_insert(0);
            *limit = (*limit).max(id.number);
        }
    }

    fn raise_design(&mut self, id: DesignId) {
        if !id.is_none() {
            let limit = self.design.entry(id.author).or_insert(0);
            *limit = (*limit).max(id.number);
        }
    }

    /// Raise every limit the instruction references.
    pub fn raise(&mut self, instruction: &Instruction) {
        match instruction {
            Instruction::DesignImport(d) => self.raise_design(d.design),
            Instruction::DesignUpload(d) => self.raise_design(d.design),
            Instruction::Contribution(c) => {
                self.raise_entity(c.entity);
                self.raise_design(c.design);
            }
            Instruction::Relationship(r) => {
                self.raise_entity(r.entity);
                self.raise_entity(r.parent);
            }
            Instruction::AreaToSculpt(a) => self.raise_design(a.design),
            Instruction::Orchestrator(_) | Instruction::BirdsEyeView(_) => {}
        }
    }
}

fn verify_header<R: Read>(reader: &mut R, path: &Path) -> Result<()> {
    let mut header = [0u8; MAGIC.len()];
    match reader.read_exact(&mut header) {
        Ok(()) if &header == MAGIC => Ok(()),
        Ok(()) => Err(SpaceError::InvalidFormat { path: path.to_path_buf() }),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(SpaceError::InvalidFormat { path: path.to_path_buf() })
        }
        Err(e) => Err(e.into()),
    }
}

/// The host's handle on a space log.
pub struct LogStore {
    path: PathBuf,
    file: File,
    observer: Arc<dyn Observer>,
    limits: AuthorLimits,
    records: u64,
}

impl LogStore {
    /// Open (or create) a log and replay it into `observer`.
    ///
    /// `limit == 0` replays everything; otherwise only the first `limit`
    /// records are observed and the rest are only counted.
    pub fn open(path: impl AsRef<Path>, limit: u64, observer: Arc<dyn Observer>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.flush()?;
            log::info!("Created space log {}", path.display());
        } else {
            verify_header(&mut file, &path)?;
        }

        let mut store = LogStore {
            path,
            file,
            observer,
            limits: AuthorLimits::default(),
            records: 0,
        };
        store.replay(limit)?;
        log::info!(
            "Opened space log {} ({} records)",
            store.path.display(),
            store.records
        );
        Ok(store)
    }

    fn replay(&mut self, limit: u64) -> Result<()> {
        let mut decoder = Decoder::new(BufReader::new(&self.file), MAGIC_LEN);
        while let Some(instruction) = decoder.next_instruction()? {
            if matches!(instruction, Instruction::BirdsEyeView(_)) {
                return Err(SpaceError::UnexpectedViewpoint { index: self.records });
            }
            if limit == 0 || self.records < limit {
                if let Err(e) = Self::apply(&mut self.limits, &*self.observer, &instruction) {
                    log::warn!("Replay of record {} in {}: {e}", self.records, self.path.display());
                }
            } else {
                // Past the limit: not observed, but later writes are still
                // bounded by everything on disk.
                self.limits.raise(&instruction);
            }
            self.records += 1;
        }
        Ok(())
    }

    /// Bounds check, raise limits and observe. Returns `None` when dropped.
    fn apply(
        limits: &mut AuthorLimits,
        observer: &dyn Observer,
        instruction: &Instruction,
    ) -> Result<Option<()>> {
        if !limits.admits(instruction) {
            return Ok(None);
        }
        limits.raise(instruction);
        observer.observe(instruction).map(Some)
    }

    /// Route one instruction through the log.
    ///
    /// Observer errors are returned after the record is appended; a storage
    /// failure takes precedence over them.
    pub fn write(&mut self, instruction: &Instruction) -> Result<Written> {
        if !instruction.is_committed() {
            self.observer.observe(instruction)?;
            return Ok(Written::Observed);
        }

        let record = instruction.encode()?;
        let observed = match Self::apply(&mut self.limits, &*self.observer, instruction) {
            Ok(None) => {
                log::debug!("Dropped out-of-bounds {:?}", instruction.tag());
                return Ok(Written::Dropped);
            }
            Ok(Some(())) => Ok(()),
            Err(e) => Err(e),
        };

        self.file.write_all(&record)?;
        self.file.flush()?;
        self.records += 1;
        log::trace!(
            "Appended {:?} ({} bytes) as record {}",
            instruction.tag(),
            record.len(),
            self.records - 1
        );

        observed.map(|()| Written::Persisted)
    }

    /// Records on disk, counting replayed and appended ones.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limits(&self) -> &AuthorLimits {
        &self.limits
    }

    /// Flush to stable storage and release the file.
    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        log::info!("Closed space log {}", self.path.display());
        Ok(())
    }
}

/// One record read back from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub index: u64,
    /// Byte offset of the record in the file
    pub offset: u64,
    pub instruction: Instruction,
    /// The record exactly as stored
    pub bytes: Vec<u8>,
}

struct Capture<R> {
    inner: R,
    captured: Vec<u8>,
}

impl<R: Read> Read for Capture<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.captured.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Read-only cursor over a log, independent of any [`LogStore`].
pub struct LogReader {
    decoder: Decoder<Capture<BufReader<File>>>,
    index: u64,
    limit: Option<u64>,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = BufReader::new(File::open(path)?);
        verify_header(&mut file, path)?;
        Ok(Self {
            decoder: Decoder::new(
                Capture { inner: file, captured: Vec::with_capacity(64) },
                MAGIC_LEN,
            ),
            index: 0,
            limit: None,
        })
    }

    /// Stop after `limit` records.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.limit.is_some_and(|limit| self.index >= limit) {
            return Ok(None);
        }
        let offset = self.decoder.offset();
        self.decoder.get_mut().captured.clear();
        let Some(instruction) = self.decoder.next_instruction()? else {
            return Ok(None);
        };
        if matches!(instruction, Instruction::BirdsEyeView(_)) {
            return Err(SpaceError::UnexpectedViewpoint { index: self.index });
        }
        let record = LogRecord {
            index: self.index,
            offset,
            instruction,
            bytes: std::mem::take(&mut self.decoder.get_mut().captured),
        };
        self.index += 1;
        Ok(Some(record))
    }
}

impl Iterator for LogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::observer::{InstructionCounter, NullObserver};
    use crate::protocol::{
        AreaToSculpt, BirdsEyeView, Contribution, DesignImport, InstructionTag, Orchestrator,
        Relationship, SpaceId, Vec3,
    };
    use std::sync::Mutex;

    fn contribution(author: u16, entity: u16, commit: bool) -> Instruction {
        Contribution {
            author: AuthorId(author),
            entity: EntityId::new(author, entity),
            offset: Vec3::new(1.0, 2.0, 3.0),
            commit,
            ..Default::default()
        }
        .into()
    }

    fn recorder() -> (Arc<Mutex<Vec<Instruction>>>, Arc<dyn Observer>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: Arc<dyn Observer> = Arc::new(move |i: &Instruction| -> Result<()> {
            sink.lock().unwrap().push(i.clone());
            Ok(())
        });
        (seen, observer)
    }

    #[test]
    fn test_empty_log_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let (seen, observer) = recorder();

        let store = LogStore::open(&path, 0, observer).unwrap();
        assert_eq!(store.records(), 0);
        store.close().unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), MAGIC.to_vec());
    }

    #[test]
    fn test_commit_discipline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let counter = Arc::new(InstructionCounter::new());
        let mut store = LogStore::open(&path, 0, counter.clone()).unwrap();

        let committed = contribution(1, 1, true);
        let preview = contribution(1, 1, false);
        let assign = Instruction::from(Orchestrator { assign: true, author: AuthorId(1), ..Default::default() });
        let view = Instruction::from(BirdsEyeView { timing: 5, ..Default::default() });

        assert_eq!(store.write(&committed).unwrap(), Written::Persisted);
        assert_eq!(store.write(&preview).unwrap(), Written::Observed);
        assert_eq!(store.write(&assign).unwrap(), Written::Observed);
        assert_eq!(store.write(&view).unwrap(), Written::Observed);

        assert_eq!(store.records(), 1);
        assert_eq!(counter.snapshot().total(), 4);
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, MAGIC_LEN + committed.encode().unwrap().len() as u64);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        {
            let mut store = LogStore::open(&path, 0, Arc::new(NullObserver)).unwrap();
            store.write(&DesignImport { design: DesignId::new(1, 1), uri: "a.glb".into() }.into()).unwrap();
            store.write(&contribution(1, 1, true)).unwrap();
            store.write(&contribution(1, 2, true)).unwrap();
            store.close().unwrap();
        }

        let (first, observer) = recorder();
        let store = LogStore::open(&path, 0, observer).unwrap();
        assert_eq!(store.records(), 3);
        let (second, observer) = recorder();
        LogStore::open(&path, 0, observer).unwrap();

        let first = first.lock().unwrap().clone();
        assert_eq!(first.len(), 3);
        assert_eq!(first, *second.lock().unwrap());
        assert_eq!(first[0].tag(), InstructionTag::DesignImport);
    }

    #[test]
    fn test_replay_limit_counts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        {
            let mut store = LogStore::open(&path, 0, Arc::new(NullObserver)).unwrap();
            for n in 1..=4 {
                store.write(&contribution(1, n, true)).unwrap();
            }
        }
        let (seen, observer) = recorder();
        let store = LogStore::open(&path, 2, observer).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(store.records(), 4);
    }

    #[test]
    fn test_limited_replay_keeps_author_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        {
            let mut store = LogStore::open(&path, 0, Arc::new(NullObserver)).unwrap();
            for n in 1..=4 {
                store.write(&contribution(1, n, true)).unwrap();
            }
            store.close().unwrap();
        }

        // Author 2 edits author 1's newest entity, which lies past the limit.
        let edit = Instruction::from(Contribution {
            author: AuthorId(2),
            entity: EntityId::new(1, 4),
            commit: true,
            ..Default::default()
        });
        let mut store = LogStore::open(&path, 2, Arc::new(NullObserver)).unwrap();
        assert_eq!(store.limits().entity_limit(AuthorId(1)), 4);
        assert_eq!(store.write(&edit).unwrap(), Written::Persisted);
        assert_eq!(store.records(), 5);
    }

    #[test]
    fn test_bad_headers() {
        let dir = tempfile::tempdir().unwrap();

        let short = dir.path().join("short.log");
        std::fs::write(&short, &MAGIC[..20]).unwrap();
        let err = LogStore::open(&short, 0, Arc::new(NullObserver)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);

        let wrong = dir.path().join("wrong.log");
        let mut bytes = MAGIC.to_vec();
        bytes[0] = b'T';
        std::fs::write(&wrong, &bytes).unwrap();
        let err = LogStore::open(&wrong, 0, Arc::new(NullObserver)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
        // Never touched.
        assert_eq!(std::fs::read(&wrong).unwrap(), bytes);

        let err = LogReader::open(&short).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_viewpoint_in_log_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let mut bytes = MAGIC.to_vec();
        bytes.extend(contribution(1, 1, true).encode().unwrap());
        bytes.extend(Instruction::from(BirdsEyeView::default()).encode().unwrap());
        std::fs::write(&path, &bytes).unwrap();

        match LogStore::open(&path, 0, Arc::new(NullObserver)) {
            Err(SpaceError::UnexpectedViewpoint { index }) => assert_eq!(index, 1),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[test]
    fn test_torn_tail_aborts_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let mut bytes = MAGIC.to_vec();
        let record = contribution(1, 1, true).encode().unwrap();
        bytes.extend_from_slice(&record);
        bytes.extend_from_slice(&record[..record.len() - 3]);
        std::fs::write(&path, &bytes).unwrap();

        let err = LogStore::open(&path, 0, Arc::new(NullObserver)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Truncated);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_author_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let mut store = LogStore::open(&path, 0, Arc::new(NullObserver)).unwrap();

        // Author 1 allocates entities one at a time.
        assert_eq!(store.write(&contribution(1, 1, true)).unwrap(), Written::Persisted);
        assert_eq!(store.write(&contribution(1, 3, true)).unwrap(), Written::Dropped);
        assert_eq!(store.write(&contribution(1, 2, true)).unwrap(), Written::Persisted);
        assert_eq!(store.limits().entity_limit(AuthorId(1)), 2);

        // Author 2 may reference author 1's existing entities only.
        let touch = |number| -> Instruction {
            Contribution {
                author: AuthorId(2),
                entity: EntityId::new(1, number),
                commit: true,
                ..Default::default()
            }
            .into()
        };
        assert_eq!(store.write(&touch(2)).unwrap(), Written::Persisted);
        assert_eq!(store.write(&touch(3)).unwrap(), Written::Dropped);

        // Designs: imports raise the limit for any author.
        let sculpt = |design: DesignId| -> Instruction {
            AreaToSculpt { author: AuthorId(2), design, radius: 1.0, commit: true, ..Default::default() }.into()
        };
        assert_eq!(store.write(&sculpt(DesignId::new(1, 5))).unwrap(), Written::Dropped);
        store.write(&DesignImport { design: DesignId::new(1, 5), uri: "rock".into() }.into()).unwrap();
        assert_eq!(store.write(&sculpt(DesignId::new(1, 5))).unwrap(), Written::Persisted);

        let records = store.records();
        drop(store);

        let store = LogStore::open(&path, 0, Arc::new(NullObserver)).unwrap();
        assert_eq!(store.records(), records);
        assert_eq!(store.limits().entity_limit(AuthorId(1)), 2);
        assert_eq!(store.limits().design_limit(AuthorId(1)), 5);
    }

    #[test]
    fn test_relationship_raises_entity_limits() {
        let mut limits = AuthorLimits::default();
        limits.raise(&Relationship {
            author: AuthorId(3),
            entity: EntityId::new(3, 4),
            parent: EntityId::new(1, 2),
            commit: true,
            ..Default::default()
        }
        .into());
        assert_eq!(limits.entity_limit(AuthorId(3)), 4);
        assert_eq!(limits.entity_limit(AuthorId(1)), 2);
        assert!(limits.admits_entity(EntityId::default(), AuthorId(9)));
    }

    #[test]
    fn test_observer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let failing: Arc<dyn Observer> =
            Arc::new(|_: &Instruction| -> Result<()> {
            Err(SpaceError::ObserverFailure("scene".into()))
        });

        let mut store = LogStore::open(&path, 0, failing.clone()).unwrap();
        let err = store.write(&contribution(1, 1, true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObserverFailure);
        // Appended regardless.
        assert_eq!(store.records(), 1);
        drop(store);

        // Replay logs and carries on.
        let store = LogStore::open(&path, 0, failing).unwrap();
        assert_eq!(store.records(), 1);
    }

    #[test]
    fn test_reader_yields_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("space.log");
        let space = SpaceId::new_random();
        let confirm = Instruction::from(Orchestrator { record: space, number: 0, author: AuthorId(1), assign: false });
        let first = contribution(1, 1, true);
        {
            let mut store = LogStore::open(&path, 0, Arc::new(NullObserver)).unwrap();
            store.write(&confirm).unwrap();
            store.write(&first).unwrap();
            store.write(&contribution(1, 2, true)).unwrap();
        }

        let records: Vec<_> = LogReader::open(&path)
            .unwrap()
            .with_limit(2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, MAGIC_LEN);
        assert_eq!(records[0].instruction, confirm);
        assert_eq!(records[1].bytes, first.encode().unwrap());
        assert_eq!(records[1].offset, MAGIC_LEN + records[0].bytes.len() as u64);
    }
}
