//! The seam between the core and whatever turns instructions into scene
//! state.
//!
//! ```text
//!                    ┌──────────────────┐
//!   accepted ───────►│ Observers        │──► InstructionCounter
//!   instruction      │ (sequential,     │──► renderer / scene graph
//!                    │  all run)        │──► ...
//!                    └──────────────────┘
//! ```
//!
//! Observers are called from session tasks and must tolerate seeing the same
//! instruction again after a reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{ErrorReporter, Result, SpaceError};
use crate::protocol::{Instruction, InstructionTag};

/// Receives every accepted instruction.
pub trait Observer: Send + Sync {
    fn observe(&self, instruction: &Instruction) -> Result<()>;
}

impl<F> Observer for F
where
    F: Fn(&Instruction) -> Result<()> + Send + Sync,
{
    fn observe(&self, instruction: &Instruction) -> Result<()> {
        self(instruction)
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn observe(&self, _instruction: &Instruction) -> Result<()> {
        Ok(())
    }
}

/// Sequential dispatch to several observers.
///
/// Every observer sees every instruction. The first error is returned;
/// later ones go to the reporter set with [`Observers::reporting_to`], or to
/// the log when there is none.
#[derive(Default, Clone)]
pub struct Observers {
    inner: Vec<Arc<dyn Observer>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.push(observer);
        self
    }

    pub fn reporting_to(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.inner.push(observer);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Observer for Observers {
    fn observe(&self, instruction: &Instruction) -> Result<()> {
        let mut first: Option<SpaceError> = None;
        for observer in &self.inner {
            if let Err(e) = observer.observe(instruction) {
                match (&first, &self.reporter) {
                    (None, _) => first = Some(e),
                    (Some(_), Some(reporter)) => reporter.report(e),
                    (Some(_), None) => {
                        log::warn!("Observer failed on {:?}: {e}", instruction.tag())
                    }
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Per-variant instruction counts.
#[derive(Debug, Default)]
pub struct InstructionCounter {
    counts: [AtomicU64; 7],
}

/// Snapshot of an [`InstructionCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionCounts {
    pub per_tag: [u64; 7],
}

impl InstructionCounts {
    pub fn get(&self, tag: InstructionTag) -> u64 {
        self.per_tag[tag.index()]
    }

    pub fn total(&self) -> u64 {
        self.per_tag.iter().sum()
    }
}

impl InstructionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: InstructionTag) -> u64 {
        self.counts[tag.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> InstructionCounts {
        let mut per_tag = [0; 7];
        for tag in InstructionTag::ALL {
            per_tag[tag.index()] = self.get(tag);
        }
        InstructionCounts { per_tag }
    }
}

impl Observer for InstructionCounter {
    fn observe(&self, instruction: &Instruction) -> Result<()> {
        self.counts[instruction.tag().index()].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::{Contribution, DesignImport};
    use std::sync::Mutex;

    #[test]
    fn test_counter_counts_per_tag() {
        let counter = InstructionCounter::new();
        counter.observe(&Contribution::default().into()).unwrap();
        counter.observe(&Contribution::default().into()).unwrap();
        counter.observe(&DesignImport::default().into()).unwrap();

        let counts = counter.snapshot();
        assert_eq!(counts.get(InstructionTag::Contribution), 2);
        assert_eq!(counts.get(InstructionTag::DesignImport), 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_compositor_runs_all_and_returns_first_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log_a = seen.clone();
        let log_c = seen.clone();

        let observers = Observers::new()
            .with(Arc::new(move |_: &Instruction| -> Result<()> {
                log_a.lock().unwrap().push("a");
                Err(SpaceError::ObserverFailure("a".into()))
            }))
            .with(Arc::new(|_: &Instruction| -> Result<()> {
                Err(SpaceError::ObserverFailure("b".into()))
            }))
            .with(Arc::new(move |_: &Instruction| -> Result<()> {
                log_c.lock().unwrap().push("c");
                Ok(())
            }));

        let err = observers
            .observe(&Contribution::default().into())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObserverFailure);
        assert_eq!(err.to_string(), "observer failed: a");
        assert_eq!(*seen.lock().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn test_compositor_reports_later_errors() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let failing = |name: &'static str| -> Arc<dyn Observer> {
            Arc::new(move |_: &Instruction| -> Result<()> {
                Err(SpaceError::ObserverFailure(name.into()))
            })
        };

        let observers = Observers::new()
            .with(failing("a"))
            .with(failing("b"))
            .with(failing("c"))
            .reporting_to(Arc::new(move |e: SpaceError| sink.lock().unwrap().push(e.to_string())));

        let err = observers
            .observe(&Contribution::default().into())
            .unwrap_err();
        assert_eq!(err.to_string(), "observer failed: a");
        assert_eq!(
            *reported.lock().unwrap(),
            vec!["observer failed: b", "observer failed: c"]
        );
    }

    #[test]
    fn test_compositor_nesting() {
        let counter = Arc::new(InstructionCounter::new());
        let inner = Observers::new().with(counter.clone());
        let outer = Observers::new().with(Arc::new(inner)).with(counter.clone());
        outer.observe(&DesignImport::default().into()).unwrap();
        assert_eq!(counter.get(InstructionTag::DesignImport), 2);
        assert!(Observers::new().observe(&DesignImport::default().into()).is_ok());
    }
}
