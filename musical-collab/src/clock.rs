//! Leader-clock tracking for non-host participants.
//!
//! The host stamps its periodic `BirdsEyeView` with its wall clock. Each
//! follower keeps the last [`SAMPLE_SLOTS`] `(leader, local_receive)` pairs
//! and derives from their mean delay:
//!
//! ```text
//!   target = wall - avg_delay     where the leader was when we heard it
//!   future = wall + avg_delay     when an action sent now lands remotely
//!   now    = smooth               target, low-pass filtered per tick
//! ```
//!
//! All times are nanoseconds since the Unix epoch. The clock never blocks
//! and is driven entirely by its owner.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SAMPLE_SLOTS: usize = 10;

/// Pull strength toward `target`, per second of frame time.
const PULL_PER_SECOND: f64 = 4.0;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Local wall clock in nanoseconds since the Unix epoch.
pub fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Clock {
    /// `(leader, local)` ring
    samples: [(i64, i64); SAMPLE_SLOTS],
    filled: usize,
    next: usize,
    avg_delay: i64,
    smooth: Option<i64>,
    wall: i64,
    last_tick: Option<i64>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            samples: [(0, 0); SAMPLE_SLOTS],
            filled: 0,
            next: 0,
            avg_delay: 0,
            smooth: None,
            wall: 0,
            last_tick: None,
        }
    }

    /// Record a leader timestamp received at local wall time `local`.
    ///
    /// Zero leader times carry no information and are ignored.
    pub fn sample(&mut self, leader: i64, local: i64) {
        if leader == 0 {
            return;
        }
        self.samples[self.next] = (leader, local);
        self.next = (self.next + 1) % SAMPLE_SLOTS;
        self.filled = (self.filled + 1).min(SAMPLE_SLOTS);

        let total: i128 = self.samples[..self.filled]
            .iter()
            .map(|(leader, local)| i128::from(*local) - i128::from(*leader))
            .sum();
        self.avg_delay = (total / self.filled as i128) as i64;

        if self.smooth.is_none() {
            self.smooth = Some(local);
            self.wall = self.wall.max(local);
        }
    }

    /// Advance to wall time `wall_now`. The frame delta is the time since
    /// the previous tick.
    pub fn tick(&mut self, wall_now: i64) {
        let dt = self.last_tick.map_or(0, |last| (wall_now - last).max(0));
        self.last_tick = Some(wall_now);
        self.wall = wall_now;

        if let Some(smooth) = self.smooth {
            let pull = (PULL_PER_SECOND * dt as f64 / NANOS_PER_SECOND).min(1.0);
            let advanced = smooth + dt;
            let correction = pull * (self.target() - advanced) as f64;
            self.smooth = Some(advanced + correction.round() as i64);
        }
    }

    /// [`Clock::tick`] against the local wall clock.
    pub fn tick_now(&mut self) {
        self.tick(wall_nanos());
    }

    /// Smoothed leader time. Before the first sample this is the local
    /// wall clock as of the last tick.
    pub fn now(&self) -> i64 {
        self.smooth.unwrap_or(self.wall)
    }

    pub fn target(&self) -> i64 {
        self.wall - self.avg_delay
    }

    pub fn future(&self) -> i64 {
        self.wall + self.avg_delay
    }

    /// Mean of `local - leader` over the filled slots.
    pub fn avg_delay(&self) -> i64 {
        self.avg_delay
    }

    pub fn samples(&self) -> usize {
        self.filled
    }

    /// Whether a leader sample has been seen.
    pub fn is_locked(&self) -> bool {
        self.smooth.is_some()
    }
}

/// A [`Clock`] shared between a session's receive loop, which feeds it
/// samples, and the application, which ticks and reads it.
#[derive(Debug, Clone, Default)]
pub struct SharedClock(Arc<Mutex<Clock>>);

impl SharedClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Clock> {
        // A panic while holding the lock cannot leave the ring inconsistent.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sample(&self, leader: i64, local: i64) {
        self.lock().sample(leader, local);
    }

    pub fn tick_now(&self) {
        self.lock().tick_now();
    }

    pub fn now(&self) -> i64 {
        self.lock().now()
    }

    pub fn future(&self) -> i64 {
        self.lock().future()
    }

    pub fn snapshot(&self) -> Clock {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;
    const START: i64 = 1_700_000_000_000 * MS;

    #[test]
    fn test_unlocked_clock_follows_wall() {
        let mut clock = Clock::new();
        clock.tick(START);
        assert!(!clock.is_locked());
        assert_eq!(clock.now(), START);
        assert_eq!(clock.future(), START);

        clock.sample(0, START);
        assert_eq!(clock.samples(), 0);
    }

    #[test]
    fn test_ring_averages_last_ten() {
        let mut clock = Clock::new();
        for i in 0..5 {
            clock.sample(START + i * MS, START + i * MS + 300 * MS);
        }
        assert_eq!(clock.avg_delay(), 300 * MS);
        for i in 5..15 {
            clock.sample(START + i * MS, START + i * MS + 100 * MS);
        }
        assert_eq!(clock.samples(), SAMPLE_SLOTS);
        assert_eq!(clock.avg_delay(), 100 * MS);
    }

    #[test]
    fn test_first_sample_initializes_smooth() {
        let mut clock = Clock::new();
        clock.sample(START - 50 * MS, START);
        assert!(clock.is_locked());
        assert_eq!(clock.now(), START);
    }

    #[test]
    fn test_clock_locks_onto_leader() {
        let delay = 100 * MS;
        let frame = 16 * MS;
        let mut clock = Clock::new();
        let mut wall = START;

        for _ in 0..SAMPLE_SLOTS {
            clock.sample(wall - delay, wall);
            clock.tick(wall);
            wall += frame;
        }
        assert_eq!(clock.avg_delay(), delay);

        let mut previous = clock.now();
        for _ in 0..300 {
            let before = clock.now();
            clock.tick(wall);
            let pull = (4.0 * frame as f64 / 1e9).min(1.0);
            let step = clock.now() - before - frame;
            let bound = pull * (clock.target() - before - frame).abs() as f64;
            assert!(step.abs() as f64 <= bound + 1.0, "step {step} over {bound}");
            assert!(clock.now() > previous, "now went backwards");
            previous = clock.now();
            wall += frame;
        }

        let spread = clock.future() - clock.now();
        assert!((spread - 2 * delay).abs() < MS, "spread was {spread}");
        assert!((clock.now() - clock.target()).abs() < MS);
    }

    #[test]
    fn test_backwards_wall_does_not_rewind() {
        let mut clock = Clock::new();
        clock.sample(START - 10 * MS, START);
        clock.tick(START);
        let now = clock.now();
        clock.tick(START - 5 * MS);
        assert!(clock.now() <= now);
        assert!(clock.now() >= now - 10 * MS);
    }

    #[test]
    fn test_shared_clock() {
        let shared = SharedClock::new();
        let feeder = shared.clone();
        std::thread::spawn(move || feeder.sample(START - 20 * MS, START))
            .join()
            .unwrap();
        assert!(shared.snapshot().is_locked());
        assert_eq!(shared.snapshot().avg_delay(), 20 * MS);
    }

    #[test]
    fn test_wall_nanos_is_recent() {
        assert!(wall_nanos() > START);
    }
}
