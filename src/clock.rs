//! The simulation time source.
//!
//! Every component reads time through a shared [`SimClock`] instead of
//! calling the system clock directly. This buys two things:
//!
//! - **Restorability.** A session loaded from disk anchors the clock at the
//!   persisted instant, so relative timestamps in restored state (routing
//!   expiries, in-flight deliveries) remain meaningful.
//! - **Determinism.** Tests construct a manually advanced clock and step it
//!   by hand, making delivery and expiry behavior exactly reproducible.
//!
//! The clock is set once at startup or restore and only read afterwards;
//! `advance` is the single mutation and only applies to manual mode.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// System time, straight through.
    Live,
    /// `start + (real_now - real_anchor)`: simulated time resumes from a
    /// restored instant and advances with real elapsed time.
    Anchored {
        start: DateTime<Utc>,
        real_anchor: Instant,
    },
    /// Time stands still until `advance` is called.
    Manual(DateTime<Utc>),
}

#[derive(Debug)]
pub struct SimClock {
    mode: RwLock<Mode>,
}

impl SimClock {
    /// Wall-clock time.
    pub fn live() -> Arc<Self> {
        Arc::new(Self {
            mode: RwLock::new(Mode::Live),
        })
    }

    /// Simulated time anchored at `start`, advancing with real time. Used
    /// when restoring a saved session.
    pub fn anchored(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            mode: RwLock::new(Mode::Anchored {
                start,
                real_anchor: Instant::now(),
            }),
        })
    }

    /// Frozen time starting at `start`; advances only through
    /// [`SimClock::advance`]. The deterministic mode used by tests.
    pub fn manual(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            mode: RwLock::new(Mode::Manual(start)),
        })
    }

    /// Current simulated time.
    pub fn now(&self) -> DateTime<Utc> {
        match *self.mode.read().expect("clock lock poisoned") {
            Mode::Live => Utc::now(),
            Mode::Anchored { start, real_anchor } => {
                let elapsed = Duration::from_std(real_anchor.elapsed())
                    .unwrap_or_else(|_| Duration::zero());
                start + elapsed
            }
            Mode::Manual(at) => at,
        }
    }

    /// Moves a manual clock forward. Ignored (with a warning) in the other
    /// modes, where time advances on its own.
    pub fn advance(&self, delta: Duration) {
        let mut mode = self.mode.write().expect("clock lock poisoned");
        match *mode {
            Mode::Manual(at) => *mode = Mode::Manual(at + delta),
            _ => tracing::warn!("advance() called on a non-manual clock; ignored"),
        }
    }
}
