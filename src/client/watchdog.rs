use crate::error::TimeoutPhase;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Connect and answer deadlines of one session behind a single timer.
///
/// Owned by the session loop. Only the earliest armed deadline can fire, and
/// firing tears the session down, so a second watchdog never fires after the
/// first.
#[derive(Debug, Default)]
pub struct Watchdog {
    connect: Option<Instant>,
    answer: Option<Instant>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, phase: TimeoutPhase, after: Duration) {
        self.arm_at(phase, Instant::now() + after);
    }

    pub fn arm_at(&mut self, phase: TimeoutPhase, deadline: Instant) {
        match phase {
            TimeoutPhase::Connect => self.connect = Some(deadline),
            TimeoutPhase::Answer => self.answer = Some(deadline),
        }
    }

    pub fn disarm(&mut self, phase: TimeoutPhase) {
        match phase {
            TimeoutPhase::Connect => self.connect = None,
            TimeoutPhase::Answer => self.answer = None,
        }
    }

    pub fn is_armed(&self, phase: TimeoutPhase) -> bool {
        match phase {
            TimeoutPhase::Connect => self.connect.is_some(),
            TimeoutPhase::Answer => self.answer.is_some(),
        }
    }

    /// The next deadline to fire; connect wins a tie
    fn next(&self) -> Option<(Instant, TimeoutPhase)> {
        match (self.connect, self.answer) {
            (Some(c), Some(a)) if a < c => Some((a, TimeoutPhase::Answer)),
            (Some(c), _) => Some((c, TimeoutPhase::Connect)),
            (None, Some(a)) => Some((a, TimeoutPhase::Answer)),
            (None, None) => None,
        }
    }

    /// Resolves when the earliest armed deadline passes; pending while disarmed
    pub async fn expired(&self) -> TimeoutPhase {
        match self.next() {
            Some((deadline, phase)) => {
                sleep_until(deadline).await;
                phase
            }
            None => std::future::pending().await,
        }
    }
}
