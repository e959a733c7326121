//! Self-monitored soft deadlines.
//!
//! The host kills the process at its execution ceiling; long loops only warn when the run
//! gets close, because stopping mid-write would leave a corrupt artifact behind.

use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct SoftDeadline {
    started: Instant,
    warn_after: Duration,
    ceiling: Duration,
}

impl SoftDeadline {
    pub fn new(started: Instant, warn_after: Duration, ceiling: Duration) -> Self {
        Self {
            started,
            warn_after,
            ceiling,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_near(&self) -> bool {
        self.elapsed() > self.warn_after
    }

    /// Starts a watch for one loop; it warns at most once.
    pub fn watch(&self, stage: &'static str) -> DeadlineWatch {
        DeadlineWatch {
            deadline: *self,
            stage,
            warned: false,
        }
    }
}

#[derive(Debug)]
pub struct DeadlineWatch {
    deadline: SoftDeadline,
    stage: &'static str,
    warned: bool,
}

impl DeadlineWatch {
    pub fn has_warned(&self) -> bool {
        self.warned
    }

    /// Returns true when this call emitted the warning.
    pub fn check(&mut self, detail: impl Display) -> bool {
        if self.warned || !self.deadline.is_near() {
            return false;
        }
        self.warned = true;
        warn!(
            "{} approaching timeout ({}s / {}s) - {}",
            self.stage,
            self.deadline.elapsed().as_secs(),
            self.deadline.ceiling.as_secs(),
            detail
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_warns_once_past_threshold() {
        let deadline = SoftDeadline::new(Instant::now(), Duration::ZERO, Duration::from_secs(900));
        std::thread::sleep(Duration::from_millis(2));
        let mut watch = deadline.watch("Database export");
        assert!(watch.check("table orders"));
        assert!(!watch.check("table orders"));
    }

    #[test]
    fn test_watch_silent_before_threshold() {
        let deadline =
            SoftDeadline::new(Instant::now(), Duration::from_secs(840), Duration::from_secs(900));
        let mut watch = deadline.watch("Archive");
        assert!(!watch.check("100 files"));
        assert!(!deadline.is_near());
    }
}
