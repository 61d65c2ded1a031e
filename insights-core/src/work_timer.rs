// ABOUTME: Pausable stopwatch measuring how long the agent has been working on a turn.
// ABOUTME: Uses tokio's Instant so tests can drive it with a paused clock.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkTimer {
    #[default]
    Idle,
    Running {
        started: Instant,
        /// Time banked from earlier running stretches
        accumulated: Duration,
    },
    Paused {
        accumulated: Duration,
    },
}

impl WorkTimer {
    /// Start from zero, discarding whatever was measured before
    pub fn start(&mut self) {
        *self = WorkTimer::Running {
            started: Instant::now(),
            accumulated: Duration::ZERO,
        };
    }

    pub fn pause(&mut self) {
        if let WorkTimer::Running {
            started,
            accumulated,
        } = *self
        {
            *self = WorkTimer::Paused {
                accumulated: accumulated + started.elapsed(),
            };
        }
    }

    pub fn resume(&mut self) {
        if let WorkTimer::Paused { accumulated } = *self {
            *self = WorkTimer::Running {
                started: Instant::now(),
                accumulated,
            };
        }
    }

    /// Stop and return the total, or None if the timer was not running.
    /// A paused timer is discarded.
    pub fn finish(&mut self) -> Option<Duration> {
        let total = match *self {
            WorkTimer::Running {
                started,
                accumulated,
            } => Some(accumulated + started.elapsed()),
            WorkTimer::Paused { .. } | WorkTimer::Idle => None,
        };
        *self = WorkTimer::Idle;
        total
    }

    pub fn reset(&mut self) {
        *self = WorkTimer::Idle;
    }

    pub fn elapsed(&self) -> Duration {
        match *self {
            WorkTimer::Idle => Duration::ZERO,
            WorkTimer::Running {
                started,
                accumulated,
            } => accumulated + started.elapsed(),
            WorkTimer::Paused { accumulated } => accumulated,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, WorkTimer::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, WorkTimer::Paused { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, WorkTimer::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pause_excludes_waiting_time() {
        let mut timer = WorkTimer::default();
        timer.start();
        tokio::time::advance(Duration::from_secs(3)).await;
        timer.pause();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(timer.elapsed(), Duration::from_secs(3));
        timer.resume();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(timer.finish(), Some(Duration::from_secs(5)));
        assert!(timer.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_while_paused_discards() {
        let mut timer = WorkTimer::default();
        timer.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        timer.pause();
        assert_eq!(timer.finish(), None);
        assert!(timer.is_idle());
    }

    #[test]
    fn test_pause_and_resume_ignore_wrong_state() {
        let mut timer = WorkTimer::default();
        timer.pause();
        assert!(timer.is_idle());
        timer.resume();
        assert!(timer.is_idle());
        assert_eq!(timer.finish(), None);
    }
}
