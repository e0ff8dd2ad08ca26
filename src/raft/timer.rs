use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One arming of the election timer. The coordination loop sleeps until
/// `deadline` and reports back with `epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerArm {
    pub deadline: Instant,
    pub epoch: u64,
}

/// Election timer state kept under the node lock.
///
/// Every arm or stop bumps the epoch, so an expiry that already fired but was
/// not consumed before a re-arm carries a stale epoch and is discarded.
#[derive(Debug, Default)]
pub struct ElectionTimer {
    deadline: Option<Instant>,
    epoch: u64,
}

impl ElectionTimer {
    pub fn arm(&mut self, timeout: Duration) -> TimerArm {
        self.epoch += 1;
        let deadline = Instant::now() + timeout;
        self.deadline = Some(deadline);
        TimerArm {
            deadline,
            epoch: self.epoch,
        }
    }

    pub fn stop(&mut self) {
        self.epoch += 1;
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn current(&self) -> Option<TimerArm> {
        self.deadline.map(|deadline| TimerArm {
            deadline,
            epoch: self.epoch,
        })
    }

    /// Consumes an expiry reported for `epoch`. Returns false if the timer was
    /// stopped or re-armed after that expiry was scheduled.
    pub fn consume(&mut self, epoch: u64) -> bool {
        if self.deadline.is_some() && self.epoch == epoch {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

/// Heartbeat and leader-job cadence, present only while the node leads.
#[derive(Debug, Clone)]
pub struct LeaderTickers {
    pub heartbeat: Duration,
    pub leader_job: Duration,
    resign: CancellationToken,
}

impl LeaderTickers {
    pub fn start(heartbeat: Duration, leader_job: Duration) -> Self {
        Self {
            heartbeat,
            leader_job,
            resign: CancellationToken::new(),
        }
    }

    /// Signal the leader task watches; it fires when leadership ends.
    pub fn resign_signal(&self) -> CancellationToken {
        self.resign.clone()
    }

    pub fn stop(self) {
        self.resign.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearm_invalidates_pending_expiry() {
        let mut timer = ElectionTimer::default();
        let first = timer.arm(Duration::from_millis(10));
        let second = timer.arm(Duration::from_millis(10));

        assert_ne!(first.epoch, second.epoch);
        assert!(!timer.consume(first.epoch));
        assert!(timer.consume(second.epoch));
        // Consumed once, never twice.
        assert!(!timer.consume(second.epoch));
        assert!(!timer.is_armed());
    }

    #[test]
    fn stop_discards_expiry() {
        let mut timer = ElectionTimer::default();
        let arm = timer.arm(Duration::from_millis(10));
        timer.stop();

        assert!(timer.current().is_none());
        assert!(!timer.consume(arm.epoch));
    }

    #[test]
    fn stopping_tickers_fires_resign_signal() {
        let tickers = LeaderTickers::start(Duration::from_millis(100), Duration::from_secs(1));
        let signal = tickers.resign_signal();
        assert!(!signal.is_cancelled());

        tickers.stop();
        assert!(signal.is_cancelled());
    }
}
