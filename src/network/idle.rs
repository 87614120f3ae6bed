//! Idle detection for a single connection
//!
//! Two independent timers: the reader timer fires when no frame has been
//! received for its timeout, the writer timer when no frame has been sent.
//! Each fires at most once per idle period and re-arms from the moment it
//! fired. A zero timeout disables the timer.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Idle condition detected on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Nothing received within the reader timeout
    ReaderIdle,
    /// Nothing sent within the writer timeout
    WriterIdle,
}

/// Reader/writer idle timers
#[derive(Debug)]
pub struct IdleSupervisor {
    reader_timeout: Option<Duration>,
    writer_timeout: Option<Duration>,
    last_read: Instant,
    last_write: Instant,
}

impl IdleSupervisor {
    pub fn new(reader_timeout: Duration, writer_timeout: Duration) -> Self {
        Self::starting_at(reader_timeout, writer_timeout, Instant::now())
    }

    /// Create timers armed from `now`
    pub fn starting_at(reader_timeout: Duration, writer_timeout: Duration, now: Instant) -> Self {
        Self {
            reader_timeout: Some(reader_timeout).filter(|t| !t.is_zero()),
            writer_timeout: Some(writer_timeout).filter(|t| !t.is_zero()),
            last_read: now,
            last_write: now,
        }
    }

    pub fn reader_timeout(&self) -> Option<Duration> {
        self.reader_timeout
    }

    pub fn writer_timeout(&self) -> Option<Duration> {
        self.writer_timeout
    }

    /// A frame was received
    pub fn record_read(&mut self, now: Instant) {
        self.last_read = now;
    }

    /// A frame was sent
    pub fn record_write(&mut self, now: Instant) {
        self.last_write = now;
    }

    pub fn reader_deadline(&self) -> Option<Instant> {
        self.reader_timeout.map(|t| self.last_read + t)
    }

    pub fn writer_deadline(&self) -> Option<Instant> {
        self.writer_timeout.map(|t| self.last_write + t)
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reader_deadline(), self.writer_deadline()) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Report an expired timer, re-arming it from `now`
    pub fn poll(&mut self, now: Instant) -> Option<IdleEvent> {
        if self.reader_deadline().is_some_and(|d| d <= now) {
            self.last_read = now;
            return Some(IdleEvent::ReaderIdle);
        }
        if self.writer_deadline().is_some_and(|d| d <= now) {
            self.last_write = now;
            return Some(IdleEvent::WriterIdle);
        }
        None
    }

    /// Sleep until a timer expires. Never resolves when both timers are disabled.
    ///
    /// Cancel safe: state only changes after the sleep completes.
    pub async fn wait(&mut self) -> IdleEvent {
        loop {
            let Some(deadline) = self.next_deadline() else {
                return std::future::pending().await;
            };

            sleep_until(deadline).await;

            if let Some(event) = self.poll(Instant::now()) {
                return event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_zero_disables() {
        let start = Instant::now();
        let mut idle = IdleSupervisor::starting_at(Duration::ZERO, Duration::ZERO, start);
        assert_eq!(idle.next_deadline(), None);
        assert_eq!(idle.poll(start + 1000 * SEC), None);
    }

    #[test]
    fn test_writer_fires_once_per_period() {
        let start = Instant::now();
        let mut idle = IdleSupervisor::starting_at(Duration::ZERO, 3 * SEC, start);

        assert_eq!(idle.poll(start + 2 * SEC), None);
        assert_eq!(idle.poll(start + 3 * SEC), Some(IdleEvent::WriterIdle));
        // re-armed from the firing point
        assert_eq!(idle.poll(start + 5 * SEC), None);
        assert_eq!(idle.poll(start + 6 * SEC), Some(IdleEvent::WriterIdle));
    }

    #[test]
    fn test_write_resets_writer_timer() {
        let start = Instant::now();
        let mut idle = IdleSupervisor::starting_at(Duration::ZERO, 3 * SEC, start);

        idle.record_write(start + 2 * SEC);
        assert_eq!(idle.poll(start + 4 * SEC), None);
        assert_eq!(idle.writer_deadline(), Some(start + 5 * SEC));
        assert_eq!(idle.poll(start + 5 * SEC), Some(IdleEvent::WriterIdle));
    }

    #[test]
    fn test_read_resets_reader_timer() {
        let start = Instant::now();
        let mut idle = IdleSupervisor::starting_at(9 * SEC, Duration::ZERO, start);

        idle.record_read(start + 8 * SEC);
        assert_eq!(idle.poll(start + 16 * SEC), None);
        assert_eq!(idle.poll(start + 17 * SEC), Some(IdleEvent::ReaderIdle));
    }

    #[test]
    fn test_timers_independent() {
        let start = Instant::now();
        let mut idle = IdleSupervisor::starting_at(9 * SEC, 3 * SEC, start);
        assert_eq!(idle.next_deadline(), Some(start + 3 * SEC));

        // writes do not keep the reader timer alive
        idle.record_write(start + 3 * SEC);
        idle.record_write(start + 6 * SEC);
        assert_eq!(idle.poll(start + 9 * SEC), Some(IdleEvent::ReaderIdle));
        assert_eq!(idle.poll(start + 9 * SEC), Some(IdleEvent::WriterIdle));
        assert_eq!(idle.poll(start + 9 * SEC), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_until_deadline() {
        let start = Instant::now();
        let mut idle = IdleSupervisor::new(Duration::ZERO, 3 * SEC);

        assert_eq!(idle.wait().await, IdleEvent::WriterIdle);
        assert!(start.elapsed() >= 3 * SEC);
        assert!(start.elapsed() < 4 * SEC);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_pends_when_disabled() {
        let mut idle = IdleSupervisor::new(Duration::ZERO, Duration::ZERO);
        let result = tokio::time::timeout(3600 * SEC, idle.wait()).await;
        assert!(result.is_err());
    }
}
