// ABOUTME: Deadline-paced batch transmission for a client session
//
// Deadlines are computed from the session start and advance by a fixed
// batch interval, never from "now", so a late batch is followed by an
// immediate catch-up send instead of permanent drift:
//
//   t0      t0+I     t0+2I    t0+3I
//   |-send--|-send---|--(late)-send|send   <- deadline keeps its grid

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use super::session::{ClientSession, RateConfig, SessionResult, SessionState};
use super::ClientError;

/// Byte used to fill outgoing packets
const FILL_BYTE: u8 = b'X';

/// Cooperative cancellation shared between a session and its controller
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once `cancel` has been called
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Achieved rate outside the tolerated band around the target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDeviation {
    pub target: f64,
    pub achieved: f64,
    /// Relative deviation, `|achieved - target| / target`
    pub deviation: f64,
}

impl RateDeviation {
    pub fn check(target: f64, achieved: f64, tolerance: f64) -> Option<Self> {
        if target <= 0.0 {
            return None;
        }
        let deviation = (achieved - target).abs() / target;
        (deviation > tolerance).then_some(Self {
            target,
            achieved,
            deviation,
        })
    }
}

/// Paces batches onto a connected stream
#[derive(Debug, Clone)]
pub struct RateController {
    rate: RateConfig,
    tolerance: f64,
    cancel: CancelHandle,
}

impl RateController {
    pub const fn new(rate: RateConfig, tolerance: f64, cancel: CancelHandle) -> Self {
        Self {
            rate,
            tolerance,
            cancel,
        }
    }

    /// Send batches until `duration` elapses or the session is cancelled
    ///
    /// A failed batch counts one send error and triggers a reconnect; only an
    /// exhausted reconnect budget ends the session early with an error.
    pub async fn transmit(
        &self,
        stream: &mut TcpStream,
        session: &mut ClientSession,
        manager: &mut ConnectionManager,
        duration: Duration,
    ) -> Result<SessionResult, ClientError> {
        let batch = vec![FILL_BYTE; self.rate.batch_bytes()];
        let batch_packets = self.rate.batch_size() as u64;
        let interval = self.rate.batch_interval();

        let started = Instant::now();
        let end = started + duration;
        let mut deadline = started;
        let mut batches = 0u64;
        let mut last_send: Option<Instant> = None;
        let mut max_gap = Duration::ZERO;

        session.set_state(SessionState::Transmitting);
        info!(
            session = %session.id(),
            target_rate = self.rate.target_rate(),
            batch_size = self.rate.batch_size(),
            interval_us = %interval.as_micros(),
            duration_ms = %duration.as_millis(),
            "Transmission started"
        );

        loop {
            if self.cancel.is_cancelled() || Instant::now() >= end {
                break;
            }

            if deadline > Instant::now() {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline.min(end)) => {}
                    () = self.cancel.cancelled() => break,
                }
                if Instant::now() >= end {
                    break;
                }
            }

            match stream.write_all(&batch).await {
                Ok(()) => {
                    let now = Instant::now();
                    if let Some(previous) = last_send {
                        max_gap = max_gap.max(now - previous);
                    }
                    last_send = Some(now);

                    batches += 1;
                    session.record_batch(batch_packets, batch.len() as u64);
                }
                Err(e) => {
                    session.record_send_error();
                    warn!(session = %session.id(), error = %e, "Batch send failed, reconnecting");

                    session.set_state(SessionState::Connecting);
                    match manager.reconnect().await {
                        Ok(established) => {
                            *stream = established.stream;
                            session.record_reconnect();
                            session.set_state(SessionState::Transmitting);
                            // The outage is not part of the pacing gap
                            last_send = None;
                        }
                        Err(e) => {
                            session.set_state(SessionState::Closed);
                            let result = self.summarize(session, started, batches, max_gap);
                            error!(
                                session = %result.id,
                                packets = result.packets_sent,
                                errors = result.send_errors,
                                error = %e,
                                "Reconnect budget exhausted, aborting session"
                            );
                            return Err(ClientError::SessionAborted {
                                result: Box::new(result),
                                source: Box::new(e),
                            });
                        }
                    }
                }
            }

            deadline += interval;
        }

        if let Err(e) = stream.flush().await {
            debug!(session = %session.id(), error = %e, "Flush after transmission failed");
        }
        session.set_state(SessionState::Connected);

        let result = self.summarize(session, started, batches, max_gap);
        if !result.within_tolerance {
            warn!(
                session = %result.id,
                target = result.target_rate,
                achieved = result.achieved_rate,
                "Achieved rate outside tolerance"
            );
        }

        info!(
            session = %result.id,
            packets = result.packets_sent,
            bytes = result.bytes_sent,
            errors = result.send_errors,
            rate = result.achieved_rate,
            elapsed_ms = %result.elapsed.as_millis(),
            "Transmission completed"
        );
        Ok(result)
    }

    /// Fold the session counters into a result at the current instant
    fn summarize(
        &self,
        session: &ClientSession,
        started: Instant,
        batches: u64,
        max_gap: Duration,
    ) -> SessionResult {
        let elapsed = started.elapsed();
        let counters = session.counters();
        let achieved_rate = if elapsed.is_zero() {
            0.0
        } else {
            counters.packets_sent as f64 / elapsed.as_secs_f64()
        };
        let deviation = RateDeviation::check(self.rate.target_rate(), achieved_rate, self.tolerance);

        SessionResult {
            id: session.id().to_string(),
            packets_sent: counters.packets_sent,
            bytes_sent: counters.bytes_sent,
            send_errors: counters.send_errors,
            reconnects: counters.reconnects,
            batches,
            elapsed,
            target_rate: self.rate.target_rate(),
            achieved_rate,
            max_batch_gap: max_gap,
            within_tolerance: deviation.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_deviation_within_tolerance() {
        assert!(RateDeviation::check(1000.0, 1040.0, 0.05).is_none());
        assert!(RateDeviation::check(1000.0, 960.0, 0.05).is_none());
    }

    #[test]
    fn test_rate_deviation_outside_tolerance() {
        let deviation = RateDeviation::check(1000.0, 800.0, 0.05).unwrap();
        assert!((deviation.deviation - 0.2).abs() < 1e-9);
        assert!((deviation.achieved - 800.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cancel_handle_wakes_waiter() {
        let cancel = CancelHandle::new();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.cancelled().await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(100), cancel.cancelled())
            .await
            .unwrap();
    }
}
