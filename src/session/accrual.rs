use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::machine::{Flow, LiveSession, Shared};
use super::record::{EndReason, Session, SessionState};
use crate::error::EngineResult;
use crate::quota::{counter_delta, elapsed_seconds};

impl Shared {
    /// Accrue usage for an Active session until it leaves the Active state
    pub(super) async fn run_active(
        &self,
        live: &LiveSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        loop {
            let delay = {
                let mut session = live.record.lock().await;
                if session.state != SessionState::Active {
                    return Flow::Continue;
                }

                let now = self.clock.now();

                // Stop queued while the grant was in flight
                if let Some(reason) = session.pending_stop {
                    match self.begin_stopping(live, &mut session, reason, now).await {
                        Ok(()) => return Flow::Continue,
                        Err(e) => {
                            error!("Failed to apply queued stop for session {}: {}", session.id, e);
                        }
                    }
                }

                match self.accrue(live, &mut session, now).await {
                    Ok(Some(_)) => return Flow::Continue,
                    Ok(None) => self.next_tick_delay(&session, now).await,
                    Err(e) => {
                        error!(
                            "Accrual for session {} failed, retrying next interval: {}",
                            session.id, e
                        );
                        self.config.accrual_interval
                    }
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = live.wake.notified() => {}
                _ = shutdown.changed() => return Flow::Shutdown,
            }
        }
    }

    /// Charge the time elapsed and data metered since the last accrual.
    ///
    /// Returns the exhaustion reason if the charge moved the session to
    /// Stopping. When the debit fails nothing is charged and the session is
    /// left as it was.
    pub(super) async fn accrue(
        &self,
        live: &LiveSession,
        session: &mut Session,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<EndReason>> {
        let elapsed = elapsed_seconds(session.last_accrual, now);

        let (data, reading) = match self
            .meter
            .bytes_transferred(&session.subscriber, &session.id)
            .await
        {
            Ok(reading) => (counter_delta(session.metered_bytes, reading), reading),
            Err(e) => {
                // The counter is cumulative, so the next reading catches up
                warn!("Failed to read usage for session {}: {:#}", session.id, e);
                (0, session.metered_bytes)
            }
        };

        let unchanged = elapsed == 0 && data == 0 && reading == session.metered_bytes;
        let balance = if unchanged {
            self.balances.read(&session.subscriber).await
        } else {
            self.balances
                .debit(&session.subscriber, data, elapsed)
                .await?
        };

        // Time takes precedence when both run out in one tick
        let exhausted = if balance.time.is_exhausted() {
            Some(EndReason::TimeExhausted)
        } else if balance.data.is_exhausted() {
            Some(EndReason::DataExhausted)
        } else {
            None
        };

        if unchanged && exhausted.is_none() {
            return Ok(None);
        }

        let mut updated = session.clone();
        updated.usage.add(data, elapsed);
        updated.metered_bytes = reading;
        // Carry the sub-second remainder into the next tick
        updated.last_accrual = session.last_accrual + chrono::Duration::seconds(elapsed as i64);

        if let Some(reason) = exhausted {
            updated.state = SessionState::Stopping;
            updated.end_reason = Some(reason);
            updated.pending_stop = None;
            info!(
                "Session {} for {} stopping: {}",
                session.id, session.subscriber, reason
            );
        } else {
            debug!(
                "Session {} accrued {} bytes, {}s",
                session.id, data, elapsed
            );
        }

        self.commit_charged(live, session, updated);

        if exhausted.is_some() {
            live.wake.notify_one();
        }
        Ok(exhausted)
    }

    /// Sleep until the next interval, or until the time allowance runs out
    async fn next_tick_delay(&self, session: &Session, now: DateTime<Utc>) -> Duration {
        let interval = self.config.accrual_interval;
        let balance = self.balances.read(&session.subscriber).await;

        match balance.time.remaining() {
            None => interval,
            Some(remaining) => {
                let since_last = (now - session.last_accrual)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Duration::from_secs(remaining)
                    .saturating_sub(since_last)
                    .min(interval)
            }
        }
    }
}
