// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate limiting for events the guest can trigger at will.
//!
//! A guest can hammer an I/O port as fast as it likes. Warnings about bad
//! requests, and the guest's own log lines, are therefore passed through a
//! per-session limiter so they cannot drown out everything else.

use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

/// A fixed-window event limiter.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    events_per_period: u32,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug)]
struct RateLimiterState {
    start: Option<Instant>,
    events: u32,
    missed: u64,
}

/// The event was dropped.
#[derive(Debug)]
pub struct RateLimited;

impl RateLimiter {
    /// Allows `events_per_period` events every `period_ms` milliseconds.
    pub fn new(period_ms: u32, events_per_period: u32) -> Self {
        Self {
            period: Duration::from_millis(period_ms.into()),
            events_per_period,
            state: Mutex::new(RateLimiterState {
                start: None,
                events: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Ok(missed_events)` if this event should be logged.
    ///
    /// `missed_events` is `Some(n)` if events were dropped since the last
    /// logged one, or if this event is the last one before limiting kicks in.
    pub fn event(&self) -> Result<Option<u64>, RateLimited> {
        self.event_at(Instant::now())
    }

    fn event_at(&self, now: Instant) -> Result<Option<u64>, RateLimited> {
        // Contention means another VP is logging right now; drop rather than
        // wait.
        let mut state = self.state.try_lock().ok_or(RateLimited)?;
        let start = *state.start.get_or_insert(now);
        if now.duration_since(start) > self.period {
            state.start = Some(now);
            state.events = 0;
        }
        if state.events >= self.events_per_period {
            state.missed += 1;
            return Err(RateLimited);
        }
        state.events += 1;
        let missed = std::mem::take(&mut state.missed);
        Ok((missed != 0 || state.events == self.events_per_period).then_some(missed))
    }
}

/// As [`tracing::warn!`], but dropped when `$limiter` is over its limit.
macro_rules! warn_ratelimited {
    ($limiter:expr, $($rest:tt)*) => {
        match $limiter.event() {
            Ok(None) => ::tracing::warn!($($rest)*),
            Ok(Some(missed_events)) => ::tracing::warn!(missed_events, $($rest)*),
            Err($crate::ratelimit::RateLimited) => {}
        }
    };
}

/// As [`tracing::info!`], but dropped when `$limiter` is over its limit.
macro_rules! info_ratelimited {
    ($limiter:expr, target: $target:expr, $($rest:tt)*) => {
        match $limiter.event() {
            Ok(None) => ::tracing::info!(target: $target, $($rest)*),
            Ok(Some(missed_events)) => {
                ::tracing::info!(target: $target, missed_events, $($rest)*)
            }
            Err($crate::ratelimit::RateLimited) => {}
        }
    };
}

pub(crate) use info_ratelimited;
pub(crate) use warn_ratelimited;
