//! Fixed-window, per-principal rate limiting for tool execution.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Clone)]
struct PrincipalWindow {
    window_start_unix_ms: u64,
    requests_in_window: u32,
    throttle_events: u64,
}

impl PrincipalWindow {
    fn new(now_unix_ms: u64) -> Self {
        Self {
            window_start_unix_ms: now_unix_ms,
            requests_in_window: 0,
            throttle_events: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RateLimiterState {
    principals: HashMap<String, PrincipalWindow>,
    throttle_events_total: u64,
}

#[derive(Debug, Default)]
/// Public struct `ToolRateLimiter` used across Deckhand components.
pub struct ToolRateLimiter {
    state: Mutex<RateLimiterState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of one rate-limit evaluation.
pub enum RateLimitDecision {
    Allow,
    Throttled {
        retry_after_ms: u64,
        principal_throttle_events: u64,
        throttle_events_total: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Snapshot counters exposed for rate-limit observability.
pub struct RateLimitCounters {
    pub throttle_events_total: u64,
    pub tracked_principals: usize,
}

impl ToolRateLimiter {
    /// Evaluates and records one request for `principal`.
    ///
    /// The check and the consumption of the slot happen under one lock;
    /// two interleaved requests must never both pass the final slot of a
    /// window.
    pub fn evaluate(
        &self,
        principal: &str,
        max_requests: u32,
        window_ms: u64,
        now_unix_ms: u64,
    ) -> RateLimitDecision {
        if max_requests == 0 || window_ms == 0 {
            return RateLimitDecision::Allow;
        }

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let window = state
            .principals
            .entry(principal.to_string())
            .or_insert_with(|| PrincipalWindow::new(now_unix_ms));

        let elapsed = now_unix_ms.saturating_sub(window.window_start_unix_ms);
        if elapsed >= window_ms {
            window.window_start_unix_ms = now_unix_ms;
            window.requests_in_window = 0;
        }

        if window.requests_in_window < max_requests {
            window.requests_in_window += 1;
            return RateLimitDecision::Allow;
        }

        window.throttle_events += 1;
        let principal_throttle_events = window.throttle_events;
        let retry_after_ms =
            window_ms.saturating_sub(now_unix_ms.saturating_sub(window.window_start_unix_ms));
        state.throttle_events_total += 1;
        RateLimitDecision::Throttled {
            retry_after_ms,
            principal_throttle_events,
            throttle_events_total: state.throttle_events_total,
        }
    }

    pub fn counters(&self) -> RateLimitCounters {
        let state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        RateLimitCounters {
            throttle_events_total: state.throttle_events_total,
            tracked_principals: state.principals.len(),
        }
    }
}
