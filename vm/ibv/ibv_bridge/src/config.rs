// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Session configuration.

/// What to do when a guest violates the call protocol (an out-of-bounds
/// address or a handle that was never issued).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Fail the individual call and keep running.
    #[default]
    Report,
    /// Fail the individual call, and terminate the session once `threshold`
    /// violations have been seen.
    Terminate {
        /// Number of violations that ends the session. A value of 1 makes
        /// the first violation fatal.
        threshold: u32,
    },
}

/// Configuration for an [`IbvSession`](crate::IbvSession).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether the guest may register an IB memory pool.
    pub use_ib_mem_pool: bool,
    /// Escalation policy for protocol violations.
    pub violation_policy: ViolationPolicy,
    /// Maximum number of resource handles issued in the session.
    pub max_handles: usize,
    /// Maximum length of one guest kernel log line, in bytes.
    pub max_log_len: usize,
    /// Rate limit period for guest-triggered log events.
    pub log_period_ms: u32,
    /// Guest-triggered log events allowed per period.
    pub log_events_per_period: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_ib_mem_pool: false,
            violation_policy: ViolationPolicy::Report,
            max_handles: 4096,
            max_log_len: 256,
            log_period_ms: 5000,
            log_events_per_period: 10,
        }
    }
}
