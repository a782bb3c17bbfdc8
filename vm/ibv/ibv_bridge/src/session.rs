// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-VM session state and the port dispatcher.

use crate::config::SessionConfig;
use crate::config::ViolationPolicy;
use crate::imp;
use crate::ratelimit::warn_ratelimited;
use crate::ratelimit::RateLimiter;
use crate::registry::ResourceHandle;
use crate::registry::ResourceKind;
use crate::registry::ResourceRegistry;
use crate::support::CallError;
use crate::support::PortIo;
use crate::verbs::IbvVerbs;
use crate::verbs::NativePtr;
use guestmem::GuestMemory;
use ibv_defs::IbvOpcode;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use thiserror::Error;

/// The outcome of [`IbvSession::dispatch`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The port is a verbs port and the call ran. Call-level failures are
    /// reported to the guest through the request's result field.
    Handled(IbvOpcode),
    /// The port is not a verbs port. Nothing was read or written.
    Unhandled(u16),
}

/// A dispatch failure that must stop the VM.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The violation policy ended the session.
    #[error("ibv session terminated after {violations} protocol violations")]
    Terminated {
        /// Violations seen by the session.
        violations: u32,
    },
}

/// The verbs bridge state for one running guest.
///
/// Construct one per VM and share it (by reference or [`Arc`]) with every VP
/// thread. Handles, the pool address and the violation count live as long as
/// the session.
#[derive(Debug)]
pub struct IbvSession {
    config: SessionConfig,
    guest_memory: GuestMemory,
    verbs: Arc<dyn IbvVerbs>,
    registry: ResourceRegistry,
    ib_pool_addr: OnceLock<u64>,
    violations: AtomicU32,
    terminated: AtomicBool,
    warn_limiter: RateLimiter,
    guest_log_limiter: RateLimiter,
}

impl IbvSession {
    /// Creates a session over `guest_memory`, forwarding calls to `verbs`.
    pub fn new(config: SessionConfig, guest_memory: GuestMemory, verbs: Arc<dyn IbvVerbs>) -> Self {
        tracing::info!(
            guest_memory_len = guest_memory.len(),
            use_ib_mem_pool = config.use_ib_mem_pool,
            policy = ?config.violation_policy,
            "ibv session created"
        );
        Self {
            registry: ResourceRegistry::new(config.max_handles),
            warn_limiter: RateLimiter::new(config.log_period_ms, config.log_events_per_period),
            guest_log_limiter: RateLimiter::new(
                config.log_period_ms,
                config.log_events_per_period,
            ),
            ib_pool_addr: OnceLock::new(),
            violations: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            config,
            guest_memory,
            verbs,
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The guest memory the session translates addresses against.
    pub fn guest_memory(&self) -> &GuestMemory {
        &self.guest_memory
    }

    /// The session's resource registry.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// The guest address of the IB memory pool, once the guest has set it.
    pub fn ib_pool_addr(&self) -> Option<u64> {
        self.ib_pool_addr.get().copied()
    }

    /// The number of protocol violations seen so far.
    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Returns true once the violation policy has ended the session.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn verbs(&self) -> &dyn IbvVerbs {
        self.verbs.as_ref()
    }

    pub(crate) fn guest_log_limiter(&self) -> &RateLimiter {
        &self.guest_log_limiter
    }

    pub(crate) fn warn_limiter(&self) -> &RateLimiter {
        &self.warn_limiter
    }

    /// Stores the pool address. Returns false if it was already set.
    pub(crate) fn set_ib_pool_addr(&self, addr: u64) -> bool {
        self.ib_pool_addr.set(addr).is_ok()
    }

    /// Resolves a guest-supplied handle.
    pub(crate) fn resolve(&self, raw: u64, kind: ResourceKind) -> Result<NativePtr, CallError> {
        self.registry
            .resolve(ResourceHandle::from_raw(raw), kind)
            .map_err(CallError::InvalidHandle)
    }

    /// Registers a native object and returns the raw handle for the guest.
    pub(crate) fn register(&self, native: NativePtr, kind: ResourceKind) -> Result<u64, CallError> {
        self.registry
            .register(native, kind)
            .map(ResourceHandle::raw)
            .map_err(CallError::Register)
    }

    /// Counts a violation. Returns true if the session is now terminated.
    fn record_violation(&self) -> bool {
        let violations = self.violations.fetch_add(1, Ordering::Relaxed) + 1;
        match self.config.violation_policy {
            ViolationPolicy::Report => false,
            ViolationPolicy::Terminate { threshold } => {
                if violations >= threshold && !self.terminated.swap(true, Ordering::AcqRel) {
                    tracing::error!(violations, "terminating ibv session");
                }
                violations >= threshold
            }
        }
    }

    /// Handles a trapped port write.
    ///
    /// Verbs ports run their executor on the request structure at the
    /// written guest address. Other ports are logged and left alone so the
    /// caller can route them elsewhere. Returns an error only when the
    /// session has been terminated, in which case no executor runs.
    pub fn dispatch(&self, mut io: impl PortIo) -> Result<Dispatched, DispatchError> {
        if self.is_terminated() {
            return Err(DispatchError::Terminated {
                violations: self.violations(),
            });
        }

        let port = io.port();
        let opcode = match IbvOpcode::try_from(port) {
            Ok(opcode) => opcode,
            Err(err) => {
                warn_ratelimited!(
                    self.warn_limiter,
                    port,
                    error = &err as &dyn std::error::Error,
                    "unhandled port write"
                );
                return Ok(Dispatched::Unhandled(port));
            }
        };

        let gpa = io.request_gpa();
        let handler = imp::handler(opcode);
        tracing::trace!(%opcode, gpa, "ibv call");
        if let Err(err) = (handler)(self, gpa) {
            warn_ratelimited!(
                self.warn_limiter,
                %opcode,
                gpa,
                error = &err as &dyn std::error::Error,
                "ibv call failed"
            );
            if err.is_violation() && self.record_violation() {
                return Err(DispatchError::Terminated {
                    violations: self.violations(),
                });
            }
        }
        Ok(Dispatched::Handled(opcode))
    }
}
