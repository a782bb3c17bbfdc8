// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! InfiniBand verbs paravirtualization.
//!
//! This crate lets a guest issue InfiniBand verbs calls against the host's
//! native verbs library. The guest fills in a request structure in its own
//! memory and writes the structure's guest physical address to one of the
//! verbs I/O ports (see [`ibv_defs::IbvOpcode`]). The VMM traps the write and
//! hands it to [`IbvSession::dispatch`], which validates the request, runs
//! the native call, and writes the result back into the structure before the
//! guest resumes.
//!
//! To use this crate, you provide access to guest memory, an [`IbvVerbs`]
//! implementation wrapping the native library, and a [`PortIo`] view of the
//! trapped port write ([`IoOutExit`] or [`X64PortRegisterIo`]).
//!
//! Native object pointers never reach the guest. The guest receives opaque
//! handles minted by the session's [`ResourceRegistry`], and every guest
//! address is bounds-checked before it is dereferenced.

#![forbid(unsafe_code)]

mod config;
mod imp;
mod ratelimit;
mod registry;
mod session;
mod support;
mod verbs;
mod x86;

pub use self::config::SessionConfig;
pub use self::config::ViolationPolicy;
pub use self::imp::*;
pub use self::registry::RegistryError;
pub use self::registry::ResourceHandle;
pub use self::registry::ResourceKind;
pub use self::registry::ResourceRegistry;
pub use self::registry::HANDLE_MAGIC;
pub use self::session::DispatchError;
pub use self::session::Dispatched;
pub use self::session::IbvSession;
pub use self::support::CallError;
pub use self::support::CallOutput;
pub use self::support::IbvCall;
pub use self::support::IoOutExit;
pub use self::support::PortIo;
pub use self::support::WireRequest;
pub use self::verbs::IbvVerbs;
pub use self::verbs::NativePtr;
pub use self::x86::X64PortRegister;
pub use self::x86::X64PortRegisterIo;
pub use self::x86::X64PortRegisterState;
