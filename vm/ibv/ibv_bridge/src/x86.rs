// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! X86-64 port I/O support.

use crate::support::PortIo;

/// An implementation of [`PortIo`] on the register state of a VP stopped at
/// an `out dx, eax` instruction.
///
/// The request address is the 32-bit value in `eax`.
pub struct X64PortRegisterIo<T> {
    inner: T,
}

impl<T: X64PortRegisterState> X64PortRegisterIo<T> {
    /// Returns a register accessor backed by `t`.
    pub fn new(t: T) -> Self {
        Self { inner: t }
    }
}

impl<T: X64PortRegisterState> PortIo for X64PortRegisterIo<T> {
    fn port(&mut self) -> u16 {
        self.inner.gp(X64PortRegister::Rdx) as u16
    }

    fn request_gpa(&mut self) -> u64 {
        self.inner.gp(X64PortRegister::Rax) & u32::MAX as u64
    }
}

/// The registers used by a port write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum X64PortRegister {
    /// RAX
    Rax,
    /// RDX
    Rdx,
}

/// Provides access to the x64 register state needed to decode a port write.
pub trait X64PortRegisterState {
    /// Gets a general purpose register.
    fn gp(&mut self, n: X64PortRegister) -> u64;
}

impl<T: X64PortRegisterState> X64PortRegisterState for &'_ mut T {
    fn gp(&mut self, n: X64PortRegister) -> u64 {
        (**self).gp(n)
    }
}
