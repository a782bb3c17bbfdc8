// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Support for decoding and running verbs calls.

use crate::registry::RegistryError;
use crate::IbvSession;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use ibv_defs::IbvOpcode;
use ibv_defs::IBV_EFAULT;
use ibv_defs::IBV_EINVAL;
use ibv_defs::IBV_ENOMEM;
use std::fmt::Debug;
use std::marker::PhantomData;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Provides the port and request address of a trapped port write.
pub trait PortIo {
    /// The I/O port the guest wrote.
    fn port(&mut self) -> u16;

    /// The guest address of the request structure, i.e. the value written.
    fn request_gpa(&mut self) -> u64;
}

impl<T: PortIo> PortIo for &mut T {
    fn port(&mut self) -> u16 {
        (**self).port()
    }

    fn request_gpa(&mut self) -> u64 {
        (**self).request_gpa()
    }
}

/// A port write as reported by a KVM-style `IoOut` exit: the port and the
/// raw little-endian data bytes.
#[derive(Debug, Copy, Clone)]
pub struct IoOutExit<'a> {
    port: u16,
    data: &'a [u8],
}

impl<'a> IoOutExit<'a> {
    /// Wraps the port and data of an `IoOut` exit.
    pub fn new(port: u16, data: &'a [u8]) -> Self {
        Self { port, data }
    }
}

impl PortIo for IoOutExit<'_> {
    fn port(&mut self) -> u16 {
        self.port
    }

    fn request_gpa(&mut self) -> u64 {
        let mut value = [0; 8];
        let n = self.data.len().min(value.len());
        value[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(value)
    }
}

/// The failure of a single verbs call at the protocol layer.
///
/// These never reach the native library: the call is abandoned, and the
/// request's result field gets a failure sentinel instead.
#[derive(Debug, Error)]
pub enum CallError {
    /// The request structure itself is not in guest memory. Nothing is
    /// written back.
    #[error("request structure out of bounds")]
    Request(#[source] GuestMemoryError),
    /// A guest address inside the request is out of bounds.
    #[error("guest address out of bounds")]
    OutOfBounds(#[source] GuestMemoryError),
    /// A resource handle inside the request is not valid.
    #[error("bad resource handle")]
    InvalidHandle(#[source] RegistryError),
    /// A native object could not be given a handle.
    #[error("failed to register native resource")]
    Register(#[source] RegistryError),
    /// The device name does not fit in the guest buffer.
    #[error("device name of {len} bytes does not fit in {capacity} bytes")]
    NameTooLong {
        /// Name length including the terminator.
        len: usize,
        /// Guest buffer size.
        capacity: usize,
    },
}

impl CallError {
    /// Returns true if the error is evidence of guest misbehavior and counts
    /// towards the session's violation policy.
    pub fn is_violation(&self) -> bool {
        match self {
            CallError::Request(_) | CallError::OutOfBounds(_) | CallError::InvalidHandle(_) => {
                true
            }
            CallError::Register(_) | CallError::NameTooLong { .. } => false,
        }
    }

    /// The positive errno reported to the guest for calls that return a
    /// status.
    pub fn errno(&self) -> i32 {
        match self {
            CallError::Request(_) | CallError::OutOfBounds(_) => IBV_EFAULT,
            CallError::InvalidHandle(_) | CallError::NameTooLong { .. } => IBV_EINVAL,
            CallError::Register(_) => IBV_ENOMEM,
        }
    }
}

/// A request structure passed by guest address.
pub trait WireRequest: IntoBytes + FromBytes + Immutable + KnownLayout + Copy + Debug {
    /// The port that carries this request.
    const OPCODE: IbvOpcode;

    /// Stores the failure sentinel in the result field.
    fn set_failure(&mut self, err: &CallError);
}

/// Output buffer writes made by a call.
///
/// Each range is checked when it is queued. The writes are applied after the
/// request structure has been written back, so an output buffer that
/// overlaps the request keeps the output. If the call fails they are
/// dropped.
#[derive(Debug)]
pub struct CallOutput<'a> {
    guest_memory: &'a GuestMemory,
    writes: Vec<(u64, Vec<u8>)>,
}

impl<'a> CallOutput<'a> {
    fn new(guest_memory: &'a GuestMemory) -> Self {
        Self {
            guest_memory,
            writes: Vec::new(),
        }
    }

    /// Queues a write of `data` at `gpa`.
    pub fn write(&mut self, gpa: u64, data: &[u8]) -> Result<(), CallError> {
        self.guest_memory
            .translate(gpa, data.len())
            .map_err(CallError::OutOfBounds)?;
        self.writes.push((gpa, data.to_vec()));
        Ok(())
    }

    /// Queues a write of `value` at `gpa`.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &mut self,
        gpa: u64,
        value: &T,
    ) -> Result<(), CallError> {
        self.write(gpa, value.as_bytes())
    }

    fn apply(self) -> Result<(), CallError> {
        for (gpa, data) in self.writes {
            self.guest_memory
                .write_at(gpa, &data)
                .map_err(CallError::OutOfBounds)?;
        }
        Ok(())
    }
}

/// A call whose request structure lives in guest memory.
pub struct IbvCall<R>(PhantomData<R>);

impl<R: WireRequest> IbvCall<R> {
    /// Reads the request at `gpa`, runs `f` on it, and writes it back
    /// followed by the outputs `f` queued.
    ///
    /// If `f` fails, the failure sentinel is stored before the write back
    /// and no outputs are written. If the request is not in guest memory,
    /// `f` is not run and nothing is written.
    pub fn run(
        session: &IbvSession,
        gpa: u64,
        f: impl FnOnce(&mut R, &mut CallOutput<'_>) -> Result<(), CallError>,
    ) -> Result<(), CallError> {
        let gm = session.guest_memory();
        // Check the whole range up front so the write back cannot fail.
        gm.translate(gpa, size_of::<R>())
            .map_err(CallError::Request)?;
        let mut request: R = gm.read_plain(gpa).map_err(CallError::Request)?;
        tracing::trace!(opcode = %R::OPCODE, gpa, ?request, "ibv request");
        let mut output = CallOutput::new(gm);
        let result = f(&mut request, &mut output);
        if let Err(err) = &result {
            request.set_failure(err);
        }
        gm.write_plain(gpa, &request).map_err(CallError::Request)?;
        result?;
        output.apply()
    }
}
