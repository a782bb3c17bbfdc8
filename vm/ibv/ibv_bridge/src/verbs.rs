// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The boundary to the host's native verbs library.

use ibv_defs::PortAttr;
use std::ffi::CString;
use std::num::NonZeroUsize;

/// The identity of a native verbs object (`struct ibv_device *`,
/// `struct ibv_context *`, `struct ibv_comp_channel *`).
///
/// This value is host-only. It is never written to guest memory; the guest
/// refers to the object through a [`ResourceHandle`](crate::ResourceHandle).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NativePtr(NonZeroUsize);

impl NativePtr {
    /// Wraps a native address, returning `None` for NULL.
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Wraps a native pointer, returning `None` for NULL.
    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// Returns the native address.
    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// Returns the native pointer.
    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl std::fmt::Debug for NativePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativePtr({:#x})", self.0)
    }
}

/// The trusted native verbs primitives.
///
/// Implementations wrap the host's verbs library. Every object passed in was
/// previously returned by the same implementation; every object returned is
/// registered before the guest can see it. `None` stands for a NULL return.
///
/// Calls may block on the device driver; the calling VP stalls until they
/// return.
pub trait IbvVerbs: Send + Sync {
    /// `ibv_get_device_list`: enumerates the available devices.
    fn get_device_list(&self) -> Option<Vec<NativePtr>>;

    /// `ibv_get_device_name`: returns a copy of the device's name.
    fn get_device_name(&self, device: NativePtr) -> Option<CString>;

    /// `ibv_open_device`: opens a context on `device`.
    fn open_device(&self, device: NativePtr) -> Option<NativePtr>;

    /// `ibv_query_port`: fills `attr` and returns the native status, 0 on
    /// success.
    fn query_port(&self, context: NativePtr, port_num: u8, attr: &mut PortAttr) -> i32;

    /// `ibv_create_comp_channel`: creates a completion channel on `context`.
    fn create_comp_channel(&self, context: NativePtr) -> Option<NativePtr>;
}

impl std::fmt::Debug for dyn IbvVerbs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("IbvVerbs")
    }
}
