// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping between guest-visible resource handles and native objects.
//!
//! The guest never sees a native pointer. Each native object is entered into
//! an arena once, and the guest receives an opaque handle that encodes the
//! arena index together with the object kind and a per-session tag. Every
//! handle coming back from the guest is decoded and checked against the arena
//! before the native object it names is handed to the verbs library.
//!
//! Handle layout:
//!
//! | bits  | field                                 |
//! |-------|---------------------------------------|
//! | 63:56 | [`HANDLE_MAGIC`]                      |
//! | 55:52 | [`ResourceKind`]                      |
//! | 51:32 | session tag                           |
//! | 31:0  | arena index + 1                       |
//!
//! The magic byte makes every handle a non-canonical address, so no handle
//! can alias a native pointer value.

use crate::verbs::NativePtr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The top byte of every resource handle.
pub const HANDLE_MAGIC: u8 = 0xb1;

const KIND_SHIFT: u32 = 52;
const TAG_SHIFT: u32 = 32;
const TAG_MASK: u32 = (1 << 20) - 1;

static NEXT_SESSION_TAG: AtomicU32 = AtomicU32::new(1);

/// The kind of native object a handle names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    /// `struct ibv_device`.
    Device = 1,
    /// `struct ibv_context`.
    Context = 2,
    /// `struct ibv_comp_channel`.
    CompChannel = 3,
}

impl ResourceKind {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            1 => Self::Device,
            2 => Self::Context,
            3 => Self::CompChannel,
            _ => return None,
        })
    }
}

/// An opaque guest-visible token for a native object.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    /// Reinterprets a raw guest value as a handle. The value is not
    /// validated until it is resolved.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The value written to guest memory.
    pub const fn raw(self) -> u64 {
        self.0
    }

    fn encode(kind: ResourceKind, tag: u32, index: u32) -> Self {
        Self(
            (HANDLE_MAGIC as u64) << 56
                | (kind as u64) << KIND_SHIFT
                | ((tag & TAG_MASK) as u64) << TAG_SHIFT
                | (index as u64 + 1),
        )
    }

    fn decode(self) -> Option<(ResourceKind, u32, usize)> {
        if (self.0 >> 56) as u8 != HANDLE_MAGIC {
            return None;
        }
        let kind = ResourceKind::from_bits(((self.0 >> KIND_SHIFT) & 0xf) as u8)?;
        let tag = (self.0 >> TAG_SHIFT) as u32 & TAG_MASK;
        let index = (self.0 as u32).checked_sub(1)?;
        Some((kind, tag, index as usize))
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceHandle({:#x})", self.0)
    }
}

/// A registry failure.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The handle was not issued by this registry.
    #[error("invalid handle {0:#x}")]
    InvalidHandle(u64),
    /// The handle names an object of a different kind.
    #[error("handle {handle:#x} is a {actual:?}, expected a {expected:?}")]
    KindMismatch {
        /// The raw handle.
        handle: u64,
        /// The kind the caller required.
        expected: ResourceKind,
        /// The kind the handle names.
        actual: ResourceKind,
    },
    /// The native object is already registered as a different kind.
    #[error("{native:?} already registered as a {existing:?}")]
    KindConflict {
        /// The native object.
        native: NativePtr,
        /// The kind it was first registered as.
        existing: ResourceKind,
    },
    /// No more handles can be issued in this session.
    #[error("handle limit of {0} reached")]
    Exhausted(usize),
}

/// The per-session resource registry.
///
/// Registration deduplicates on the native pointer: the first registration
/// of an object mints its handle, and every later registration of the same
/// object, from any VP, returns that handle. Entries live until the registry
/// is dropped with its session.
#[derive(Debug)]
pub struct ResourceRegistry {
    tag: u32,
    max_handles: usize,
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entries: Vec<Entry>,
    by_native: HashMap<NativePtr, ResourceHandle>,
}

#[derive(Debug)]
struct Entry {
    native: NativePtr,
    kind: ResourceKind,
}

impl ResourceRegistry {
    /// Creates an empty registry with a fresh session tag.
    pub fn new(max_handles: usize) -> Self {
        let tag = loop {
            let tag = NEXT_SESSION_TAG.fetch_add(1, Ordering::Relaxed) & TAG_MASK;
            if tag != 0 {
                break tag;
            }
        };
        Self {
            tag,
            max_handles: max_handles.min(u32::MAX as usize - 1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Returns the handle for `native`, minting one on first registration.
    pub fn register(
        &self,
        native: NativePtr,
        kind: ResourceKind,
    ) -> Result<ResourceHandle, RegistryError> {
        let mut inner = self.inner.lock();
        if let Some(&handle) = inner.by_native.get(&native) {
            let existing = inner.entries[Self::index(handle)].kind;
            if existing != kind {
                return Err(RegistryError::KindConflict { native, existing });
            }
            return Ok(handle);
        }
        let index = inner.entries.len();
        if index >= self.max_handles {
            return Err(RegistryError::Exhausted(self.max_handles));
        }
        let handle = ResourceHandle::encode(kind, self.tag, index as u32);
        debug_assert_ne!(handle.raw(), native.addr() as u64);
        inner.entries.push(Entry { native, kind });
        inner.by_native.insert(native, handle);
        tracing::debug!(?handle, ?native, ?kind, "registered native resource");
        Ok(handle)
    }

    /// Returns the native object named by `handle`, which must be of `kind`.
    pub fn resolve(
        &self,
        handle: ResourceHandle,
        kind: ResourceKind,
    ) -> Result<NativePtr, RegistryError> {
        let invalid = || RegistryError::InvalidHandle(handle.raw());
        let (handle_kind, tag, index) = handle.decode().ok_or_else(invalid)?;
        if tag != self.tag {
            return Err(invalid());
        }
        let inner = self.inner.lock();
        let entry = inner.entries.get(index).ok_or_else(invalid)?;
        // The kind bits are guest controlled; trust only the arena.
        if entry.kind != handle_kind {
            return Err(invalid());
        }
        if entry.kind != kind {
            return Err(RegistryError::KindMismatch {
                handle: handle.raw(),
                expected: kind,
                actual: entry.kind,
            });
        }
        Ok(entry.native)
    }

    /// Returns the number of registered objects.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(handle: ResourceHandle) -> usize {
        (handle.raw() as u32 - 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn ptr(addr: usize) -> NativePtr {
        NativePtr::new(addr).unwrap()
    }

    #[test]
    fn test_register_resolve() {
        let reg = ResourceRegistry::new(16);
        let dev = ptr(0x7f00_1234_5000);
        let h = reg.register(dev, ResourceKind::Device).unwrap();
        assert_ne!(h.raw(), dev.addr() as u64);
        assert_eq!(h.raw() >> 56, HANDLE_MAGIC as u64);
        assert_eq!(reg.resolve(h, ResourceKind::Device).unwrap(), dev);
    }

    #[test]
    fn test_register_dedups() {
        let reg = ResourceRegistry::new(16);
        let a = reg.register(ptr(0x1000), ResourceKind::Device).unwrap();
        let b = reg.register(ptr(0x2000), ResourceKind::Device).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.register(ptr(0x1000), ResourceKind::Device).unwrap(), a);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_kind_is_enforced() {
        let reg = ResourceRegistry::new(16);
        let dev = reg.register(ptr(0x1000), ResourceKind::Device).unwrap();
        assert!(matches!(
            reg.resolve(dev, ResourceKind::Context),
            Err(RegistryError::KindMismatch {
                expected: ResourceKind::Context,
                actual: ResourceKind::Device,
                ..
            })
        ));
        assert!(matches!(
            reg.register(ptr(0x1000), ResourceKind::Context),
            Err(RegistryError::KindConflict {
                existing: ResourceKind::Device,
                ..
            })
        ));

        // Forge the kind bits of a real handle.
        let forged = ResourceHandle::from_raw(
            (dev.raw() & !(0xf << KIND_SHIFT)) | (ResourceKind::Context as u64) << KIND_SHIFT,
        );
        assert!(matches!(
            reg.resolve(forged, ResourceKind::Context),
            Err(RegistryError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_unissued_handles_fail() {
        let reg = ResourceRegistry::new(16);
        let h = reg.register(ptr(0x1000), ResourceKind::Device).unwrap();
        for raw in [0, 0x1000, u64::MAX, h.raw() + 1, h.raw() & !0xffff_ffff] {
            assert!(
                matches!(
                    reg.resolve(ResourceHandle::from_raw(raw), ResourceKind::Device),
                    Err(RegistryError::InvalidHandle(r)) if r == raw
                ),
                "{raw:#x}"
            );
        }
    }

    #[test]
    fn test_handles_are_per_session() {
        let a = ResourceRegistry::new(16);
        let b = ResourceRegistry::new(16);
        let h = a.register(ptr(0x1000), ResourceKind::Device).unwrap();
        b.register(ptr(0x1000), ResourceKind::Device).unwrap();
        assert!(matches!(
            b.resolve(h, ResourceKind::Device),
            Err(RegistryError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_limit() {
        let reg = ResourceRegistry::new(2);
        reg.register(ptr(0x1000), ResourceKind::Device).unwrap();
        reg.register(ptr(0x2000), ResourceKind::Context).unwrap();
        assert!(matches!(
            reg.register(ptr(0x3000), ResourceKind::Context),
            Err(RegistryError::Exhausted(2))
        ));
        // Existing objects still resolve to their handle.
        reg.register(ptr(0x1000), ResourceKind::Device).unwrap();
    }

    #[test]
    fn test_concurrent_register_agrees() {
        const THREADS: usize = 8;
        let reg = ResourceRegistry::new(64);
        let barrier = Barrier::new(THREADS);
        let handles: Vec<_> = std::thread::scope(|s| {
            let threads: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        reg.register(ptr(0xdead_b000), ResourceKind::Context)
                            .unwrap()
                    })
                })
                .collect();
            threads.into_iter().map(|t| t.join().unwrap()).collect()
        });
        assert!(handles.iter().all(|&h| h == handles[0]));
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.resolve(handles[0], ResourceKind::Context).unwrap(),
            ptr(0xdead_b000)
        );
    }
}
