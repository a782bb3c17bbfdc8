// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to read and write guest memory.
//!
//! The guest's physical address space is presented to the host as a single
//! contiguous mapping, so a guest physical address is simply an offset into
//! that mapping. Every access is bounds checked against the mapping length
//! before any host memory is touched.

// UNSAFETY: Building a host view of a raw guest memory mapping.
#![expect(unsafe_code)]

use std::fmt::Debug;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Page size used for heap-backed guest memory.
pub const PAGE_SIZE: usize = 4096;

/// A memory access error returned by one of the [`GuestMemory`] methods.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct GuestMemoryError(Box<GuestMemoryErrorInner>);

impl GuestMemoryError {
    fn new(
        debug_name: &Arc<str>,
        gpa: u64,
        len: usize,
        op: GuestMemoryOperation,
        kind: GuestMemoryErrorKind,
    ) -> Self {
        GuestMemoryError(Box::new(GuestMemoryErrorInner {
            op,
            debug_name: debug_name.clone(),
            gpa,
            len,
            kind,
        }))
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> GuestMemoryErrorKind {
        self.0.kind
    }

    /// Returns the guest address of the failed access.
    pub fn gpa(&self) -> u64 {
        self.0.gpa
    }
}

#[derive(Debug, Copy, Clone)]
enum GuestMemoryOperation {
    Translate,
    Read,
    Write,
    Fill,
}

impl std::fmt::Display for GuestMemoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            GuestMemoryOperation::Translate => "translate",
            GuestMemoryOperation::Read => "read",
            GuestMemoryOperation::Write => "write",
            GuestMemoryOperation::Fill => "fill",
        })
    }
}

#[derive(Debug, Error)]
struct GuestMemoryErrorInner {
    op: GuestMemoryOperation,
    debug_name: Arc<str>,
    gpa: u64,
    len: usize,
    kind: GuestMemoryErrorKind,
}

impl std::fmt::Display for GuestMemoryErrorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "guest memory '{debug_name}': {op} error: failed to access {gpa:#x}+{len:#x}: {kind}",
            debug_name = self.debug_name,
            op = self.op,
            gpa = self.gpa,
            len = self.len,
            kind = self.kind,
        )
    }
}

/// The kind of memory access error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GuestMemoryErrorKind {
    /// The range extends past the end of the mapping.
    OutOfRange,
    /// The address plus length overflows the address space.
    Overflow,
}

impl std::fmt::Display for GuestMemoryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            GuestMemoryErrorKind::OutOfRange => "no memory at address",
            GuestMemoryErrorKind::Overflow => "address overflow",
        })
    }
}

/// A guest memory backing that is one contiguous host mapping.
///
/// # Safety
///
/// The implementor guarantees that `mapping()..mapping() + len()` is valid
/// for reads and writes for the lifetime of the object, and that the
/// returned values never change. The memory may be concurrently modified by
/// the guest, so it is only ever accessed through [`AtomicU8`].
pub unsafe trait GuestMemoryAccess: 'static + Send + Sync {
    /// Returns the base of the mapping.
    fn mapping(&self) -> NonNull<u8>;

    /// Returns the length of the mapping in bytes.
    fn len(&self) -> usize;
}

/// A page-aligned heap allocation for use with [`GuestMemory`].
pub struct AlignedHeapMemory {
    pages: Box<[AlignedPage]>,
}

impl Debug for AlignedHeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedHeapMemory")
            .field("len", &self.pages.len())
            .finish()
    }
}

#[repr(C, align(4096))]
struct AlignedPage([AtomicU8; PAGE_SIZE]);

impl AlignedHeapMemory {
    /// Allocates a new memory of `size` bytes, rounded up to a page size.
    pub fn new(size: usize) -> Self {
        let mut pages = Vec::new();
        pages.resize_with(size.div_ceil(PAGE_SIZE), || {
            AlignedPage(std::array::from_fn(|_| AtomicU8::new(0)))
        });
        Self {
            pages: pages.into(),
        }
    }
}

// SAFETY: the allocation remains alive and valid for the lifetime of the
// object, and its bytes are atomics.
unsafe impl GuestMemoryAccess for AlignedHeapMemory {
    fn mapping(&self) -> NonNull<u8> {
        NonNull::from(&*self.pages).cast()
    }

    fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }
}

/// An externally owned mapping, such as the buffer handed to the hypervisor
/// as guest RAM.
struct RawMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory with no thread affinity; all access
// goes through atomics.
unsafe impl Send for RawMapping {}
// SAFETY: as above.
unsafe impl Sync for RawMapping {}

// SAFETY: the caller of `GuestMemory::from_raw` guaranteed the validity of
// the mapping for the lifetime of this object.
unsafe impl GuestMemoryAccess for RawMapping {
    fn mapping(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A handle to guest memory.
///
/// Cloning is cheap; clones share the same mapping. All methods take `&self`
/// and may be called concurrently from any number of VP threads.
#[derive(Clone)]
pub struct GuestMemory {
    inner: Arc<GuestMemoryInner>,
}

struct GuestMemoryInner {
    debug_name: Arc<str>,
    imp: Box<dyn GuestMemoryAccess>,
}

impl Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("debug_name", &self.inner.debug_name)
            .field("len", &self.len())
            .finish()
    }
}

impl GuestMemory {
    /// Returns a new instance using `imp` as the backing.
    ///
    /// `debug_name` is used to specify which guest memory is being accessed in
    /// error messages.
    pub fn new(debug_name: impl Into<Arc<str>>, imp: impl GuestMemoryAccess) -> Self {
        GuestMemory {
            inner: Arc::new(GuestMemoryInner {
                debug_name: debug_name.into(),
                imp: Box::new(imp),
            }),
        }
    }

    /// Allocates zeroed guest memory of `size` bytes, rounded up to a page.
    pub fn allocate(size: usize) -> Self {
        Self::new("heap", AlignedHeapMemory::new(size))
    }

    /// Returns guest memory over an existing host mapping.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes until every
    /// clone of the returned object has been dropped, and must not be
    /// accessed by the host other than through atomic or volatile operations
    /// during that time.
    pub unsafe fn from_raw(debug_name: impl Into<Arc<str>>, base: NonNull<u8>, len: usize) -> Self {
        Self::new(debug_name, RawMapping { base, len })
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.imp.len()
    }

    /// Returns true if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bytes(&self) -> &[AtomicU8] {
        let imp = &self.inner.imp;
        // SAFETY: `GuestMemoryAccess` guarantees the mapping is valid for
        // `len` bytes for the lifetime of `imp`, which outlives `&self`.
        // `AtomicU8` has the same layout as `u8`.
        unsafe { std::slice::from_raw_parts(imp.mapping().as_ptr().cast::<AtomicU8>(), imp.len()) }
    }

    fn check_range(
        &self,
        gpa: u64,
        len: usize,
        op: GuestMemoryOperation,
    ) -> Result<Range<usize>, GuestMemoryError> {
        let err = |kind| GuestMemoryError::new(&self.inner.debug_name, gpa, len, op, kind);
        let end = gpa
            .checked_add(len as u64)
            .ok_or_else(|| err(GuestMemoryErrorKind::Overflow))?;
        if end > self.len() as u64 {
            return Err(err(GuestMemoryErrorKind::OutOfRange));
        }
        Ok(gpa as usize..end as usize)
    }

    /// Translates the guest range `gpa..gpa + len` to a host view.
    ///
    /// Fails unless the entire range lies inside the mapping.
    pub fn translate(&self, gpa: u64, len: usize) -> Result<&[AtomicU8], GuestMemoryError> {
        let range = self.check_range(gpa, len, GuestMemoryOperation::Translate)?;
        Ok(&self.bytes()[range])
    }

    /// Returns the host address backing guest address `gpa`, checking that
    /// `len` bytes are mapped there.
    pub fn host_address(&self, gpa: u64, len: usize) -> Result<NonNull<u8>, GuestMemoryError> {
        let range = self.check_range(gpa, len, GuestMemoryOperation::Translate)?;
        Ok(NonNull::from(&self.bytes()[range.start..]).cast())
    }

    /// Reads from guest memory address `gpa` into `dest`.
    pub fn read_at(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError> {
        let range = self.check_range(gpa, dest.len(), GuestMemoryOperation::Read)?;
        for (d, s) in dest.iter_mut().zip(&self.bytes()[range]) {
            *d = s.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes `src` into guest memory at address `gpa`.
    pub fn write_at(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let range = self.check_range(gpa, src.len(), GuestMemoryOperation::Write)?;
        for (d, s) in self.bytes()[range].iter().zip(src) {
            d.store(*s, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes `len` bytes of `val` into guest memory at address `gpa`.
    pub fn fill_at(&self, gpa: u64, val: u8, len: usize) -> Result<(), GuestMemoryError> {
        let range = self.check_range(gpa, len, GuestMemoryOperation::Fill)?;
        for d in &self.bytes()[range] {
            d.store(val, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads an object from guest memory at address `gpa`.
    ///
    /// The object is read bytewise; concurrent guest writes may be observed
    /// torn.
    pub fn read_plain<T: IntoBytes + FromBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
    ) -> Result<T, GuestMemoryError> {
        let mut value: T = FromZeros::new_zeroed();
        self.read_at(gpa, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Writes an object to guest memory at address `gpa`.
    pub fn write_plain<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        gpa: u64,
        b: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write_at(gpa, b.as_bytes())
    }

    /// Reads a NUL-terminated string starting at `gpa`.
    ///
    /// At most `max_len` bytes are read, and the read stops at the end of the
    /// mapping. The terminator is not included. Fails only if `gpa` itself is
    /// not mapped.
    pub fn read_cstr(&self, gpa: u64, max_len: usize) -> Result<Vec<u8>, GuestMemoryError> {
        let start = self.check_range(gpa, 1, GuestMemoryOperation::Read)?.start;
        let end = start.saturating_add(max_len).min(self.len());
        Ok(self.bytes()[start..end]
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .take_while(|&b| b != 0)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_translate_bounds() {
        let gm = GuestMemory::allocate(PAGE_SIZE * 2);
        let len = gm.len() as u64;
        assert_eq!(gm.translate(0, PAGE_SIZE * 2).unwrap().len(), PAGE_SIZE * 2);
        assert_eq!(gm.translate(len - 8, 8).unwrap().len(), 8);
        assert_eq!(
            gm.translate(len - 7, 8).unwrap_err().kind(),
            GuestMemoryErrorKind::OutOfRange
        );
        assert_eq!(
            gm.translate(len, 1).unwrap_err().kind(),
            GuestMemoryErrorKind::OutOfRange
        );
        assert_eq!(
            gm.translate(u64::MAX, 2).unwrap_err().kind(),
            GuestMemoryErrorKind::Overflow
        );
        gm.translate(PAGE_SIZE64 * 3, 0).unwrap_err();
    }

    #[test]
    fn test_read_write() {
        let gm = GuestMemory::allocate(PAGE_SIZE);
        gm.write_plain(0x10, &0x1122_3344_5566_7788u64).unwrap();
        assert_eq!(gm.read_plain::<u64>(0x10).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(gm.read_plain::<u8>(0x10).unwrap(), 0x88);
        gm.read_plain::<[u8; 2]>(PAGE_SIZE64 - 1).unwrap_err();
        gm.write_plain(PAGE_SIZE64 - 4, &0u64).unwrap_err();

        // A failed write leaves memory untouched.
        assert_eq!(gm.read_plain::<u32>(PAGE_SIZE64 - 4).unwrap(), 0);

        gm.fill_at(0x100, 0x42, 4).unwrap();
        assert_eq!(gm.read_plain::<[u8; 5]>(0x100).unwrap(), [0x42, 0x42, 0x42, 0x42, 0]);
    }

    #[test]
    fn test_host_address() {
        let gm = GuestMemory::allocate(PAGE_SIZE);
        let base = gm.host_address(0, 1).unwrap();
        let p = gm.host_address(0x20, 8).unwrap();
        assert_eq!(p.as_ptr() as usize - base.as_ptr() as usize, 0x20);
        gm.host_address(PAGE_SIZE64, 1).unwrap_err();
    }

    #[test]
    fn test_read_cstr() {
        let gm = GuestMemory::allocate(PAGE_SIZE);
        gm.write_at(0x40, b"mlx5_0\0junk").unwrap();
        assert_eq!(gm.read_cstr(0x40, 64).unwrap(), b"mlx5_0");
        assert_eq!(gm.read_cstr(0x40, 3).unwrap(), b"mlx");

        // Unterminated at the end of memory.
        gm.write_at(PAGE_SIZE64 - 2, b"ab").unwrap();
        assert_eq!(gm.read_cstr(PAGE_SIZE64 - 2, 64).unwrap(), b"ab");
        gm.read_cstr(PAGE_SIZE64, 64).unwrap_err();
    }

    #[test]
    fn test_raw_mapping() {
        let mut buf = vec![0u8; 64];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        // SAFETY: `buf` outlives `gm` and is not otherwise accessed until
        // `gm` is dropped.
        let gm = unsafe { GuestMemory::from_raw("raw", base, buf.len()) };
        gm.write_plain(8, &0xabcdu16).unwrap();
        gm.write_plain(63, &0u16).unwrap_err();
        drop(gm);
        assert_eq!(&buf[8..10], &[0xcd, 0xab]);
    }

    #[test]
    fn test_clone_shares_mapping() {
        let gm = GuestMemory::allocate(PAGE_SIZE);
        let gm2 = gm.clone();
        gm.write_plain(0, &7u32).unwrap();
        assert_eq!(gm2.read_plain::<u32>(0).unwrap(), 7);
        let err = gm2.read_plain::<u32>(PAGE_SIZE64).unwrap_err();
        assert_eq!(err.gpa(), PAGE_SIZE64);
        assert!(err.to_string().contains("guest memory 'heap'"));
    }
}
