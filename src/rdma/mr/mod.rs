//! Memory regions.

mod perm;
mod slice;

use std::ops::RangeBounds;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::{fmt, io};

use thiserror::Error;

pub use self::perm::Permission;
pub use self::slice::{MrSlice, Sge};
use super::pd::Pd;
use super::type_alias::*;
use crate::provider::RawMr;

/// Memory registration error type.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Remote write and remote atomic access need local write access.
    #[error("unsupported access combination {0:?}")]
    UnsupportedAccess(Permission),

    /// Zero-length buffers cannot be registered.
    #[error("cannot register an empty buffer")]
    EmptyBuffer,

    /// Outstanding work requests still reference the registration.
    #[error("memory region is referenced by {0} outstanding work request(s)")]
    InUse(usize),

    /// `ibv_reg_mr` or `ibv_dereg_mr` call failed.
    #[error("I/O error from ibverbs")]
    IoError(#[from] io::Error),
}

/// Ownership holder of a registered buffer.
struct MrInner {
    pd: Pd,
    raw: RawMr,
    perm: Permission,
    buf: Option<NonNull<[u8]>>,
    live: bool,
    pins: AtomicUsize,
}

// SAFETY: the buffer is only accessed through `&mut Mr` or by the device.
unsafe impl Send for MrInner {}
unsafe impl Sync for MrInner {}

impl MrInner {
    fn dereg(&mut self) -> io::Result<()> {
        if self.live {
            self.pd.context().provider().dereg_mr(self.raw.handle)?;
            self.live = false;
            log::debug!("deregistered MR lkey {:#x}", self.raw.lkey);
        }
        Ok(())
    }

    fn take_buf(&mut self) -> Option<Box<[u8]>> {
        // SAFETY: produced by `Box::into_raw` and taken at most once.
        self.buf.take().map(|p| unsafe { Box::from_raw(p.as_ptr()) })
    }
}

impl Drop for MrInner {
    fn drop(&mut self) {
        match self.dereg() {
            Ok(()) => drop(self.take_buf()),
            Err(e) => {
                // The device may still access the buffer; leak it.
                log::error!("cannot deregister MR on drop, leaking its buffer: {}", e);
            }
        }
    }
}

/// Guard keeping a registration alive, and marked in use, while a work request
/// referencing it is outstanding.
pub(crate) struct MrPin(Arc<MrInner>);

impl MrPin {
    fn new(inner: &Arc<MrInner>) -> Self {
        inner.pins.fetch_add(1, Ordering::AcqRel);
        Self(inner.clone())
    }
}

impl Drop for MrPin {
    fn drop(&mut self) {
        self.0.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for MrPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MrPin").field(&self.0.raw.lkey).finish()
    }
}

/// Local memory region.
///
/// A memory region owns the host buffer it registers, so the buffer outlives
/// the registration by construction. Every work request posted through a
/// [`Qp`](crate::Qp) pins the regions it references until its completion is
/// reaped; while pinned, a region cannot be deregistered and its bytes cannot
/// be borrowed. Dropping a pinned `Mr` defers the deregistration until the
/// last pin is released.
pub struct Mr {
    inner: Arc<MrInner>,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &self.addr())
            .field("len", &self.len())
            .field("lkey", &self.lkey())
            .field("rkey", &self.rkey())
            .finish()
    }
}

impl Mr {
    /// Register a buffer with the given permissions, taking ownership of it.
    pub fn reg(pd: &Pd, buf: impl Into<Box<[u8]>>, perm: Permission) -> Result<Self, RegistrationError> {
        if !perm.is_valid_for_mr() {
            return Err(RegistrationError::UnsupportedAccess(perm));
        }
        let buf = buf.into();
        if buf.is_empty() {
            return Err(RegistrationError::EmptyBuffer);
        }

        let len = buf.len();
        let ptr = NonNull::from(Box::leak(buf));
        // SAFETY: the buffer is owned by the `MrInner` built below and freed
        // only after deregistration.
        let raw = unsafe {
            pd.context()
                .provider()
                .reg_mr(pd.handle(), ptr.as_ptr() as *mut u8, len, perm)
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                // SAFETY: leaked above and never registered.
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
                return Err(e.into());
            }
        };

        log::debug!(
            "registered MR of {} bytes, lkey {:#x}, {:?}",
            len,
            raw.lkey,
            perm
        );
        Ok(Self {
            inner: Arc::new(MrInner {
                pd: pd.clone(),
                raw,
                perm,
                buf: Some(ptr),
                live: true,
                pins: AtomicUsize::new(0),
            }),
        })
    }

    /// Allocate and register a zeroed buffer of `len` bytes.
    pub fn alloc(pd: &Pd, len: usize, perm: Permission) -> Result<Self, RegistrationError> {
        Self::reg(pd, vec![0u8; len], perm)
    }

    /// Deregister this memory region and give the buffer back.
    ///
    /// Fails with [`RegistrationError::InUse`] while outstanding work requests
    /// reference the region; the region is then handed back untouched.
    pub fn deregister(self) -> Result<Box<[u8]>, (Mr, RegistrationError)> {
        let pins = self.pins();
        if pins > 0 {
            return Err((self, RegistrationError::InUse(pins)));
        }
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(inner) => {
                let pins = inner.pins.load(Ordering::Acquire);
                return Err((Mr { inner }, RegistrationError::InUse(pins.max(1))));
            }
        };
        if let Err(e) = inner.dereg() {
            return Err((
                Mr {
                    inner: Arc::new(inner),
                },
                e.into(),
            ));
        }
        Ok(inner.take_buf().unwrap_or_default())
    }

    /// Get the underlying [`Pd`].
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.inner
            .buf
            .map_or(std::ptr::null_mut(), |p| p.as_ptr() as *mut u8)
    }

    /// Get the length of the registered memory area.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.inner.buf.map_or(0, |p| p.len())
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.inner.raw.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.inner.raw.rkey
    }

    /// Get the permissions the memory region was registered with.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.inner.perm
    }

    /// Get the number of outstanding work requests referencing this region.
    #[inline]
    pub fn pins(&self) -> usize {
        self.inner.pins.load(Ordering::Acquire)
    }

    /// Get a slice that represents the entire memory region.
    #[inline]
    pub fn as_slice(&self) -> MrSlice<'_> {
        MrSlice::new(self, 0, self.len())
    }

    /// Get a slice from an offset and a length.
    /// Return `None` if the range is out of bounds.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> Option<MrSlice<'_>> {
        (offset < self.len() && len <= self.len() - offset).then(|| MrSlice::new(self, offset, len))
    }

    /// Get a slice from a range.
    /// Return `None` if the range is out of bounds.
    #[inline]
    pub fn slice_by_range(&self, range: impl RangeBounds<usize>) -> Option<MrSlice<'_>> {
        let r = slice::clip_range(range, self.len());
        if r.start > r.end {
            return None;
        }
        self.slice(r.start, r.end - r.start)
    }

    /// Borrow the registered bytes. Fails while work requests are outstanding.
    pub fn bytes(&mut self) -> Result<&[u8], RegistrationError> {
        match self.pins() {
            // SAFETY: no posted request references the buffer.
            0 => Ok(unsafe { self.bytes_unchecked() }),
            n => Err(RegistrationError::InUse(n)),
        }
    }

    /// Mutably borrow the registered bytes. Fails while work requests are
    /// outstanding.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8], RegistrationError> {
        match self.pins() {
            // SAFETY: `&mut self` excludes new posts, and no posted request
            // references the buffer.
            0 => Ok(unsafe { std::slice::from_raw_parts_mut(self.addr(), self.len()) }),
            n => Err(RegistrationError::InUse(n)),
        }
    }

    /// Borrow the registered bytes regardless of outstanding work requests.
    ///
    /// # Safety
    ///
    /// The device may write to the memory concurrently; the caller must ensure
    /// no outstanding receive targets the region for the lifetime of the slice.
    pub unsafe fn bytes_unchecked(&self) -> &[u8] {
        std::slice::from_raw_parts(self.addr(), self.len())
    }

    pub(crate) fn pin(&self) -> MrPin {
        MrPin::new(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::SoftFabric;
    use crate::Context;

    fn pd() -> Pd {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), 1, 0).unwrap();
        Pd::new(&ctx).unwrap()
    }

    #[test]
    fn reg_and_deregister_returns_buffer() {
        let pd = pd();
        let mut mr = Mr::reg(&pd, b"hello".to_vec(), Permission::default()).unwrap();
        assert_eq!(mr.len(), 5);
        assert_ne!(mr.lkey(), 0);
        assert_eq!(mr.bytes().unwrap(), b"hello");
        mr.bytes_mut().unwrap()[0] = b'j';
        let buf = mr.deregister().unwrap();
        assert_eq!(&*buf, b"jello");
    }

    #[test]
    fn reject_bad_requests() {
        let pd = pd();
        assert!(matches!(
            Mr::reg(&pd, Vec::<u8>::new(), Permission::default()),
            Err(RegistrationError::EmptyBuffer)
        ));
        assert!(matches!(
            Mr::alloc(&pd, 8, Permission::REMOTE_WRITE),
            Err(RegistrationError::UnsupportedAccess(_))
        ));
    }

    #[test]
    fn pinned_region_refuses_deregistration() {
        let pd = pd();
        let mut mr = Mr::alloc(&pd, 16, Permission::default()).unwrap();
        let pin = mr.pin();
        assert_eq!(mr.pins(), 1);
        assert!(matches!(mr.bytes(), Err(RegistrationError::InUse(1))));

        let (mr, err) = mr.deregister().unwrap_err();
        assert!(matches!(err, RegistrationError::InUse(1)));
        drop(pin);
        assert_eq!(mr.deregister().unwrap().len(), 16);
    }

    #[test]
    fn slicing() {
        let pd = pd();
        let mr = Mr::alloc(&pd, 64, Permission::default()).unwrap();
        assert_eq!(mr.as_slice().len(), 64);
        let s = mr.slice(8, 16).unwrap();
        assert_eq!(s.sge().addr, mr.addr() as u64 + 8);
        assert_eq!(s.sge().len, 16);
        assert_eq!(s.sge().lkey, mr.lkey());
        assert!(mr.slice(64, 1).is_none());
        assert!(mr.slice(60, 8).is_none());
        assert_eq!(mr.slice_by_range(4..=7).unwrap().len(), 4);
        assert!(mr.slice_by_range(8..4).is_none());
        assert!(mr.slice_by_range(..=usize::MAX).is_none());
        assert!(mr.slice_by_range(usize::MAX..).is_none());
    }
}
