use std::ops::{Bound, Range, RangeBounds};

use super::{Mr, MrPin};
use crate::rdma::type_alias::*;

/// A scatter/gather entry: one contiguous range of registered memory.
///
/// Same layout as `struct ibv_sge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: LKey,
}

/// Clip a range to the given upper-bound.
#[inline]
pub(super) fn clip_range(r: impl RangeBounds<usize>, upper: usize) -> Range<usize> {
    let start = match r.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match r.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => upper,
    };
    start..end
}

/// Slice of a local memory region.
///
/// A slice corresponds to an RDMA scatter-gather list entry, which can be used
/// in RDMA data-plane verbs.
///
/// **Subtyping:** [`MrSlice<'a>`] is *covariant* over `'a`.
#[derive(Debug, Clone, Copy)]
pub struct MrSlice<'a> {
    mr: &'a Mr,
    offset: usize,
    len: usize,
}

impl<'a> MrSlice<'a> {
    pub(super) fn new(mr: &'a Mr, offset: usize, len: usize) -> Self {
        Self { mr, offset, len }
    }

    /// Get the underlying `Mr`.
    #[inline]
    pub fn mr(&self) -> &'a Mr {
        self.mr
    }

    /// Get the offset of this slice from the start of the memory region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the starting address of this slice.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        (self.mr.addr() as usize + self.offset) as *mut u8
    }

    /// Attempt to resize the memory region slice to the specified length.
    /// This attempt has no effect if the desired length is greater
    /// than the largest possible length of the slice.
    /// Return whether the resize was successful.
    #[must_use = "must check if the resize was successful"]
    #[inline]
    pub fn resize(&mut self, len: usize) -> bool {
        let max_len = self.mr.len() - self.offset;
        if len <= max_len {
            self.len = len;
            true
        } else {
            false
        }
    }

    /// Get the scatter/gather entry describing this slice. The length
    /// saturates at `u32::MAX`; work submission rejects such slices.
    #[inline]
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.addr() as u64,
            len: u32::try_from(self.len).unwrap_or(u32::MAX),
            lkey: self.mr.lkey(),
        }
    }

    /// Pin the underlying registration until the returned guard is dropped.
    #[inline]
    pub(crate) fn pin(&self) -> MrPin {
        self.mr.pin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip() {
        assert_eq!(clip_range(.., 10), 0..10);
        assert_eq!(clip_range(2..=4, 10), 2..5);
        assert_eq!(clip_range(3.., 10), 3..10);
        assert_eq!(clip_range(..=usize::MAX, 10), 0..usize::MAX);
        assert_eq!(
            clip_range((Bound::Excluded(usize::MAX), Bound::Unbounded), 10),
            usize::MAX..10
        );
    }
}
