use std::io;
use std::sync::Arc;

use super::context::Context;
use crate::provider::PdHandle;

#[derive(Debug)]
struct PdInner {
    ctx: Context,
    handle: PdHandle,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.provider().dealloc_pd(self.handle) {
            log::error!("cannot deallocate PD on drop: {}", e);
        }
    }
}

/// Protection domain.
///
/// This type is a simple wrapper of an `Arc` and is guaranteed to have the
/// same memory layout with it. Memory registrations and queue pairs keep their
/// protection domain alive.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    /// Allocate a protection domain on the given context.
    pub fn new(ctx: &Context) -> io::Result<Self> {
        let handle = ctx.provider().alloc_pd()?;
        Ok(Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                handle,
            }),
        })
    }

    /// Get the provider handle of this protection domain.
    #[inline]
    pub fn handle(&self) -> PdHandle {
        self.inner.handle
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::soft::SoftFabric;

    #[test]
    fn alloc() {
        let fabric = SoftFabric::new();
        let ctx = Context::new(fabric.open_device(), 1, 0).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let other = Pd::new(&ctx).unwrap();
        assert_ne!(pd.handle(), other.handle());
        assert_eq!(pd.context().port_num(), 1);
    }
}
